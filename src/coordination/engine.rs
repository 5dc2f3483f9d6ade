//! Vault setup orchestrator
//!
//! Drives the one-time multi-chain vault setup as an explicit state machine.
//! Each transition submits what its phase needs and waits for the on-chain
//! confirmations the next phase depends on.

use super::phase::{
    PhaseTiming, SetupOutcome, SetupReport, SetupState, VaultAccount, VaultKeys,
};
use crate::chain::{AccountId, BitcoinRpc, ChainId, EventObserver, EvmChain, SolanaPrograms};
use crate::config::SetupConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::events::{names, vault_event, ChainEvent, EventFilter};
use crate::tx::{
    ExtrinsicSubmitter, GovernanceCall, GovernanceSubmitter, ProxyType, RuntimeCall,
};

use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

/// Amounts and proxy settings used by the funding phase
#[derive(Debug, Clone)]
pub struct SetupParams {
    pub vault_funding: u128,
    pub key_funding: u128,
    pub proxy_type: ProxyType,
    /// Aggregate key for Solana program initialisation, when Solana is set up
    pub solana_agg_key: Option<String>,
}

impl SetupParams {
    pub fn from_config(setup: &SetupConfig, solana_agg_key: Option<String>) -> Self {
        Self {
            vault_funding: u128::from(setup.vault_funding),
            key_funding: u128::from(setup.key_funding),
            proxy_type: setup.proxy_type,
            solana_agg_key,
        }
    }
}

/// Multi-chain vault setup workflow
pub struct VaultSetup {
    observer: EventObserver,
    /// Governance authority on the state chain
    governance: Arc<GovernanceSubmitter>,
    /// Funding authority on the relay chain
    polkadot: Arc<ExtrinsicSubmitter>,
    bitcoin: Arc<dyn BitcoinRpc>,
    arbitrum: Arc<dyn EvmChain>,
    solana: Option<Arc<dyn SolanaPrograms>>,
    params: SetupParams,
    run_id: Uuid,
}

impl VaultSetup {
    pub fn new(
        observer: EventObserver,
        governance: Arc<GovernanceSubmitter>,
        polkadot: Arc<ExtrinsicSubmitter>,
        bitcoin: Arc<dyn BitcoinRpc>,
        arbitrum: Arc<dyn EvmChain>,
        solana: Option<Arc<dyn SolanaPrograms>>,
        params: SetupParams,
    ) -> Self {
        Self {
            observer,
            governance,
            polkadot,
            bitcoin,
            arbitrum,
            solana,
            params,
            run_id: Uuid::new_v4(),
        }
    }

    /// Run every phase in order. Any failure aborts the run; nothing already
    /// submitted is undone.
    pub async fn run(&self) -> HarnessResult<SetupReport> {
        let span = info_span!("vault_setup", run_id = %self.run_id);
        async move {
            info!("=== Performing initial Vault setup ===");
            let started_at = Utc::now();
            let mut phases = Vec::new();
            let mut state = SetupState::ArbitrumChainInit;

            while !state.is_done() {
                let phase = state.name();
                crate::metrics::record_setup_phase(state.ordinal());
                let started = Instant::now();

                state = match self.advance(state).await {
                    Ok(next) => next,
                    Err(e) => {
                        error!("Vault setup failed in phase {}: {}", phase, e);
                        return Err(e);
                    }
                };
                phases.push(PhaseTiming {
                    phase: phase.to_string(),
                    duration_ms: started.elapsed().as_millis() as u64,
                });
            }
            crate::metrics::record_setup_phase(state.ordinal());

            let SetupState::Done(outcome) = state else {
                return Err(HarnessError::Internal("setup ended outside Done".to_string()));
            };
            let report = SetupReport::new(self.run_id, started_at, phases, &outcome);
            match serde_json::to_string(&report) {
                Ok(json) => info!(report = %json, "Vault setup report"),
                Err(e) => error!("Failed to serialize setup report: {}", e),
            }
            info!("=== Vault Setup completed ===");
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Execute the phase `state` names and return the state after it
    pub async fn advance(&self, state: SetupState) -> HarnessResult<SetupState> {
        match state {
            SetupState::ArbitrumChainInit => {
                self.initialize_arbitrum_chain().await?;
                Ok(SetupState::RotationRequested)
            }
            SetupState::RotationRequested => {
                let rotation_block = self.force_rotation().await?;
                Ok(SetupState::AwaitingKeys { rotation_block })
            }
            SetupState::AwaitingKeys { rotation_block } => {
                let keys = self.await_keys(rotation_block).await?;
                Ok(SetupState::VaultCreated { keys })
            }
            SetupState::VaultCreated { keys } => {
                let vault = self.create_polkadot_vault().await?;
                Ok(SetupState::ProxyRotatedAndFunded { keys, vault })
            }
            SetupState::ProxyRotatedAndFunded { keys, vault } => {
                let vault_block = self.rotate_proxy_and_fund(&keys, &vault).await?;
                Ok(SetupState::ContractsInitialized {
                    keys,
                    vault,
                    vault_block,
                })
            }
            SetupState::ContractsInitialized {
                keys,
                vault,
                vault_block,
            } => {
                self.initialize_contracts(&keys).await?;
                Ok(SetupState::VaultsRegistered {
                    keys,
                    vault,
                    vault_block,
                })
            }
            SetupState::VaultsRegistered {
                keys,
                vault,
                vault_block,
            } => {
                let registration_block = self.register_vaults(&keys, &vault, vault_block).await?;
                Ok(SetupState::EpochConfirmed {
                    keys,
                    vault,
                    vault_block,
                    registration_block,
                })
            }
            SetupState::EpochConfirmed {
                keys,
                vault,
                vault_block,
                registration_block,
            } => {
                let epoch = self.await_new_epoch(registration_block).await?;
                Ok(SetupState::Done(SetupOutcome {
                    keys,
                    vault,
                    vault_block,
                    epoch,
                }))
            }
            SetupState::Done(_) => Err(HarnessError::Internal(
                "vault setup has already completed".to_string(),
            )),
        }
    }

    /// Phase 1
    async fn initialize_arbitrum_chain(&self) -> HarnessResult<()> {
        info!("Initializing Arbitrum chain");
        let initialized = self.observer.observe(
            ChainId::StateChain,
            EventFilter::new(vault_event(ChainId::Arbitrum, names::CHAIN_INITIALIZED)),
        )?;
        self.governance
            .submit(|_| Ok(GovernanceCall::InitializeChain(ChainId::Arbitrum)))
            .await?;
        initialized.await?;
        Ok(())
    }

    /// Phase 2, returns the block the rotation request landed in
    async fn force_rotation(&self) -> HarnessResult<u64> {
        info!("Forcing rotation");
        let result = self
            .governance
            .submit(|_| Ok(GovernanceCall::ForceRotation))
            .await?;
        Ok(result.block_number)
    }

    /// Phase 3: every vault chain must report its new key
    async fn await_keys(&self, rotation_block: u64) -> HarnessResult<VaultKeys> {
        info!("Waiting for new keys");
        let activation = |chain: ChainId| {
            self.observer.observe_from(
                ChainId::StateChain,
                EventFilter::new(vault_event(chain, names::AWAITING_GOVERNANCE_ACTIVATION)),
                rotation_block,
            )
        };
        let dot = activation(ChainId::Polkadot)?;
        let btc = activation(ChainId::Bitcoin)?;
        let arb = activation(ChainId::Arbitrum)?;

        let (dot, btc, arb) = tokio::try_join!(dot, btc, arb)?;
        Ok(VaultKeys {
            polkadot: new_public_key(&dot)?,
            bitcoin: new_public_key(&btc)?,
            arbitrum: new_public_key(&arb)?,
        })
    }

    /// Phase 4
    async fn create_polkadot_vault(&self) -> HarnessResult<VaultAccount> {
        info!("Requesting Polkadot Vault creation");
        let result = self
            .polkadot
            .submit_and_wait(RuntimeCall::CreatePure {
                proxy_type: self.params.proxy_type,
                delay: 0,
                index: 0,
            })
            .await?;

        let created = result.require_event(ChainId::Polkadot, names::PURE_CREATED)?;
        let address = created
            .require("pure")?
            .as_str()
            .map(AccountId::new)
            .ok_or_else(|| missing(created, "pure"))?;

        info!("Polkadot Vault created: {}", address);
        Ok(VaultAccount {
            address,
            block_number: result.block_number,
            extrinsic_index: result.extrinsic_index,
        })
    }

    /// Phase 5: fund both accounts and hand the vault to the new key in one
    /// atomic batch. Returns the block where the new proxy took effect.
    async fn rotate_proxy_and_fund(&self, keys: &VaultKeys, vault: &VaultAccount) -> HarnessResult<u64> {
        info!("Rotating Proxy and Funding Accounts.");
        let key_account = AccountId::from_public_key(&keys.polkadot);
        let funder = self.polkadot.account().clone();
        let proxy_type = self.params.proxy_type;

        let proxy_added = self.observer.observe(
            ChainId::Polkadot,
            EventFilter::new(names::PROXY_ADDED)
                .with("delegator", &vault.address)
                .with("delegatee", &key_account),
        )?;

        let rotation = RuntimeCall::Proxy {
            real: vault.address.clone(),
            call: Box::new(RuntimeCall::BatchAll(vec![
                RuntimeCall::AddProxy {
                    delegate: key_account.clone(),
                    proxy_type,
                    delay: 0,
                },
                RuntimeCall::RemoveProxy {
                    delegate: funder,
                    proxy_type,
                    delay: 0,
                },
            ])),
        };
        // The vault must be funded before it is rotated
        let batch = RuntimeCall::BatchAll(vec![
            RuntimeCall::Transfer {
                dest: vault.address.clone(),
                amount: self.params.vault_funding,
            },
            RuntimeCall::Transfer {
                dest: key_account,
                amount: self.params.key_funding,
            },
            rotation,
        ]);

        let (_, added) = tokio::try_join!(self.polkadot.submit_and_wait(batch), proxy_added)?;
        Ok(added.block_number)
    }

    /// Phase 6
    async fn initialize_contracts(&self, keys: &VaultKeys) -> HarnessResult<()> {
        info!("Inserting Arbitrum key in the contracts");
        self.arbitrum.set_agg_key_with_gov_key(&keys.arbitrum).await?;

        if let (Some(solana), Some(agg_key)) = (&self.solana, &self.params.solana_agg_key) {
            info!("Initializing Solana programs");
            solana.initialize_programs(agg_key).await?;
        }
        Ok(())
    }

    /// Phase 7, returns the block of the first registration
    async fn register_vaults(
        &self,
        keys: &VaultKeys,
        vault: &VaultAccount,
        vault_block: u64,
    ) -> HarnessResult<u64> {
        info!("Registering Vaults with state chain");
        let first = self
            .governance
            .submit(|_| {
                Ok(GovernanceCall::WitnessPolkadotVaultCreation {
                    vault: vault.address.clone(),
                    block_number: vault_block,
                    extrinsic_index: vault.extrinsic_index,
                })
            })
            .await?;

        let btc_height = self.bitcoin.block_count().await?;
        self.governance
            .submit(|_| {
                Ok(GovernanceCall::WitnessCurrentBitcoinBlockNumberForKey {
                    block_number: btc_height,
                    key: keys.bitcoin.clone(),
                })
            })
            .await?;

        let arb_height = self.arbitrum.block_number().await?;
        self.governance
            .submit(|_| {
                Ok(GovernanceCall::WitnessInitializeArbitrumVault {
                    block_number: arb_height,
                })
            })
            .await?;

        Ok(first.block_number)
    }

    /// Phase 8
    async fn await_new_epoch(&self, registration_block: u64) -> HarnessResult<u64> {
        info!("Waiting for new epoch...");
        let event = self
            .observer
            .observe_from(
                ChainId::StateChain,
                EventFilter::new(names::NEW_EPOCH),
                registration_block,
            )?
            .await?;
        let epoch = event
            .require("epochIndex")?
            .as_u64()
            .ok_or_else(|| missing(&event, "epochIndex"))?;
        info!("=== New Epoch {} ===", epoch);
        Ok(epoch)
    }
}

fn missing(event: &ChainEvent, attribute: &str) -> HarnessError {
    HarnessError::MissingEvidence {
        chain: event.chain,
        event: event.name.clone(),
        attribute: attribute.to_string(),
    }
}

fn new_public_key(event: &ChainEvent) -> HarnessResult<Vec<u8>> {
    event
        .require("newPublicKey")?
        .as_bytes()
        .map(<[u8]>::to_vec)
        .ok_or_else(|| missing(event, "newPublicKey"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Settings, DOT_PLANCK};
    use crate::coordination::Harness;
    use crate::chain::Keypair;
    use crate::localnet::{dev_account, generated_key, pure_account, ExtrinsicContext, Localnet};
    use crate::tx::CallKind;
    use std::time::Duration;

    fn settings(answering: Vec<ChainId>) -> Settings {
        let mut settings = Settings::default();
        settings.localnet.block_time_ms = 100;
        settings.localnet.answering_chains = answering;
        settings
    }

    async fn start(settings: &Settings) -> (Arc<Localnet>, Harness) {
        let localnet = Arc::new(Localnet::new(settings));
        localnet.start();
        let harness = Harness::connect_localnet(settings, localnet.clone())
            .await
            .unwrap();
        (localnet, harness)
    }

    fn all_chains() -> Vec<ChainId> {
        vec![ChainId::Polkadot, ChainId::Bitcoin, ChainId::Arbitrum]
    }

    fn governance_calls(localnet: &Localnet) -> Vec<&'static str> {
        localnet
            .state_chain
            .included()
            .into_iter()
            .filter_map(|ext| match ext.call {
                RuntimeCall::Governance(call) if ext.success => Some(call.name()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn setup_reaches_done_with_one_extrinsic_per_step() {
        let settings = settings(all_chains());
        let (localnet, harness) = start(&settings).await;

        let report = harness.vault_setup(&settings).run().await.unwrap();
        assert_eq!(report.epoch, 1);
        assert_eq!(report.phases.len(), 8);

        assert_eq!(
            governance_calls(&localnet),
            vec![
                "initializeChain",
                "forceRotation",
                "witnessPolkadotVaultCreation",
                "witnessCurrentBitcoinBlockNumberForKey",
                "witnessInitializeArbitrumVault",
            ]
        );

        let relay_calls: Vec<CallKind> = localnet
            .polkadot
            .included()
            .iter()
            .map(|ext| ext.call.kind())
            .collect();
        assert_eq!(relay_calls, vec![CallKind::CreatePure, CallKind::BatchAll]);

        let vault = AccountId::new(report.polkadot_vault.clone());
        let key_account = AccountId::from_public_key(&generated_key(ChainId::Polkadot, 1));
        let (vault_balance, proxies) = localnet
            .polkadot
            .with_runtime(|r| (r.balance(&vault), r.proxies(&vault)));
        assert_eq!(vault_balance, 100 * u128::from(DOT_PLANCK));
        assert_eq!(proxies.len(), 1);
        assert_eq!(proxies[0].delegate, key_account);

        assert_eq!(
            localnet.arbitrum.agg_key(),
            Some(generated_key(ChainId::Arbitrum, 1))
        );
        harness.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn missing_bitcoin_key_blocks_at_the_join() {
        let settings = settings(vec![ChainId::Polkadot, ChainId::Arbitrum]);
        let (localnet, harness) = start(&settings).await;
        let setup = harness.vault_setup(&settings);

        let outcome = tokio::time::timeout(Duration::from_secs(60), setup.run()).await;
        assert!(outcome.is_err(), "setup must stay suspended");

        // Nothing after the join was attempted
        assert_eq!(governance_calls(&localnet), vec!["initializeChain", "forceRotation"]);
        assert!(localnet.polkadot.included().is_empty());
        harness.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_batch_leaves_no_partial_effects() {
        let settings = settings(all_chains());
        let (localnet, harness) = start(&settings).await;
        localnet
            .polkadot
            .with_runtime_mut(|r| r.inject_failure(Some(CallKind::RemoveProxy)));

        let result = harness.vault_setup(&settings).run().await;
        assert!(matches!(
            result,
            Err(HarnessError::Dispatch {
                chain: ChainId::Polkadot,
                ..
            })
        ));

        let included = localnet.polkadot.included();
        assert_eq!(included.len(), 2);
        assert!(!included[1].success);

        let funder = dev_account(&Keypair::from_uri(settings.accounts.funding_uri.clone()));
        let creation = ExtrinsicContext {
            block_number: included[0].block_number,
            extrinsic_index: included[0].extrinsic_index,
        };
        let vault = pure_account(&funder, creation, 0);
        let key_account = AccountId::from_public_key(&generated_key(ChainId::Polkadot, 1));
        localnet.polkadot.with_runtime(|r| {
            assert_eq!(r.balance(&vault), 0);
            assert_eq!(r.balance(&key_account), 0);
            assert_eq!(r.balance(&funder), u128::from(settings.localnet.endowment));
            let proxies = r.proxies(&vault);
            assert_eq!(proxies.len(), 1);
            assert_eq!(proxies[0].delegate, funder);
        });

        // Registration never happened
        assert_eq!(governance_calls(&localnet), vec!["initializeChain", "forceRotation"]);
        harness.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn completed_setup_cannot_advance() {
        let settings = settings(all_chains());
        let (_localnet, harness) = start(&settings).await;
        let setup = harness.vault_setup(&settings);

        let outcome = SetupOutcome {
            keys: VaultKeys {
                polkadot: vec![],
                bitcoin: vec![],
                arbitrum: vec![],
            },
            vault: VaultAccount {
                address: AccountId::new("0xvault"),
                block_number: 1,
                extrinsic_index: 0,
            },
            vault_block: 2,
            epoch: 1,
        };
        assert!(setup.advance(SetupState::Done(outcome)).await.is_err());
        harness.shutdown().await;
    }
}
