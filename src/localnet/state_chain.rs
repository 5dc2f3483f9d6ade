//! Control chain runtime: governance, vault rotation, safe mode

use super::chain::{ExtrinsicContext, Runtime};
use super::RuntimeEvent;
use crate::chain::{AccountId, ChainId};
use crate::events::{names, vault_event, vault_pallet};
use crate::tx::{GovernanceCall, RuntimeCall, SafeModeUpdate};

use sha3::{Digest, Keccak256};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

pub struct StateChainRuntime {
    governance: AccountId,
    keygen_delay_blocks: u64,
    /// Vault chains taking part in key generation
    answering: Vec<ChainId>,
    initialized: BTreeSet<ChainId>,
    epoch: u64,
    rotation_due: Option<u64>,
    /// Keys generated in the current rotation, awaiting activation
    pending_keys: BTreeMap<ChainId, Vec<u8>>,
    activated: BTreeSet<ChainId>,
    safe_mode: SafeModeUpdate,
    proposals: u64,
}

/// Deterministic stand-in for the key a vault chain's keygen would produce
pub fn generated_key(chain: ChainId, epoch: u64) -> Vec<u8> {
    let hash = Keccak256::digest(format!("{}-keygen-{}", chain, epoch).as_bytes());
    match chain {
        // Compressed secp256k1 point
        ChainId::Arbitrum | ChainId::Ethereum => {
            let mut key = vec![0x02 | (hash[31] & 1)];
            key.extend_from_slice(&hash);
            key
        }
        _ => hash.to_vec(),
    }
}

impl StateChainRuntime {
    pub fn new(governance: AccountId, keygen_delay_blocks: u64, answering: Vec<ChainId>) -> Self {
        Self {
            governance,
            keygen_delay_blocks,
            answering,
            initialized: BTreeSet::new(),
            epoch: 0,
            rotation_due: None,
            pending_keys: BTreeMap::new(),
            activated: BTreeSet::new(),
            safe_mode: SafeModeUpdate::CodeGreen,
            proposals: 0,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn safe_mode(&self) -> &SafeModeUpdate {
        &self.safe_mode
    }

    pub fn is_initialized(&self, chain: ChainId) -> bool {
        self.initialized.contains(&chain)
    }

    fn execute(
        &mut self,
        call: &GovernanceCall,
        at: ExtrinsicContext,
        events: &mut Vec<RuntimeEvent>,
    ) -> Result<(), String> {
        match call {
            GovernanceCall::InitializeChain(chain) => {
                if !self.initialized.insert(*chain) {
                    return Err(format!("{}.AlreadyInitialized", vault_pallet(*chain)));
                }
                events.push(RuntimeEvent::new(vault_event(*chain, names::CHAIN_INITIALIZED)));
            }
            GovernanceCall::ForceRotation => {
                if self.rotation_due.is_some() || !self.pending_keys.is_empty() {
                    return Err("validator.RotationInProgress".to_string());
                }
                self.rotation_due = Some(at.block_number + self.keygen_delay_blocks);
                events.push(
                    RuntimeEvent::new("validator:RotationPhaseUpdated")
                        .with("newPhase", "KeygensInProgress"),
                );
            }
            GovernanceCall::WitnessPolkadotVaultCreation {
                vault,
                block_number,
                extrinsic_index,
            } => {
                events.push(
                    RuntimeEvent::new("environment:PolkadotVaultAccountSet")
                        .with("polkadotVaultAccountId", vault)
                        .with("blockNumber", *block_number)
                        .with("extrinsicIndex", *extrinsic_index),
                );
                self.activate(ChainId::Polkadot, events)?;
            }
            GovernanceCall::WitnessCurrentBitcoinBlockNumberForKey { block_number, key } => {
                if self.pending_keys.get(&ChainId::Bitcoin) != Some(key) {
                    return Err("bitcoinVault.KeyMismatch".to_string());
                }
                debug!("Bitcoin vault activated at height {}", block_number);
                self.activate(ChainId::Bitcoin, events)?;
            }
            GovernanceCall::WitnessInitializeArbitrumVault { block_number } => {
                if !self.initialized.contains(&ChainId::Arbitrum) {
                    return Err("arbitrumVault.ChainNotInitialized".to_string());
                }
                debug!("Arbitrum vault activated at block {}", block_number);
                self.activate(ChainId::Arbitrum, events)?;
            }
            GovernanceCall::UpdateSafeMode(update) => {
                self.safe_mode = update.clone();
                events.push(
                    RuntimeEvent::new(names::SAFE_MODE_UPDATED).with("safeMode", update.code()),
                );
            }
        }
        Ok(())
    }

    /// Activate a chain's pending key; the last activation starts the new epoch
    fn activate(&mut self, chain: ChainId, events: &mut Vec<RuntimeEvent>) -> Result<(), String> {
        if !self.pending_keys.contains_key(&chain) {
            return Err(format!("{}.NoActiveRotation", vault_pallet(chain)));
        }
        if !self.activated.insert(chain) {
            return Err(format!("{}.AlreadyActivated", vault_pallet(chain)));
        }
        events.push(RuntimeEvent::new(vault_event(chain, names::VAULT_ACTIVATION_COMPLETED)));

        if self.pending_keys.keys().all(|c| self.activated.contains(c)) {
            self.epoch += 1;
            self.pending_keys.clear();
            self.activated.clear();
            events.push(RuntimeEvent::new(names::NEW_EPOCH).with("epochIndex", self.epoch));
        }
        Ok(())
    }
}

impl Runtime for StateChainRuntime {
    fn chain(&self) -> ChainId {
        ChainId::StateChain
    }

    fn on_initialize(&mut self, block_number: u64) -> Vec<RuntimeEvent> {
        match self.rotation_due {
            Some(due) if due <= block_number => {
                self.rotation_due = None;
                let next_epoch = self.epoch + 1;
                self.answering
                    .iter()
                    .map(|chain| {
                        let key = generated_key(*chain, next_epoch);
                        self.pending_keys.insert(*chain, key.clone());
                        RuntimeEvent::new(vault_event(*chain, names::AWAITING_GOVERNANCE_ACTIVATION))
                            .with("newPublicKey", key)
                    })
                    .collect()
            }
            _ => Vec::new(),
        }
    }

    fn dispatch(
        &mut self,
        origin: &AccountId,
        call: &RuntimeCall,
        at: ExtrinsicContext,
    ) -> Result<Vec<RuntimeEvent>, String> {
        let RuntimeCall::Governance(call) = call else {
            return Err(format!("{} is not available on the state chain", call.kind()));
        };
        if origin != &self.governance {
            return Err("governance.NotMember".to_string());
        }

        self.proposals += 1;
        let proposal_id = self.proposals;

        // Keep state untouched on failure
        let initialized = self.initialized.clone();
        let pending_keys = self.pending_keys.clone();
        let activated = self.activated.clone();
        let rotation_due = self.rotation_due;

        let mut events = vec![RuntimeEvent::new("governance:Proposed").with("proposalId", proposal_id)];
        if let Err(error) = self.execute(call, at, &mut events) {
            self.proposals -= 1;
            self.initialized = initialized;
            self.pending_keys = pending_keys;
            self.activated = activated;
            self.rotation_due = rotation_due;
            return Err(error);
        }
        events.push(RuntimeEvent::new(names::PROPOSAL_EXECUTED).with("proposalId", proposal_id));
        Ok(events)
    }
}
