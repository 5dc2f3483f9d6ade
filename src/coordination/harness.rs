//! Connects the harness to its chains

use super::engine::{SetupParams, VaultSetup};
use crate::chain::{
    BitcoinRpc, BitcoinRpcClient, ChainId, ChainManager, EventObserver, EvmChain, EvmClient,
    Keypair, SolanaPrograms, SubstrateApi,
};
use crate::config::{Backend, Settings};
use crate::error::{HarnessError, HarnessResult};
use crate::helpers::{no_substrate_backend, Asset, AssetSender};
use crate::localnet::Localnet;
use crate::tx::{ExtrinsicSubmitter, GovernanceSubmitter, NonceManager};

use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

/// Clients shared by every harness command, all backed by one localnet
pub struct Harness {
    pub chains: Arc<ChainManager>,
    pub observer: EventObserver,
    pub governance: Arc<GovernanceSubmitter>,
    pub polkadot: Arc<ExtrinsicSubmitter>,
    pub bitcoin: Arc<dyn BitcoinRpc>,
    pub arbitrum: Arc<dyn EvmChain>,
    pub ethereum: Arc<dyn EvmChain>,
    pub solana: Option<Arc<dyn SolanaPrograms>>,
    localnet: Arc<Localnet>,
}

impl Harness {
    /// Start a localnet and connect to it. Fails before starting anything if
    /// a peripheral chain is configured with an RPC backend.
    pub async fn start_localnet(settings: &Settings) -> HarnessResult<Self> {
        settings.validate_localnet()?;
        let localnet = Arc::new(Localnet::new(settings));
        localnet.start();
        Self::connect_localnet(settings, localnet).await
    }

    /// Connect to an already running localnet
    pub async fn connect_localnet(settings: &Settings, localnet: Arc<Localnet>) -> HarnessResult<Self> {
        settings.validate_localnet()?;

        let chains = Arc::new(ChainManager::new(&settings.harness));
        chains.register(localnet.state_chain.clone());
        chains.register(localnet.polkadot.clone());
        chains.start_listeners().await?;

        let policy = settings.harness.inclusion;
        let state_chain: Arc<dyn SubstrateApi> = localnet.state_chain.clone();
        let governance = GovernanceSubmitter::new(ExtrinsicSubmitter::new(
            state_chain,
            Keypair::from_uri(settings.accounts.governance_uri.clone()),
            Arc::new(NonceManager::new(ChainId::StateChain)),
            policy,
        ));
        let relay: Arc<dyn SubstrateApi> = localnet.polkadot.clone();
        let polkadot = ExtrinsicSubmitter::new(
            relay,
            Keypair::from_uri(settings.accounts.funding_uri.clone()),
            Arc::new(NonceManager::new(ChainId::Polkadot)),
            policy,
        );

        let solana = settings
            .solana
            .as_ref()
            .map(|_| localnet.solana.clone() as Arc<dyn SolanaPrograms>);

        info!("Harness connected to {:?}", chains.connected_chains());
        Ok(Self {
            observer: EventObserver::new(chains.clone()),
            chains,
            governance: Arc::new(governance),
            polkadot: Arc::new(polkadot),
            bitcoin: localnet.bitcoin.clone(),
            arbitrum: localnet.arbitrum.clone(),
            ethereum: localnet.ethereum.clone(),
            solana,
            localnet,
        })
    }

    pub fn localnet(&self) -> &Arc<Localnet> {
        &self.localnet
    }

    pub fn vault_setup(&self, settings: &Settings) -> VaultSetup {
        let solana_agg_key = settings.solana.as_ref().map(|s| s.agg_key.clone());
        VaultSetup::new(
            self.observer.clone(),
            self.governance.clone(),
            self.polkadot.clone(),
            self.bitcoin.clone(),
            self.arbitrum.clone(),
            self.solana.clone(),
            SetupParams::from_config(&settings.setup, solana_agg_key),
        )
    }

    pub fn asset_sender(&self) -> AssetSender {
        AssetSender::new()
            .with_bitcoin(self.bitcoin.clone())
            .with_ethereum(self.ethereum.clone())
            .with_polkadot(self.polkadot.clone())
    }

    /// Drive `work` until it completes or `interrupt` fires, then shut down
    pub async fn run_until_interrupted<T>(
        &self,
        work: impl Future<Output = HarnessResult<T>>,
        interrupt: impl Future<Output = ()>,
    ) -> HarnessResult<T> {
        let outcome = tokio::select! {
            result = work => result,
            _ = interrupt => {
                warn!("Interrupted, abandoning in-flight waits");
                Err(HarnessError::Abandoned)
            }
        };
        self.shutdown().await;
        outcome
    }

    pub async fn shutdown(&self) {
        self.chains.stop().await;
        self.localnet.stop();
    }
}

/// Sender for `asset` over its configured RPC backend, without a control
/// chain. DOT always needs the Substrate side and is refused.
pub async fn rpc_asset_sender(settings: &Settings, asset: Asset) -> HarnessResult<AssetSender> {
    let needs_localnet =
        |chain: ChainId| HarnessError::Config(format!("{} uses the localnet backend; pass --localnet", chain));

    match asset {
        Asset::Dot => Err(no_substrate_backend()),
        Asset::Btc => match settings.bitcoin.backend {
            Backend::Rpc => {
                let client: Arc<dyn BitcoinRpc> = Arc::new(BitcoinRpcClient::connect(&settings.bitcoin)?);
                Ok(AssetSender::new().with_bitcoin(client))
            }
            Backend::Localnet => Err(needs_localnet(ChainId::Bitcoin)),
        },
        Asset::Eth | Asset::Usdc | Asset::Flip => match settings.ethereum.backend {
            Backend::Rpc => {
                let client: Arc<dyn EvmChain> =
                    Arc::new(EvmClient::connect(ChainId::Ethereum, &settings.ethereum).await?);
                Ok(AssetSender::new().with_ethereum(client))
            }
            Backend::Localnet => Err(needs_localnet(ChainId::Ethereum)),
        },
    }
}
