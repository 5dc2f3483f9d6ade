//! In-process simulated network
//!
//! Provides a control chain, a Polkadot relay chain and Bitcoin / EVM /
//! Solana endpoints implementing the same traits as the real backends, so
//! vault setup and the operator helpers run end to end without nodes.

mod chain;
mod peripherals;
mod polkadot;
mod state_chain;

pub use chain::{ExtrinsicContext, IncludedExtrinsic, LocalChain, Runtime};
pub use peripherals::{EvmTransfer, LocalBitcoin, LocalEvm, LocalSolana};
pub use polkadot::{pure_account, PolkadotRuntime, ProxyDefinition};
pub use state_chain::{generated_key, StateChainRuntime};

use crate::chain::{AccountId, ChainId, Keypair};
use crate::config::Settings;
use crate::events::EventValue;

use sha3::{Digest, Keccak256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Account a dev keypair signs as
pub fn dev_account(signer: &Keypair) -> AccountId {
    AccountId::from_public_key(&Keccak256::digest(signer.uri().as_bytes()))
}

/// Event as produced by a runtime, before block placement is known
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeEvent {
    pub name: String,
    pub attributes: BTreeMap<String, EventValue>,
}

impl RuntimeEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<EventValue>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }
}

/// Every simulated chain the harness talks to
pub struct Localnet {
    pub state_chain: Arc<LocalChain<StateChainRuntime>>,
    pub polkadot: Arc<LocalChain<PolkadotRuntime>>,
    pub bitcoin: Arc<LocalBitcoin>,
    pub arbitrum: Arc<LocalEvm>,
    pub ethereum: Arc<LocalEvm>,
    pub solana: Arc<LocalSolana>,
    block_time: Duration,
}

impl Localnet {
    pub fn new(settings: &Settings) -> Self {
        let governance = dev_account(&Keypair::from_uri(&settings.accounts.governance_uri));
        let funder = dev_account(&Keypair::from_uri(&settings.accounts.funding_uri));

        let mut relay = PolkadotRuntime::new();
        relay.endow(funder, u128::from(settings.localnet.endowment));

        Self {
            state_chain: Arc::new(LocalChain::new(StateChainRuntime::new(
                governance,
                settings.localnet.keygen_delay_blocks,
                settings.localnet.answering_chains.clone(),
            ))),
            polkadot: Arc::new(LocalChain::new(relay)),
            bitcoin: Arc::new(LocalBitcoin::new(100)),
            arbitrum: Arc::new(LocalEvm::new(ChainId::Arbitrum, 1)),
            ethereum: Arc::new(LocalEvm::new(ChainId::Ethereum, 1)),
            solana: Arc::new(LocalSolana::default()),
            block_time: Duration::from_millis(settings.localnet.block_time_ms),
        }
    }

    /// Start authoring blocks on the substrate chains
    pub fn start(&self) {
        self.state_chain.start(self.block_time);
        self.polkadot.start(self.block_time);
    }

    pub fn stop(&self) {
        self.state_chain.stop();
        self.polkadot.stop();
    }
}
