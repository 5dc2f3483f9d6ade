//! Chain module - collaborator interfaces and event feed plumbing
//!
//! This module provides:
//! - The traits every chain backend implements (event feeds, extrinsic
//!   submission, EVM / Bitcoin / Solana helpers)
//! - Per-chain listeners fanning finalized blocks out to observers
//! - The event observer used to await individual events
//! - `ethers`-backed EVM and Bitcoin RPC clients

pub mod bitcoin;
pub mod evm;
pub mod listener;
pub mod observer;

pub use bitcoin::BitcoinRpcClient;
pub use evm::EvmClient;
pub use listener::{ChainListener, FeedMessage};
pub use observer::EventObserver;

use crate::config::HarnessConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::events::ChainEvent;
use crate::tx::RuntimeCall;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Chains the harness talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainId {
    StateChain,
    Polkadot,
    Bitcoin,
    Ethereum,
    Arbitrum,
    Solana,
}

impl ChainId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainId::StateChain => "state_chain",
            ChainId::Polkadot => "polkadot",
            ChainId::Bitcoin => "bitcoin",
            ChainId::Ethereum => "ethereum",
            ChainId::Arbitrum => "arbitrum",
            ChainId::Solana => "solana",
        }
    }

    /// Prefix of the chain's pallets on the control chain
    pub fn pallet_prefix(&self) -> &'static str {
        match self {
            ChainId::StateChain => "stateChain",
            other => other.as_str(),
        }
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// On-chain account identifier (SS58 or hex, backend defined)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(pub String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn from_public_key(key: &[u8]) -> Self {
        Self(format!("0x{}", hex::encode(key)))
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Secret URI of a signer. Key derivation and signing belong to the backend.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Keypair {
    uri: String,
}

impl Keypair {
    pub fn from_uri(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Dev URIs are fine to print, real seeds are not
        if self.uri.starts_with("//") {
            write!(f, "Keypair({})", self.uri)
        } else {
            f.write_str("Keypair(<redacted>)")
        }
    }
}

/// All events of one finalized block, in emission order
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizedBlock {
    pub chain: ChainId,
    pub number: u64,
    pub events: Vec<ChainEvent>,
}

/// Where an extrinsic landed and what it emitted
#[derive(Debug, Clone, PartialEq)]
pub struct Inclusion {
    pub block_number: u64,
    pub extrinsic_index: u32,
    pub events: Vec<ChainEvent>,
    /// Set when the extrinsic was included but its dispatch failed
    pub dispatch_error: Option<String>,
}

/// Lifecycle updates for a submitted extrinsic
#[derive(Debug, Clone, PartialEq)]
pub enum TxStatus {
    Ready,
    Broadcast,
    InBlock(Inclusion),
    Finalized(Inclusion),
    Invalid(String),
    Dropped(String),
}

pub type BlockStream = BoxStream<'static, HarnessResult<FinalizedBlock>>;
pub type TxStatusStream = BoxStream<'static, HarnessResult<TxStatus>>;

/// A chain whose finalized events can be streamed and replayed
#[async_trait]
pub trait EventSource: Send + Sync {
    fn chain(&self) -> ChainId;

    /// Number of the latest finalized block
    async fn finalized_head(&self) -> HarnessResult<u64>;

    /// Events of an already finalized block
    async fn block_events(&self, number: u64) -> HarnessResult<Vec<ChainEvent>>;

    /// Finalized blocks produced from now on. The stream ends or yields an
    /// error when the connection is lost.
    async fn subscribe_finalized(&self) -> HarnessResult<BlockStream>;
}

/// Extrinsic construction and submission on a substrate-style chain
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SubstrateApi: Send + Sync {
    fn chain(&self) -> ChainId;

    fn account_id(&self, signer: &Keypair) -> AccountId;

    /// Next nonce the chain expects from `account`
    async fn account_nonce(&self, account: &AccountId) -> HarnessResult<u64>;

    /// Sign `call` with `signer` at `nonce`, submit it and follow its status
    async fn submit_and_watch(
        &self,
        signer: &Keypair,
        nonce: u64,
        call: RuntimeCall,
    ) -> HarnessResult<TxStatusStream>;
}

/// EVM chain operations used by setup and the send helpers
#[async_trait]
pub trait EvmChain: Send + Sync {
    fn chain(&self) -> ChainId;

    async fn block_number(&self) -> HarnessResult<u64>;

    /// Install a compressed secp256k1 aggregate key in the key manager
    async fn set_agg_key_with_gov_key(&self, agg_key: &[u8]) -> HarnessResult<String>;

    /// Transfer the native asset, `amount` in whole units (e.g. "1.5" ETH)
    async fn send_native(&self, to: &str, amount: &str) -> HarnessResult<String>;

    /// Transfer a configured ERC-20 token by symbol
    async fn send_erc20(&self, symbol: &str, to: &str, amount: &str) -> HarnessResult<String>;
}

#[async_trait]
pub trait BitcoinRpc: Send + Sync {
    async fn block_count(&self) -> HarnessResult<u64>;

    /// Returns the transaction id
    async fn send_to_address(&self, address: &str, amount: &str) -> HarnessResult<String>;
}

#[async_trait]
pub trait SolanaPrograms: Send + Sync {
    /// One-time initialisation of the vault programs with an aggregate key
    async fn initialize_programs(&self, agg_key: &str) -> HarnessResult<()>;
}

/// Event source plus the broadcast feed its listener publishes to
#[derive(Clone)]
pub struct ChainFeed {
    pub source: Arc<dyn EventSource>,
    pub sender: broadcast::Sender<FeedMessage>,
}

impl ChainFeed {
    pub fn subscribe(&self) -> broadcast::Receiver<FeedMessage> {
        self.sender.subscribe()
    }
}

/// Owns the event feeds of all registered chains
pub struct ChainManager {
    /// Feeds indexed by chain
    feeds: DashMap<ChainId, ChainFeed>,
    /// Listeners indexed by chain
    listeners: DashMap<ChainId, Arc<ChainListener>>,
    /// Running listener tasks
    handles: Mutex<Vec<JoinHandle<()>>>,
    feed_capacity: usize,
    reconnect_delay: Duration,
    /// Shutdown signal
    shutdown: Arc<RwLock<bool>>,
}

impl ChainManager {
    pub fn new(config: &HarnessConfig) -> Self {
        Self {
            feeds: DashMap::new(),
            listeners: DashMap::new(),
            handles: Mutex::new(Vec::new()),
            feed_capacity: config.feed_capacity,
            reconnect_delay: Duration::from_millis(config.reconnect_delay_ms),
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Register a chain's event source. Replaces any earlier registration.
    pub fn register(&self, source: Arc<dyn EventSource>) {
        let chain = source.chain();
        let (sender, _) = broadcast::channel(self.feed_capacity);
        let listener = ChainListener::new(source.clone(), sender.clone());

        self.feeds.insert(chain, ChainFeed { source, sender });
        self.listeners.insert(chain, Arc::new(listener));
        info!("Registered event feed for {}", chain);
    }

    /// Connect every listener, then keep them running in the background.
    ///
    /// Returns once all feeds are subscribed, so events finalized after this
    /// call are seen by observers created afterwards.
    pub async fn start_listeners(&self) -> HarnessResult<()> {
        let mut handles = self.handles.lock().await;
        let listeners: Vec<Arc<ChainListener>> =
            self.listeners.iter().map(|e| e.value().clone()).collect();

        for listener in listeners {
            let shutdown = self.shutdown.clone();
            let delay = self.reconnect_delay;
            let first = listener.connect().await?;

            let handle = tokio::spawn(async move {
                let mut stream = Some(first);
                loop {
                    if *shutdown.read().await {
                        break;
                    }

                    let result = match stream.take() {
                        Some(blocks) => listener.pump(blocks).await,
                        None => listener.listen().await,
                    };

                    if let Err(e) = result {
                        warn!("Listener error for {}: {}", listener.chain(), e);
                        listener.notify_disconnected(&e);
                        crate::metrics::record_feed_disconnect(listener.chain());
                        // Reconnect after delay
                        tokio::time::sleep(delay).await;
                    }
                }
            });

            handles.push(handle);
        }

        Ok(())
    }

    /// Feed of a specific chain
    pub fn feed(&self, chain: ChainId) -> HarnessResult<ChainFeed> {
        self.feeds
            .get(&chain)
            .map(|f| f.clone())
            .ok_or(HarnessError::ChainNotFound(chain))
    }

    /// Get all registered chains
    pub fn connected_chains(&self) -> Vec<ChainId> {
        let mut chains: Vec<ChainId> = self.feeds.iter().map(|e| *e.key()).collect();
        chains.sort();
        chains
    }

    /// Stop all listeners and drop their connections
    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
        for handle in self.handles.lock().await.drain(..) {
            handle.abort();
        }
        info!("Chain manager stopped");
    }
}
