//! Simulated Bitcoin, EVM and Solana endpoints

use crate::chain::evm::encode_set_agg_key;
use crate::chain::{BitcoinRpc, ChainId, EvmChain, SolanaPrograms};
use crate::error::{HarnessError, HarnessResult};
use crate::helpers::parse_units;

use async_trait::async_trait;
use sha3::{Digest, Keccak256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

fn tx_hash(parts: &[&str]) -> String {
    format!("0x{}", hex::encode(Keccak256::digest(parts.join("/").as_bytes())))
}

/// Bitcoin node whose height only moves when blocks are mined
pub struct LocalBitcoin {
    height: AtomicU64,
    sent: Mutex<Vec<(String, String)>>,
}

impl LocalBitcoin {
    pub fn new(height: u64) -> Self {
        Self {
            height: AtomicU64::new(height),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn mine(&self, blocks: u64) -> u64 {
        self.height.fetch_add(blocks, Ordering::SeqCst) + blocks
    }

    /// (address, amount) pairs sent so far
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl BitcoinRpc for LocalBitcoin {
    async fn block_count(&self) -> HarnessResult<u64> {
        Ok(self.height.load(Ordering::SeqCst))
    }

    async fn send_to_address(&self, address: &str, amount: &str) -> HarnessResult<String> {
        parse_units(amount, 8)?;
        let height = self.mine(1);
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((address.to_string(), amount.to_string()));
        }
        Ok(tx_hash(&["btc", address, amount, &height.to_string()])[2..].to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvmTransfer {
    /// None for the native asset
    pub token: Option<String>,
    pub to: String,
    pub amount: String,
}

/// EVM chain holding just enough state for setup and transfers
pub struct LocalEvm {
    chain: ChainId,
    height: AtomicU64,
    agg_key: Mutex<Option<Vec<u8>>>,
    transfers: Mutex<Vec<EvmTransfer>>,
}

impl LocalEvm {
    pub fn new(chain: ChainId, height: u64) -> Self {
        Self {
            chain,
            height: AtomicU64::new(height),
            agg_key: Mutex::new(None),
            transfers: Mutex::new(Vec::new()),
        }
    }

    pub fn agg_key(&self) -> Option<Vec<u8>> {
        self.agg_key.lock().ok().and_then(|k| k.clone())
    }

    pub fn transfers(&self) -> Vec<EvmTransfer> {
        self.transfers.lock().map(|t| t.clone()).unwrap_or_default()
    }

    fn record(&self, transfer: EvmTransfer) -> HarnessResult<String> {
        if !transfer.to.starts_with("0x") || transfer.to.len() != 42 {
            return Err(HarnessError::Evm {
                chain: self.chain,
                message: format!("invalid address {}", transfer.to),
            });
        }
        let height = self.height.fetch_add(1, Ordering::SeqCst) + 1;
        let hash = tx_hash(&[self.chain.as_str(), &transfer.to, &transfer.amount, &height.to_string()]);
        if let Ok(mut transfers) = self.transfers.lock() {
            transfers.push(transfer);
        }
        Ok(hash)
    }
}

#[async_trait]
impl EvmChain for LocalEvm {
    fn chain(&self) -> ChainId {
        self.chain
    }

    async fn block_number(&self) -> HarnessResult<u64> {
        Ok(self.height.load(Ordering::SeqCst))
    }

    async fn set_agg_key_with_gov_key(&self, agg_key: &[u8]) -> HarnessResult<String> {
        encode_set_agg_key(agg_key)?;
        let height = self.height.fetch_add(1, Ordering::SeqCst) + 1;
        let mut current = self
            .agg_key
            .lock()
            .map_err(|_| HarnessError::Internal("key manager state poisoned".to_string()))?;
        *current = Some(agg_key.to_vec());
        Ok(tx_hash(&[self.chain.as_str(), "setAggKeyWithGovKey", &height.to_string()]))
    }

    async fn send_native(&self, to: &str, amount: &str) -> HarnessResult<String> {
        parse_units(amount, 18)?;
        self.record(EvmTransfer {
            token: None,
            to: to.to_string(),
            amount: amount.to_string(),
        })
    }

    async fn send_erc20(&self, symbol: &str, to: &str, amount: &str) -> HarnessResult<String> {
        let decimals = match symbol.to_ascii_uppercase().as_str() {
            "USDC" => 6,
            "FLIP" => 18,
            _ => return Err(HarnessError::UnsupportedAsset(symbol.to_string())),
        };
        parse_units(amount, decimals)?;
        self.record(EvmTransfer {
            token: Some(symbol.to_ascii_uppercase()),
            to: to.to_string(),
            amount: amount.to_string(),
        })
    }
}

/// Solana vault programs; initialisation happens at most once
#[derive(Default)]
pub struct LocalSolana {
    agg_key: Mutex<Option<String>>,
}

impl LocalSolana {
    pub fn agg_key(&self) -> Option<String> {
        self.agg_key.lock().ok().and_then(|k| k.clone())
    }
}

#[async_trait]
impl SolanaPrograms for LocalSolana {
    async fn initialize_programs(&self, agg_key: &str) -> HarnessResult<()> {
        let mut current = self
            .agg_key
            .lock()
            .map_err(|_| HarnessError::Internal("solana state poisoned".to_string()))?;
        if current.is_some() {
            return Err(HarnessError::Internal(
                "solana vault programs already initialized".to_string(),
            ));
        }
        *current = Some(agg_key.to_string());
        Ok(())
    }
}
