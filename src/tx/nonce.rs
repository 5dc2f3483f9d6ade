//! Nonce management for signers shared across concurrent submissions
//!
//! Handles:
//! - Local nonce tracking so back-to-back submissions never collide
//! - Resynchronisation with the chain after a rejection
//! - Releasing a nonce that never reached the pool

use crate::chain::{AccountId, ChainId, SubstrateApi};
use crate::error::{HarnessError, HarnessResult};

use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Per-account nonce state
#[derive(Debug, Default)]
struct AccountNonceState {
    /// Next nonce to hand out, None until fetched from chain
    next: Option<u64>,
    /// Handed out but not yet included
    in_flight: BTreeSet<u64>,
}

/// Manages nonces for every signer on one chain
pub struct NonceManager {
    chain: ChainId,
    accounts: DashMap<AccountId, Arc<Mutex<AccountNonceState>>>,
}

impl NonceManager {
    pub fn new(chain: ChainId) -> Self {
        Self {
            chain,
            accounts: DashMap::new(),
        }
    }

    fn state(&self, account: &AccountId) -> Arc<Mutex<AccountNonceState>> {
        self.accounts
            .entry(account.clone())
            .or_default()
            .value()
            .clone()
    }

    /// Reserve the next nonce for `account`.
    ///
    /// Never goes below what the chain reports, so nonces consumed outside
    /// this process are skipped.
    pub async fn reserve(&self, api: &dyn SubstrateApi, account: &AccountId) -> HarnessResult<u64> {
        if api.chain() != self.chain {
            return Err(HarnessError::Nonce {
                chain: self.chain,
                account: account.to_string(),
                message: format!("nonce manager used with {} api", api.chain()),
            });
        }

        let state = self.state(account);
        let mut state = state.lock().await;

        let on_chain = api.account_nonce(account).await?;
        let nonce = match state.next {
            Some(local) if local > on_chain => local,
            Some(local) => {
                if local < on_chain {
                    warn!(
                        "Nonce for {} on {} advanced externally: local {}, chain {}",
                        account, self.chain, local, on_chain
                    );
                }
                on_chain
            }
            None => on_chain,
        };

        state.next = Some(nonce + 1);
        state.in_flight.insert(nonce);
        debug!("Allocated nonce {} for {} on {}", nonce, account, self.chain);
        Ok(nonce)
    }

    /// Extrinsic with this nonce was included
    pub async fn confirm(&self, account: &AccountId, nonce: u64) {
        let state = self.state(account);
        state.lock().await.in_flight.remove(&nonce);
    }

    /// Extrinsic never reached the pool; hand the nonce out again if possible
    pub async fn release(&self, account: &AccountId, nonce: u64) {
        let state = self.state(account);
        let mut state = state.lock().await;
        state.in_flight.remove(&nonce);

        // If this was the last nonce handed out, we can reset
        if state.next == Some(nonce + 1) {
            state.next = Some(nonce);
        }
    }

    /// Forget local state so the next reservation follows the chain
    pub async fn resync(&self, account: &AccountId) {
        let state = self.state(account);
        let mut state = state.lock().await;
        if !state.in_flight.is_empty() {
            warn!(
                "Resyncing nonce for {} on {} with {} extrinsics in flight",
                account,
                self.chain,
                state.in_flight.len()
            );
        }
        state.next = None;
        state.in_flight.clear();
    }

    /// Nonces handed out but not yet confirmed
    pub async fn in_flight(&self, account: &AccountId) -> usize {
        let state = self.state(account);
        let count = state.lock().await.in_flight.len();
        count
    }
}
