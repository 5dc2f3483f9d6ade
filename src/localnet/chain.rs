//! Generic simulated substrate chain: pool, block authoring, feeds

use super::{dev_account, RuntimeEvent};
use crate::chain::{
    AccountId, BlockStream, ChainId, EventSource, FinalizedBlock, Inclusion, Keypair,
    SubstrateApi, TxStatus, TxStatusStream,
};
use crate::error::{HarnessError, HarnessResult};
use crate::events::ChainEvent;
use crate::tx::RuntimeCall;

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

/// Position of the extrinsic being dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtrinsicContext {
    pub block_number: u64,
    pub extrinsic_index: u32,
}

/// State transition function of a simulated chain
pub trait Runtime: Send + 'static {
    fn chain(&self) -> ChainId;

    /// Block initialisation hook; events carry no extrinsic index
    fn on_initialize(&mut self, _block_number: u64) -> Vec<RuntimeEvent> {
        Vec::new()
    }

    /// Apply a signed call. An error is the dispatch error; the runtime must
    /// leave its state untouched in that case.
    fn dispatch(
        &mut self,
        origin: &AccountId,
        call: &RuntimeCall,
        at: ExtrinsicContext,
    ) -> Result<Vec<RuntimeEvent>, String>;
}

/// An extrinsic that made it into a block
#[derive(Debug, Clone, PartialEq)]
pub struct IncludedExtrinsic {
    pub signer: AccountId,
    pub call: RuntimeCall,
    pub block_number: u64,
    pub extrinsic_index: u32,
    pub success: bool,
}

struct Pooled {
    signer: AccountId,
    nonce: u64,
    call: RuntimeCall,
    watcher: UnboundedSender<HarnessResult<TxStatus>>,
}

struct ChainState<R> {
    runtime: R,
    /// Events per block, index 0 is genesis
    blocks: Vec<Vec<ChainEvent>>,
    nonces: HashMap<AccountId, u64>,
    pool: Vec<Pooled>,
    included: Vec<IncludedExtrinsic>,
    subscribers: Vec<UnboundedSender<HarnessResult<FinalizedBlock>>>,
}

impl<R: Runtime> ChainState<R> {
    fn next_nonce(&self, account: &AccountId) -> u64 {
        self.nonces.get(account).copied().unwrap_or(0)
    }

    /// Author and immediately finalize the next block
    fn produce_block(&mut self) -> u64 {
        let chain = self.runtime.chain();
        let number = self.blocks.len() as u64;

        let mut events: Vec<ChainEvent> = self
            .runtime
            .on_initialize(number)
            .into_iter()
            .map(|e| e.into_chain_event(chain, number, None))
            .collect();

        let mut index = 0u32;
        // Apply ready extrinsics in nonce order; future nonces stay pooled
        while let Some(position) = self
            .pool
            .iter()
            .position(|p| p.nonce == self.next_nonce(&p.signer))
        {
            let pooled = self.pool.remove(position);
            let at = ExtrinsicContext {
                block_number: number,
                extrinsic_index: index,
            };

            let (runtime_events, dispatch_error) =
                match self.runtime.dispatch(&pooled.signer, &pooled.call, at) {
                    Ok(mut runtime_events) => {
                        runtime_events.push(RuntimeEvent::new("system:ExtrinsicSuccess"));
                        (runtime_events, None)
                    }
                    Err(error) => {
                        debug!("{}: extrinsic {}-{} failed: {}", chain, number, index, error);
                        let failed = RuntimeEvent::new("system:ExtrinsicFailed")
                            .with("dispatchError", error.as_str());
                        (vec![failed], Some(error))
                    }
                };
            *self.nonces.entry(pooled.signer.clone()).or_default() += 1;

            let extrinsic_events: Vec<ChainEvent> = runtime_events
                .into_iter()
                .map(|e| e.into_chain_event(chain, number, Some(index)))
                .collect();
            events.extend(extrinsic_events.iter().cloned());

            self.included.push(IncludedExtrinsic {
                signer: pooled.signer,
                call: pooled.call,
                block_number: number,
                extrinsic_index: index,
                success: dispatch_error.is_none(),
            });

            let inclusion = Inclusion {
                block_number: number,
                extrinsic_index: index,
                events: extrinsic_events,
                dispatch_error,
            };
            // Watcher gone just means nobody follows this extrinsic any more
            let _ = pooled
                .watcher
                .unbounded_send(Ok(TxStatus::InBlock(inclusion.clone())));
            let _ = pooled.watcher.unbounded_send(Ok(TxStatus::Finalized(inclusion)));

            index += 1;
        }

        self.blocks.push(events.clone());
        let block = FinalizedBlock {
            chain,
            number,
            events,
        };
        self.subscribers
            .retain(|subscriber| subscriber.unbounded_send(Ok(block.clone())).is_ok());

        trace!("{}: finalized block {} with {} extrinsics", chain, number, index);
        number
    }
}

/// In-process chain driven by a [`Runtime`]
pub struct LocalChain<R: Runtime> {
    chain: ChainId,
    state: Arc<Mutex<ChainState<R>>>,
    authoring: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<R: Runtime> LocalChain<R> {
    pub fn new(runtime: R) -> Self {
        Self {
            chain: runtime.chain(),
            state: Arc::new(Mutex::new(ChainState {
                runtime,
                blocks: vec![Vec::new()],
                nonces: HashMap::new(),
                pool: Vec::new(),
                included: Vec::new(),
                subscribers: Vec::new(),
            })),
            authoring: Mutex::new(None),
        }
    }

    /// Author blocks every `block_time` until stopped
    pub fn start(&self, block_time: Duration) {
        let mut authoring = lock(&self.authoring);
        if authoring.is_some() {
            return;
        }

        let state = self.state.clone();
        let chain = self.chain;
        *authoring = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(block_time);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                lock(&state).produce_block();
            }
        }));
        info!("{} localnet authoring every {:?}", chain, block_time);
    }

    pub fn stop(&self) {
        if let Some(handle) = lock(&self.authoring).take() {
            handle.abort();
        }
    }

    /// Author one block now
    pub fn produce_block(&self) -> u64 {
        lock(&self.state).produce_block()
    }

    pub fn head(&self) -> u64 {
        lock(&self.state).blocks.len() as u64 - 1
    }

    /// Terminate every finalized-block subscription with a connectivity error
    pub fn disconnect(&self) {
        let mut state = lock(&self.state);
        for subscriber in state.subscribers.drain(..) {
            let _ = subscriber.unbounded_send(Err(HarnessError::Connectivity {
                chain: self.chain,
                message: "node closed the connection".to_string(),
            }));
        }
        info!("{} localnet dropped its subscribers", self.chain);
    }

    /// Extrinsics included so far, in chain order
    pub fn included(&self) -> Vec<IncludedExtrinsic> {
        lock(&self.state).included.clone()
    }

    pub fn with_runtime<T>(&self, f: impl FnOnce(&R) -> T) -> T {
        f(&lock(&self.state).runtime)
    }

    pub fn with_runtime_mut<T>(&self, f: impl FnOnce(&mut R) -> T) -> T {
        f(&mut lock(&self.state).runtime)
    }
}

impl<R: Runtime> Drop for LocalChain<R> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[async_trait]
impl<R: Runtime> EventSource for LocalChain<R> {
    fn chain(&self) -> ChainId {
        self.chain
    }

    async fn finalized_head(&self) -> HarnessResult<u64> {
        Ok(self.head())
    }

    async fn block_events(&self, number: u64) -> HarnessResult<Vec<ChainEvent>> {
        lock(&self.state)
            .blocks
            .get(number as usize)
            .cloned()
            .ok_or_else(|| HarnessError::Internal(format!("{} has no block {}", self.chain, number)))
    }

    async fn subscribe_finalized(&self) -> HarnessResult<BlockStream> {
        let (tx, rx) = unbounded();
        lock(&self.state).subscribers.push(tx);
        Ok(rx.boxed())
    }
}

#[async_trait]
impl<R: Runtime> SubstrateApi for LocalChain<R> {
    fn chain(&self) -> ChainId {
        self.chain
    }

    fn account_id(&self, signer: &Keypair) -> AccountId {
        dev_account(signer)
    }

    async fn account_nonce(&self, account: &AccountId) -> HarnessResult<u64> {
        Ok(lock(&self.state).next_nonce(account))
    }

    async fn submit_and_watch(
        &self,
        signer: &Keypair,
        nonce: u64,
        call: RuntimeCall,
    ) -> HarnessResult<TxStatusStream> {
        let signer = dev_account(signer);
        let (tx, rx) = unbounded();
        let mut state = lock(&self.state);

        let status = if nonce < state.next_nonce(&signer) {
            TxStatus::Invalid("Stale".to_string())
        } else if state
            .pool
            .iter()
            .any(|p| p.signer == signer && p.nonce == nonce)
        {
            TxStatus::Invalid("Priority is too low".to_string())
        } else {
            state.pool.push(Pooled {
                signer,
                nonce,
                call,
                watcher: tx.clone(),
            });
            TxStatus::Ready
        };

        let _ = tx.unbounded_send(Ok(status));
        Ok(rx.boxed())
    }
}

impl RuntimeEvent {
    pub(crate) fn into_chain_event(
        self,
        chain: ChainId,
        block_number: u64,
        extrinsic_index: Option<u32>,
    ) -> ChainEvent {
        ChainEvent {
            chain,
            block_number,
            extrinsic_index,
            name: self.name,
            attributes: self.attributes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::GovernanceCall;

    /// Counts remarks, fails on governance calls
    struct Counter {
        count: u64,
    }

    impl Runtime for Counter {
        fn chain(&self) -> ChainId {
            ChainId::Polkadot
        }

        fn dispatch(
            &mut self,
            origin: &AccountId,
            call: &RuntimeCall,
            _at: ExtrinsicContext,
        ) -> Result<Vec<RuntimeEvent>, String> {
            match call {
                RuntimeCall::Governance(_) => Err("BadOrigin".to_string()),
                _ => {
                    self.count += 1;
                    Ok(vec![RuntimeEvent::new("test:Counted").with("who", origin)])
                }
            }
        }
    }

    fn transfer() -> RuntimeCall {
        RuntimeCall::Transfer {
            dest: AccountId::new("0xbob"),
            amount: 1,
        }
    }

    async fn statuses(stream: TxStatusStream) -> Vec<TxStatus> {
        stream.map(|s| s.unwrap()).collect().await
    }

    #[tokio::test]
    async fn pool_applies_in_nonce_order() {
        let chain = LocalChain::new(Counter { count: 0 });
        let alice = Keypair::from_uri("//Alice");

        let second = chain.submit_and_watch(&alice, 1, transfer()).await.unwrap();
        let first = chain.submit_and_watch(&alice, 0, transfer()).await.unwrap();
        assert_eq!(chain.produce_block(), 1);

        let first = statuses(first).await;
        let second = statuses(second).await;
        match (&first[1], &second[1]) {
            (TxStatus::InBlock(a), TxStatus::InBlock(b)) => {
                assert_eq!((a.block_number, a.extrinsic_index), (1, 0));
                assert_eq!((b.block_number, b.extrinsic_index), (1, 1));
            }
            other => panic!("unexpected statuses {:?}", other),
        }
        assert_eq!(chain.with_runtime(|r| r.count), 2);
    }

    #[tokio::test]
    async fn stale_and_duplicate_nonces_are_invalid() {
        let chain = LocalChain::new(Counter { count: 0 });
        let alice = Keypair::from_uri("//Alice");

        let _pending = chain.submit_and_watch(&alice, 0, transfer()).await.unwrap();
        let duplicate = chain.submit_and_watch(&alice, 0, transfer()).await.unwrap();
        assert_eq!(
            statuses(duplicate).await,
            vec![TxStatus::Invalid("Priority is too low".to_string())]
        );

        chain.produce_block();
        let stale = chain.submit_and_watch(&alice, 0, transfer()).await.unwrap();
        assert_eq!(statuses(stale).await, vec![TxStatus::Invalid("Stale".to_string())]);
    }

    #[tokio::test]
    async fn failed_dispatch_still_consumes_the_nonce() {
        let chain = LocalChain::new(Counter { count: 0 });
        let alice = Keypair::from_uri("//Alice");
        let account = dev_account(&alice);

        let watch = chain
            .submit_and_watch(&alice, 0, RuntimeCall::Governance(GovernanceCall::ForceRotation))
            .await
            .unwrap();
        chain.produce_block();

        match &statuses(watch).await[1] {
            TxStatus::InBlock(inclusion) => {
                assert_eq!(inclusion.dispatch_error.as_deref(), Some("BadOrigin"))
            }
            other => panic!("unexpected status {:?}", other),
        }
        assert_eq!(chain.account_nonce(&account).await.unwrap(), 1);
        assert!(!chain.included()[0].success);
    }

    #[tokio::test]
    async fn subscribers_receive_blocks_until_disconnect() {
        let chain = LocalChain::new(Counter { count: 0 });
        let mut blocks = chain.subscribe_finalized().await.unwrap();

        chain.produce_block();
        assert_eq!(blocks.next().await.unwrap().unwrap().number, 1);

        chain.disconnect();
        assert!(matches!(
            blocks.next().await,
            Some(Err(HarnessError::Connectivity { .. }))
        ));
        assert!(blocks.next().await.is_none());
    }
}
