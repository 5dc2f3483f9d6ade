//! Chain event listener: finalized-block subscription with gap backfill

use super::{BlockStream, ChainId, EventSource, FinalizedBlock};
use crate::error::{HarnessError, HarnessResult};

use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Message published on a chain's feed
#[derive(Debug, Clone)]
pub enum FeedMessage {
    Block(Arc<FinalizedBlock>),
    /// The listener lost its connection; waits on this chain cannot trust
    /// the feed to deliver their event any more.
    Disconnected { chain: ChainId, reason: String },
}

/// Listens for finalized blocks on a specific chain
pub struct ChainListener {
    /// Event source
    source: Arc<dyn EventSource>,
    /// Feed broadcast channel
    feed_tx: broadcast::Sender<FeedMessage>,
    /// Last block published on the feed
    last_published: RwLock<Option<u64>>,
}

impl ChainListener {
    pub fn new(source: Arc<dyn EventSource>, feed_tx: broadcast::Sender<FeedMessage>) -> Self {
        Self {
            source,
            feed_tx,
            last_published: RwLock::new(None),
        }
    }

    pub fn chain(&self) -> ChainId {
        self.source.chain()
    }

    /// Open the finalized-block subscription
    pub async fn connect(&self) -> HarnessResult<BlockStream> {
        let blocks = self.source.subscribe_finalized().await?;
        info!("Subscribed to finalized blocks on {}", self.chain());
        Ok(blocks)
    }

    /// Main listening loop; only returns on connection loss
    pub async fn listen(&self) -> HarnessResult<()> {
        let blocks = self.connect().await?;
        self.pump(blocks).await
    }

    /// Forward blocks from an open subscription until it fails
    pub async fn pump(&self, mut blocks: BlockStream) -> HarnessResult<()> {
        while let Some(block) = blocks.next().await {
            self.forward(block?).await?;
        }

        Err(HarnessError::Connectivity {
            chain: self.chain(),
            message: "finalized block subscription ended".to_string(),
        })
    }

    /// Tell every waiting observer the feed went down
    pub fn notify_disconnected(&self, error: &HarnessError) {
        let message = FeedMessage::Disconnected {
            chain: self.chain(),
            reason: error.to_string(),
        };
        if self.feed_tx.send(message).is_err() {
            debug!("No observers on {} to notify of disconnect", self.chain());
        }
    }

    /// Publish a block, first backfilling anything missed since the last one
    async fn forward(&self, block: FinalizedBlock) -> HarnessResult<()> {
        let last = *self.last_published.read().await;

        if let Some(last) = last {
            if block.number <= last {
                debug!("{}: skipping already published block {}", self.chain(), block.number);
                return Ok(());
            }

            if block.number > last + 1 {
                warn!(
                    "{}: gap between block {} and {}, backfilling {} blocks",
                    self.chain(),
                    last,
                    block.number,
                    block.number - last - 1
                );
                for number in last + 1..block.number {
                    let events = self.source.block_events(number).await?;
                    self.publish(FinalizedBlock {
                        chain: self.chain(),
                        number,
                        events,
                    })
                    .await;
                }
            }
        }

        self.publish(block).await;
        Ok(())
    }

    async fn publish(&self, block: FinalizedBlock) {
        let number = block.number;
        for event in &block.events {
            crate::metrics::record_event(self.chain(), &event.name);
        }

        // No receivers is fine: nobody is waiting on this chain right now
        let _ = self.feed_tx.send(FeedMessage::Block(Arc::new(block)));

        *self.last_published.write().await = Some(number);
        crate::metrics::record_block_height(self.chain(), number);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChainEvent;
    use async_trait::async_trait;
    use futures::stream;
    use std::collections::BTreeMap;

    struct FixedSource {
        history: Vec<Vec<ChainEvent>>,
    }

    fn named(number: u64, name: &str) -> ChainEvent {
        ChainEvent {
            chain: ChainId::Polkadot,
            block_number: number,
            extrinsic_index: None,
            name: name.to_string(),
            attributes: BTreeMap::new(),
        }
    }

    #[async_trait]
    impl EventSource for FixedSource {
        fn chain(&self) -> ChainId {
            ChainId::Polkadot
        }

        async fn finalized_head(&self) -> HarnessResult<u64> {
            Ok(self.history.len() as u64 - 1)
        }

        async fn block_events(&self, number: u64) -> HarnessResult<Vec<ChainEvent>> {
            Ok(self.history[number as usize].clone())
        }

        async fn subscribe_finalized(&self) -> HarnessResult<BlockStream> {
            Ok(stream::empty().boxed())
        }
    }

    fn block(number: u64, source: &FixedSource) -> FinalizedBlock {
        FinalizedBlock {
            chain: ChainId::Polkadot,
            number,
            events: source.history[number as usize].clone(),
        }
    }

    #[tokio::test]
    async fn gaps_are_backfilled_in_order() {
        let source = Arc::new(FixedSource {
            history: (0..6).map(|n| vec![named(n, "test:Tick")]).collect(),
        });
        let (tx, mut rx) = broadcast::channel(16);
        let listener = ChainListener::new(source.clone(), tx);

        let blocks = vec![Ok(block(1, &source)), Ok(block(4, &source)), Ok(block(4, &source))];
        let result = listener.pump(stream::iter(blocks).boxed()).await;
        assert!(matches!(result, Err(HarnessError::Connectivity { .. })));

        let mut seen = Vec::new();
        while let Ok(FeedMessage::Block(block)) = rx.try_recv() {
            seen.push(block.number);
        }
        assert_eq!(seen, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn disconnect_is_published() {
        let source = Arc::new(FixedSource { history: vec![vec![]] });
        let (tx, mut rx) = broadcast::channel(4);
        let listener = ChainListener::new(source, tx);

        listener.notify_disconnected(&HarnessError::Connectivity {
            chain: ChainId::Polkadot,
            message: "socket closed".into(),
        });

        match rx.try_recv().unwrap() {
            FeedMessage::Disconnected { chain, reason } => {
                assert_eq!(chain, ChainId::Polkadot);
                assert!(reason.contains("socket closed"));
            }
            other => panic!("unexpected message {:?}", other),
        }
    }
}
