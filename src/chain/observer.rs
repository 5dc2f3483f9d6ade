//! Event observer: turns a chain feed into awaitable, filtered waits
//!
//! Each call subscribes to the chain's feed before returning, so an event
//! finalized after `observe` returns cannot be missed. `observe_from`
//! additionally replays finalized history, closing the window between an
//! extrinsic's inclusion and the start of the wait.

use super::{ChainId, ChainManager, EventSource, FeedMessage};
use crate::deferred::{deferred, DeferredFuture};
use crate::error::{HarnessError, HarnessResult};
use crate::events::{ChainEvent, EventFilter};

use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

/// Spawns one independent wait per `observe` call
#[derive(Clone)]
pub struct EventObserver {
    chains: Arc<ChainManager>,
}

impl EventObserver {
    pub fn new(chains: Arc<ChainManager>) -> Self {
        Self { chains }
    }

    /// Resolve with the first event on `chain` matching `filter` that is
    /// finalized from now on
    pub fn observe(
        &self,
        chain: ChainId,
        filter: EventFilter,
    ) -> HarnessResult<DeferredFuture<ChainEvent>> {
        self.spawn_wait(chain, filter, None)
    }

    /// Like [`observe`](Self::observe), but first scans finalized blocks
    /// starting at `from_block`
    pub fn observe_from(
        &self,
        chain: ChainId,
        filter: EventFilter,
        from_block: u64,
    ) -> HarnessResult<DeferredFuture<ChainEvent>> {
        self.spawn_wait(chain, filter, Some(from_block))
    }

    fn spawn_wait(
        &self,
        chain: ChainId,
        filter: EventFilter,
        replay_from: Option<u64>,
    ) -> HarnessResult<DeferredFuture<ChainEvent>> {
        let feed = self.chains.feed(chain)?;
        let rx = feed.subscribe();
        let (future, resolver) = deferred();

        debug!("Observing {} on {}", filter, chain);
        crate::metrics::record_wait_started(chain);

        tokio::spawn(async move {
            tokio::select! {
                _ = resolver.abandoned() => {
                    debug!("Wait for {} on {} abandoned", filter, chain);
                }
                outcome = scan(feed.source, rx, &filter, replay_from) => match outcome {
                    Ok(event) => {
                        debug!(
                            "{} matched on {} at block {}",
                            filter, chain, event.block_number
                        );
                        resolver.resolve(event);
                    }
                    Err(e) => {
                        warn!("Wait for {} on {} failed: {}", filter, chain, e);
                        resolver.reject(e);
                    }
                },
            }
            crate::metrics::record_wait_finished(chain);
        });

        Ok(future)
    }
}

/// Walk the feed (and optionally history) until `filter` matches
async fn scan(
    source: Arc<dyn EventSource>,
    mut rx: broadcast::Receiver<FeedMessage>,
    filter: &EventFilter,
    replay_from: Option<u64>,
) -> HarnessResult<ChainEvent> {
    let chain = source.chain();
    // Next block this wait has not yet examined, once known
    let mut next_block = None;

    if let Some(from) = replay_from {
        let head = source.finalized_head().await?;
        for number in from..=head {
            if let Some(event) = search_block(source.as_ref(), filter, number).await? {
                return Ok(event);
            }
        }
        next_block = Some(from.max(head + 1));
    }

    loop {
        match rx.recv().await {
            Ok(FeedMessage::Block(block)) => {
                if let Some(expected) = next_block {
                    if block.number < expected {
                        continue;
                    }
                    // Blocks dropped while this receiver lagged
                    for number in expected..block.number {
                        if let Some(event) = search_block(source.as_ref(), filter, number).await? {
                            return Ok(event);
                        }
                    }
                }

                if let Some(event) = filter.first_match(&block.events) {
                    return Ok(event.clone());
                }
                next_block = Some(block.number + 1);
            }
            Ok(FeedMessage::Disconnected { chain, reason }) => {
                return Err(HarnessError::Connectivity {
                    chain,
                    message: reason,
                });
            }
            Err(RecvError::Lagged(skipped)) => {
                if next_block.is_some() {
                    debug!(
                        "Wait for {} on {} lagged by {} messages, will backfill",
                        filter, chain, skipped
                    );
                } else {
                    warn!(
                        "Wait for {} on {} lagged by {} messages before its first block; \
                         events in the skipped blocks are not examined",
                        filter, chain, skipped
                    );
                }
            }
            Err(RecvError::Closed) => {
                return Err(HarnessError::Connectivity {
                    chain,
                    message: "event feed closed".to_string(),
                });
            }
        }
    }
}

async fn search_block(
    source: &dyn EventSource,
    filter: &EventFilter,
    number: u64,
) -> HarnessResult<Option<ChainEvent>> {
    let events = source.block_events(number).await?;
    Ok(filter.first_match(&events).cloned())
}
