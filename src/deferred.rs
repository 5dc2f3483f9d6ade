//! Single-assignment result cell bridging push-style callbacks into futures.
//!
//! [`deferred`] hands out a [`DeferredFuture`] for the one logical waiter and a
//! cloneable [`Resolver`] for whoever produces the value. Only the first
//! `resolve` or `reject` has any effect.

use crate::error::{HarnessError, HarnessResult};

use futures::future::poll_fn;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Create a linked future/resolver pair
pub fn deferred<T>() -> (DeferredFuture<T>, Resolver<T>) {
    let (tx, rx) = oneshot::channel();
    (
        DeferredFuture { rx },
        Resolver {
            slot: Arc::new(Mutex::new(Some(tx))),
        },
    )
}

/// Awaitable side of a deferred value
#[derive(Debug)]
pub struct DeferredFuture<T> {
    rx: oneshot::Receiver<HarnessResult<T>>,
}

impl<T> Future for DeferredFuture<T> {
    type Output = HarnessResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Every resolver was dropped without settling
            Poll::Ready(Err(_)) => Poll::Ready(Err(HarnessError::Abandoned)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Settling side of a deferred value
#[derive(Debug)]
pub struct Resolver<T> {
    slot: Arc<Mutex<Option<oneshot::Sender<HarnessResult<T>>>>>,
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T> Resolver<T> {
    /// Complete with a value. Returns false if already settled.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Complete with an error. Returns false if already settled.
    pub fn reject(&self, error: HarnessError) -> bool {
        self.settle(Err(error))
    }

    pub fn is_settled(&self) -> bool {
        self.lock().is_none()
    }

    /// Completes once the waiting future has been dropped or the value settled.
    pub async fn abandoned(&self) {
        poll_fn(|cx| match self.lock().as_mut() {
            Some(tx) => tx.poll_closed(cx),
            None => Poll::Ready(()),
        })
        .await
    }

    fn settle(&self, result: HarnessResult<T>) -> bool {
        match self.lock().take() {
            Some(tx) => {
                // The waiter may already be gone; settling still counts
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<oneshot::Sender<HarnessResult<T>>>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[tokio::test]
    async fn first_resolution_wins() {
        let (future, resolver) = deferred::<u32>();
        assert!(resolver.resolve(1));
        assert!(!resolver.resolve(2));
        assert!(!resolver.reject(HarnessError::Internal("late".into())));
        assert_eq!(future.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn rejection_is_kept_over_later_resolve() {
        let (future, resolver) = deferred::<u32>();
        assert!(resolver.reject(HarnessError::Internal("boom".into())));
        assert!(!resolver.resolve(7));
        assert_eq!(
            future.await.unwrap_err(),
            HarnessError::Internal("boom".into())
        );
    }

    #[test]
    fn stays_pending_until_settled() {
        let (future, resolver) = deferred::<&'static str>();
        let mut waiter = task::spawn(future);
        assert_pending!(waiter.poll());

        let other = resolver.clone();
        assert!(other.resolve("done"));
        assert!(waiter.is_woken());
        assert_eq!(assert_ready!(waiter.poll()).unwrap(), "done");
        assert!(resolver.is_settled());
    }

    #[tokio::test]
    async fn dropped_resolvers_abandon_the_future() {
        let (future, resolver) = deferred::<u32>();
        drop(resolver);
        assert_eq!(future.await.unwrap_err(), HarnessError::Abandoned);
    }

    #[tokio::test]
    async fn abandoned_fires_when_waiter_drops() {
        let (future, resolver) = deferred::<u32>();
        drop(future);
        resolver.abandoned().await;
        // Settling after the waiter left is still a terminal transition
        assert!(resolver.resolve(3));
        assert!(resolver.is_settled());
    }
}
