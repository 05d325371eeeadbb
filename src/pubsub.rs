//! Generic fan-out broadcast with slow-subscriber eviction.
//!
//! [`ChainWatcher`](crate::watcher::ChainWatcher) and
//! [`PaymentEngine`](crate::engine::PaymentEngine) both need to hand a
//! stream of events (blocks, mempool transactions, invoice updates) out to an
//! open-ended set of subscribers without letting one slow subscriber stall
//! delivery to the others. [`Publisher<T>`] is the one mechanism both reach
//! for.

use std::fmt::Debug;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use indexmap::IndexMap;
use log::warn;
use thiserror::Error;
use tokio::sync::mpsc::{channel, error::TryRecvError, Receiver, Sender};
use tokio::time::error::Elapsed;

/// Bound on a subscriber's backlog before a slow consumer's send starts
/// blocking (and eventually timing out).
const SUBSCRIPTION_BUFFER_LEN: usize = 2048;

/// Deadline for a single subscriber to accept one broadcast before it is
/// evicted from the registry.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// A handle to receive broadcasts of type `T` from a [`Publisher<T>`].
pub struct Subscriber<T>(Receiver<T>);

impl<T> Subscriber<T> {
    fn new(receiver: Receiver<T>) -> Self {
        Subscriber(receiver)
    }

    /// Waits for the next broadcast item. Returns `None` once the publisher
    /// has dropped this subscriber's channel.
    pub async fn recv(&mut self) -> Option<T> {
        self.0.recv().await
    }

    /// Attempts to receive without waiting.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is empty or disconnected.
    pub fn try_recv(&mut self) -> Result<T, SubscriberError> {
        Ok(self.0.try_recv()?)
    }

    /// Waits for the next broadcast item, failing if none arrives within
    /// `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the timeout elapses first.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<T>, SubscriberError> {
        Ok(tokio::time::timeout(timeout, self.0.recv()).await?)
    }
}

/// Error receiving from a [`Subscriber`].
#[derive(Error, Debug)]
pub enum SubscriberError {
    /// No update arrived before the deadline.
    #[error("subscriber recv timeout: {0}")]
    RecvTimeout(#[from] Elapsed),
    /// The channel is empty or the publisher has gone away.
    #[error("subscriber try_recv failed: {0}")]
    TryRecv(#[from] TryRecvError),
}

#[derive(Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
struct SenderId(u128);

impl SenderId {
    fn new() -> SenderId {
        SenderId(rand::random())
    }
}

/// Broadcasts items of type `T` to every registered subscriber, evicting any
/// subscriber that fails to accept an item within [`DELIVERY_TIMEOUT`].
///
/// Sends to distinct subscribers happen concurrently with each other, so one
/// slow or dead subscriber cannot delay delivery to a healthy one.
pub struct Publisher<T> {
    subs: Mutex<IndexMap<SenderId, Sender<T>>>,
}

impl<T> Default for Publisher<T> {
    fn default() -> Self {
        Publisher {
            subs: Mutex::new(IndexMap::new()),
        }
    }
}

impl<T: Clone + Send + 'static> Publisher<T> {
    /// Creates an empty publisher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber and returns its receiving half.
    pub fn subscribe(&self) -> Subscriber<T> {
        let (tx, rx) = channel(SUBSCRIPTION_BUFFER_LEN);
        let mut subs = self.subs.lock().unwrap_or_else(PoisonError::into_inner);
        subs.insert(SenderId::new(), tx);
        Subscriber::new(rx)
    }

    /// Number of currently registered subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Drops every registered subscriber's sending half, so each
    /// [`Subscriber::recv`] call in flight or made afterward returns `None`.
    pub fn clear(&self) {
        self.subs.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Broadcasts `item` to every registered subscriber concurrently, then
    /// removes any subscriber whose delivery did not complete in time.
    pub async fn publish(&self, item: T) {
        let senders: Vec<(SenderId, Sender<T>)> = self
            .subs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let deliveries = senders.into_iter().map(|(id, tx)| {
            let item = item.clone();
            async move {
                let delivered = tokio::time::timeout(DELIVERY_TIMEOUT, tx.send(item))
                    .await
                    .map(|r| r.is_ok())
                    .unwrap_or(false);
                (id, delivered)
            }
        });

        let results = join_all(deliveries).await;
        let dead: Vec<SenderId> = results
            .into_iter()
            .filter_map(|(id, delivered)| (!delivered).then_some(id))
            .collect();
        if !dead.is_empty() {
            let mut subs = self.subs.lock().unwrap_or_else(PoisonError::into_inner);
            for id in dead {
                warn!("evicting subscriber that missed delivery within the delivery timeout");
                subs.remove(&id);
            }
        }
    }
}

impl<T> Debug for Publisher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let publisher: Publisher<u32> = Publisher::new();
        let mut a = publisher.subscribe();
        let mut b = publisher.subscribe();

        publisher.publish(7).await;

        assert_eq!(a.recv().await, Some(7));
        assert_eq!(b.recv().await, Some(7));
    }

    #[tokio::test]
    async fn dropped_subscriber_is_evicted() {
        let publisher: Publisher<u32> = Publisher::new();
        let subscriber = publisher.subscribe();
        drop(subscriber);

        publisher.publish(1).await;
        assert_eq!(publisher.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn distinct_subscribers_are_independent() {
        let publisher: Publisher<u32> = Publisher::new();
        let mut keep = publisher.subscribe();
        let evict = publisher.subscribe();
        drop(evict);

        publisher.publish(42).await;

        assert_eq!(publisher.subscriber_count(), 1);
        assert_eq!(keep.recv().await, Some(42));
    }
}
