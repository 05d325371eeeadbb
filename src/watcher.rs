//! Generic chain poller: drives block and mempool polling for one
//! [`DaemonClient`] and fans the results out to subscribers via
//! [`Publisher`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::{debug, error, warn};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::daemon::{Block, DaemonClient, DaemonError, Tx};
use crate::pubsub::{Publisher, Subscriber};

/// Interval between block-catch-up passes. Mempool is polled twice as often.
pub const SYNC_INTERVAL: Duration = Duration::from_secs(10);
/// Consecutive poll failures a loop tolerates before giving up and recording
/// a [`WatcherError`] instead of retrying forever.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;

struct Handles {
    block_poller: JoinHandle<()>,
    mempool_poller: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

/// Polls one [`DaemonClient`] for new blocks and mempool transactions and
/// broadcasts them to subscribers, tracking `last_synced_block_height` as it
/// catches up.
pub struct ChainWatcher<D: DaemonClient + 'static>
where
    D::Block: 'static,
    D::Tx: 'static,
{
    daemon: Arc<D>,
    last_synced: Arc<AtomicU64>,
    block_subs: Arc<Publisher<D::Block>>,
    mempool_subs: Arc<Publisher<D::Tx>>,
    handles: Mutex<Option<Handles>>,
    last_error: Arc<StdMutex<Option<WatcherError>>>,
    poll_interval: Duration,
}

impl<D: DaemonClient + 'static> ChainWatcher<D> {
    /// Creates a watcher for `daemon`, polling for new blocks every
    /// [`SYNC_INTERVAL`]. Polling does not start until [`ChainWatcher::start`]
    /// is called.
    #[must_use]
    pub fn new(daemon: D) -> ChainWatcher<D> {
        ChainWatcher::with_poll_interval(daemon, SYNC_INTERVAL)
    }

    /// Creates a watcher for `daemon`, polling for new blocks every
    /// `poll_interval` (mempool is polled at half that interval). Polling
    /// does not start until [`ChainWatcher::start`] is called.
    #[must_use]
    pub fn with_poll_interval(daemon: D, poll_interval: Duration) -> ChainWatcher<D> {
        ChainWatcher {
            daemon: Arc::new(daemon),
            last_synced: Arc::new(AtomicU64::new(0)),
            block_subs: Arc::new(Publisher::new()),
            mempool_subs: Arc::new(Publisher::new()),
            handles: Mutex::new(None),
            last_error: Arc::new(StdMutex::new(None)),
            poll_interval,
        }
    }

    /// Starts the block and mempool pollers from `from_height`. Idempotent:
    /// if the watcher is already running, this is a no-op.
    pub async fn start(&self, from_height: u64) {
        let mut handles = self.handles.lock().await;
        if handles.is_some() {
            return;
        }
        self.last_synced.store(from_height, Ordering::SeqCst);

        *self.last_error.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = None;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let block_poller = tokio::spawn(block_poll_loop(
            Arc::clone(&self.daemon),
            Arc::clone(&self.last_synced),
            Arc::clone(&self.block_subs),
            shutdown_rx.clone(),
            Arc::clone(&self.last_error),
            self.poll_interval,
        ));
        let mempool_poller = tokio::spawn(mempool_poll_loop(
            Arc::clone(&self.daemon),
            Arc::clone(&self.mempool_subs),
            shutdown_rx,
            Arc::clone(&self.last_error),
            self.poll_interval / 2,
        ));

        *handles = Some(Handles { block_poller, mempool_poller, shutdown: shutdown_tx });
    }

    /// Signals both pollers to stop and waits for them to exit, dropping the
    /// subscriber channels.
    pub async fn stop(&self) {
        let Some(handles) = self.handles.lock().await.take() else {
            return;
        };
        let _ = handles.shutdown.send(true);
        let _ = handles.block_poller.await;
        let _ = handles.mempool_poller.await;
        self.block_subs.clear();
        self.mempool_subs.clear();
    }

    /// Registers a new block subscriber.
    pub fn subscribe_blocks(&self) -> Subscriber<D::Block> {
        self.block_subs.subscribe()
    }

    /// Registers a new mempool transaction subscriber.
    pub fn subscribe_mempool(&self) -> Subscriber<D::Tx> {
        self.mempool_subs.subscribe()
    }

    /// Highest block height fully processed so far.
    #[must_use]
    pub fn last_synced_block_height(&self) -> u64 {
        self.last_synced.load(Ordering::SeqCst)
    }

    /// The underlying daemon client.
    #[must_use]
    pub fn daemon(&self) -> &D {
        &self.daemon
    }

    /// The error that made a poller give up, if either has hit
    /// [`MAX_CONSECUTIVE_FAILURES`] in a row since the last [`Self::start`].
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .map(ToString::to_string)
    }
}

async fn block_poll_loop<D: DaemonClient>(
    daemon: Arc<D>,
    last_synced: Arc<AtomicU64>,
    block_subs: Arc<Publisher<D::Block>>,
    mut shutdown: watch::Receiver<bool>,
    last_error: Arc<StdMutex<Option<WatcherError>>>,
    poll_interval: Duration,
) {
    let mut consecutive_failures = 0u32;
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            () = tokio::time::sleep(poll_interval) => {}
        }
        if *shutdown.borrow() {
            return;
        }

        let tip = match daemon.last_block_height().await {
            Ok(tip) => {
                consecutive_failures = 0;
                tip
            }
            Err(e) => {
                warn!("block poll could not reach daemon: {e}");
                if give_up_after(&mut consecutive_failures, e, &last_error) {
                    return;
                }
                continue;
            }
        };

        let mut height = last_synced.load(Ordering::SeqCst);
        while height < tip && !*shutdown.borrow() {
            let block = match daemon.block_by_height(height).await {
                Ok(block) => {
                    consecutive_failures = 0;
                    block
                }
                Err(e) => {
                    warn!("block poll failed to fetch block {height}: {e}");
                    if give_up_after(&mut consecutive_failures, e, &last_error) {
                        return;
                    }
                    break;
                }
            };
            block_subs.publish(block).await;
            height += 1;
            last_synced.store(height, Ordering::SeqCst);
        }
    }
}

/// Bumps `consecutive_failures` for `error` and, once it reaches
/// [`MAX_CONSECUTIVE_FAILURES`], records a [`WatcherError`] and reports that
/// the caller should stop polling.
fn give_up_after(
    consecutive_failures: &mut u32,
    error: DaemonError,
    last_error: &StdMutex<Option<WatcherError>>,
) -> bool {
    *consecutive_failures += 1;
    if *consecutive_failures < MAX_CONSECUTIVE_FAILURES {
        return false;
    }
    error!("daemon unreachable for {consecutive_failures} consecutive polls, giving up: {error}");
    *last_error.lock().unwrap_or_else(std::sync::PoisonError::into_inner) =
        Some(WatcherError::DaemonUnavailable(error));
    true
}

async fn mempool_poll_loop<D: DaemonClient>(
    daemon: Arc<D>,
    mempool_subs: Arc<Publisher<D::Tx>>,
    mut shutdown: watch::Receiver<bool>,
    last_error: Arc<StdMutex<Option<WatcherError>>>,
    interval: Duration,
) {
    let mut prev_mempool_tx_ids: HashSet<String> = HashSet::new();
    let mut consecutive_failures = 0u32;
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            () = tokio::time::sleep(interval) => {}
        }
        if *shutdown.borrow() {
            return;
        }

        let current_ids = match daemon.mempool_tx_ids().await {
            Ok(ids) => {
                consecutive_failures = 0;
                ids
            }
            Err(e) => {
                warn!("mempool poll could not reach daemon: {e}");
                if give_up_after(&mut consecutive_failures, e, &last_error) {
                    return;
                }
                continue;
            }
        };
        let current: HashSet<String> = current_ids.into_iter().collect();
        let new_ids: Vec<String> = current.difference(&prev_mempool_tx_ids).cloned().collect();

        for id in new_ids {
            match daemon.fetch_transactions(std::slice::from_ref(&id)).await {
                Ok(mut txs) if !txs.is_empty() => {
                    mempool_subs.publish(txs.remove(0)).await;
                }
                Ok(_) => debug!("mempool tx {id} vanished before it could be fetched"),
                Err(e) => error!("failed to fetch mempool tx {id}: {e}"),
            }
        }
        prev_mempool_tx_ids = current;
    }
}

/// Failure driving a [`ChainWatcher`]'s polling loops.
#[derive(Error, Debug)]
pub enum WatcherError {
    /// The daemon could not be reached or returned malformed data.
    #[error("daemon unavailable: {0}")]
    DaemonUnavailable(#[from] DaemonError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::monero::MockMoneroClient;

    #[tokio::test]
    async fn new_watcher_reports_its_starting_height() {
        let mock = MockMoneroClient::default();
        let watcher = ChainWatcher::new(mock);
        watcher.start(42).await;
        assert_eq!(watcher.last_synced_block_height(), 42);
        watcher.stop().await;
    }

    #[tokio::test]
    async fn start_is_idempotent_while_running() {
        let mock = MockMoneroClient::default();
        let watcher = ChainWatcher::new(mock);
        watcher.start(1).await;
        // A second start before the first height's recorded is a no-op, not
        // a reset to 99 — polling was already underway at height 1.
        watcher.start(99).await;
        assert_eq!(watcher.last_synced_block_height(), 1);
        watcher.stop().await;
    }

    #[tokio::test]
    async fn stop_drops_subscriber_channels() {
        let mock = MockMoneroClient::default();
        let watcher = ChainWatcher::new(mock);
        let mut blocks = watcher.subscribe_blocks();
        watcher.start(0).await;
        watcher.stop().await;
        assert_eq!(blocks.recv().await, None);
    }

    #[test]
    fn give_up_after_trips_only_at_the_threshold() {
        let last_error = StdMutex::new(None);
        let mut consecutive_failures = 0u32;
        for _ in 0..MAX_CONSECUTIVE_FAILURES - 1 {
            assert!(!give_up_after(&mut consecutive_failures, DaemonError::MissingData("x".to_string()), &last_error));
            assert!(last_error.lock().unwrap().is_none());
        }
        assert!(give_up_after(&mut consecutive_failures, DaemonError::MissingData("x".to_string()), &last_error));
        assert!(matches!(*last_error.lock().unwrap(), Some(WatcherError::DaemonUnavailable(_))));
    }
}
