use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument, Span};

use super::{Error, Storage};
use crate::config::{DEFAULT_CHECKPOINT_CAPACITY, DEFAULT_FLUSH_INTERVAL_SECS};

/// Tokens set since the last successful flush.
///
/// Only the newest token matters: every token supersedes the ones before it,
/// so the buffer keeps a single cell plus a counter instead of a queue.
#[derive(Debug, Default)]
struct Pending {
    latest: Option<String>,
    count: usize,
}

/// Coalescing write buffer in front of a [`Storage`].
///
/// Tokens are flushed when `capacity` of them accumulated, on every tick of
/// [`watch`](Self::watch), and once more on [`close`](Self::close). A flush
/// writes only the newest pending token. Both flush triggers go through the
/// same lock, so they never write twice or drop the newest value.
pub struct CheckpointBuffer {
    pending: Mutex<Pending>,
    capacity: usize,
    interval: Duration,
    storage: Arc<dyn Storage>,
    span: Span,
}

impl CheckpointBuffer {
    /// A zero `capacity` or `interval` falls back to the built-in default.
    pub fn new(
        capacity: usize,
        interval: Duration,
        storage: Arc<dyn Storage>,
        span: Span,
    ) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_CHECKPOINT_CAPACITY
        } else {
            capacity
        };
        let interval = if interval.is_zero() {
            Duration::from_secs(DEFAULT_FLUSH_INTERVAL_SECS)
        } else {
            interval
        };
        Self {
            pending: Mutex::new(Pending::default()),
            capacity,
            interval,
            storage,
            span,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Record `token` as the newest acknowledged position.
    ///
    /// Flushes before returning when the pending count reaches capacity. If
    /// that flush fails the token stays pending for the next attempt.
    pub async fn set(&self, token: impl Into<String>) -> Result<(), Error> {
        let mut pending = self.pending.lock().await;
        pending.latest = Some(token.into());
        pending.count += 1;
        if pending.count >= self.capacity {
            self.flush_locked(&mut pending).await?;
        }
        Ok(())
    }

    /// Write the newest pending token, if any, and reset the pending state.
    pub async fn flush(&self) -> Result<(), Error> {
        let mut pending = self.pending.lock().await;
        self.flush_locked(&mut pending).await
    }

    async fn flush_locked(&self, pending: &mut Pending) -> Result<(), Error> {
        let Some(latest) = pending.latest.as_deref() else {
            return Ok(());
        };
        self.storage.write(latest).await?;
        self.span
            .in_scope(|| debug!(coalesced = pending.count, "flushed checkpoint"));
        *pending = Pending::default();
        Ok(())
    }

    /// The last durably committed token, empty if there is none.
    pub async fn get(&self) -> Result<String, Error> {
        self.storage.read().await
    }

    /// Forget the stored token and anything pending.
    pub async fn clear(&self) -> Result<(), Error> {
        let mut pending = self.pending.lock().await;
        self.storage.clear().await?;
        *pending = Pending::default();
        Ok(())
    }

    /// Flush on a fixed interval until `cancel` fires.
    ///
    /// Flush errors are logged and retried on the next tick.
    pub async fn watch(&self, cancel: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        async {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("checkpoint buffer watcher stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.flush().await {
                            warn!(error = %e, "failed to flush checkpoint buffer");
                        }
                    }
                }
            }
        }
        .instrument(self.span.clone())
        .await
    }

    /// Flush one last time, then close the storage.
    ///
    /// Returns the first error from either step.
    pub async fn close(&self) -> Result<(), Error> {
        let flushed = self.flush().await;
        let closed = self.storage.close().await;
        self.span.in_scope(|| {
            if let Err(e) = &flushed {
                error!(error = %e, "final checkpoint flush failed");
            }
            if let Err(e) = &closed {
                error!(error = %e, "failed to close checkpoint storage");
            }
        });
        flushed.and(closed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::persistent::MemoryStorage;

    fn buffer(capacity: usize, interval: Duration) -> (CheckpointBuffer, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let buffer = CheckpointBuffer::new(capacity, interval, storage.clone(), Span::none());
        (buffer, storage)
    }

    /// Fails writes while `failing` is set.
    #[derive(Default)]
    struct FlakyStorage {
        inner: MemoryStorage,
        failing: AtomicBool,
    }

    #[async_trait]
    impl Storage for FlakyStorage {
        async fn write(&self, value: &str) -> Result<(), Error> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(Error::Io(std::io::Error::other("disk full")));
            }
            self.inner.write(value).await
        }

        async fn read(&self) -> Result<String, Error> {
            self.inner.read().await
        }

        async fn clear(&self) -> Result<(), Error> {
            self.inner.clear().await
        }

        async fn close(&self) -> Result<(), Error> {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn test_flush_writes_only_latest() {
        let (buffer, storage) = buffer(100, Duration::from_secs(60));

        buffer.set("t1").await.unwrap();
        buffer.set("t2").await.unwrap();
        buffer.set("t3").await.unwrap();
        buffer.flush().await.unwrap();

        assert_eq!(storage.history().await, vec!["t3"]);
        assert_eq!(buffer.get().await.unwrap(), "t3");
    }

    #[tokio::test]
    async fn test_flush_empty_is_noop() {
        let (buffer, storage) = buffer(100, Duration::from_secs(60));

        buffer.flush().await.unwrap();
        buffer.set("t1").await.unwrap();
        buffer.flush().await.unwrap();
        buffer.flush().await.unwrap();

        assert_eq!(storage.history().await, vec!["t1"]);
    }

    #[tokio::test]
    async fn test_capacity_triggers_flush() {
        let (buffer, storage) = buffer(3, Duration::from_secs(60));

        buffer.set("t1").await.unwrap();
        buffer.set("t2").await.unwrap();
        assert!(storage.history().await.is_empty());

        buffer.set("t3").await.unwrap();
        assert_eq!(storage.history().await, vec!["t3"]);

        buffer.set("t4").await.unwrap();
        buffer.set("t5").await.unwrap();
        buffer.set("t6").await.unwrap();
        assert_eq!(storage.history().await, vec!["t3", "t6"]);
    }

    #[tokio::test]
    async fn test_zero_capacity_falls_back_to_default() {
        let (buffer, storage) = buffer(0, Duration::ZERO);
        assert_eq!(buffer.capacity(), DEFAULT_CHECKPOINT_CAPACITY);
        assert_eq!(
            buffer.interval(),
            Duration::from_secs(DEFAULT_FLUSH_INTERVAL_SECS)
        );

        buffer.set("t1").await.unwrap();
        assert!(storage.history().await.is_empty());
    }

    #[tokio::test]
    async fn test_close_flushes_pending_then_closes_storage() {
        let (buffer, storage) = buffer(100, Duration::from_secs(60));

        buffer.set("t1").await.unwrap();
        buffer.set("t2").await.unwrap();
        buffer.close().await.unwrap();

        assert_eq!(storage.history().await, vec!["t2"]);
        assert!(storage.is_closed().await);
    }

    #[tokio::test]
    async fn test_clear_then_round_trip() {
        let storage = Arc::new(MemoryStorage::with_value("stale"));
        let buffer =
            CheckpointBuffer::new(100, Duration::from_secs(60), storage.clone(), Span::none());
        assert_eq!(buffer.get().await.unwrap(), "stale");

        buffer.set("pending").await.unwrap();
        buffer.clear().await.unwrap();
        assert_eq!(buffer.get().await.unwrap(), "");

        // Pending values are dropped by clear.
        buffer.flush().await.unwrap();
        assert!(storage.history().await.is_empty());

        buffer.set("t1").await.unwrap();
        buffer.flush().await.unwrap();
        assert_eq!(buffer.get().await.unwrap(), "t1");
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_token_for_retry() {
        let storage = Arc::new(FlakyStorage::default());
        let buffer =
            CheckpointBuffer::new(100, Duration::from_secs(60), storage.clone(), Span::none());

        storage.failing.store(true, Ordering::SeqCst);
        buffer.set("t1").await.unwrap();
        assert!(buffer.flush().await.is_err());

        storage.failing.store(false, Ordering::SeqCst);
        buffer.flush().await.unwrap();
        assert_eq!(buffer.get().await.unwrap(), "t1");
    }

    #[tokio::test]
    async fn test_close_reports_flush_error_and_still_closes() {
        let storage = Arc::new(FlakyStorage::default());
        let buffer =
            CheckpointBuffer::new(100, Duration::from_secs(60), storage.clone(), Span::none());

        buffer.set("t1").await.unwrap();
        storage.failing.store(true, Ordering::SeqCst);

        assert!(matches!(buffer.close().await, Err(Error::Io(_))));
        assert!(storage.inner.is_closed().await);
    }

    #[tokio::test]
    async fn test_watch_flushes_on_interval_and_stops_on_cancel() {
        let (buffer, storage) = buffer(100, Duration::from_millis(20));
        let buffer = Arc::new(buffer);
        let cancel = CancellationToken::new();

        let watcher = tokio::spawn({
            let buffer = buffer.clone();
            let cancel = cancel.clone();
            async move { buffer.watch(cancel).await }
        });

        buffer.set("t1").await.unwrap();
        buffer.set("t2").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(storage.history().await, vec!["t2"]);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), watcher)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_sets_keep_newest() {
        let (buffer, storage) = buffer(3, Duration::from_millis(5));
        let buffer = Arc::new(buffer);
        let cancel = CancellationToken::new();
        let ticker = tokio::spawn({
            let buffer = buffer.clone();
            let cancel = cancel.clone();
            async move { buffer.watch(cancel).await }
        });

        let mut tasks = Vec::new();
        for worker in 0..4 {
            let buffer = buffer.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..50 {
                    buffer.set(format!("w{worker}-{i}")).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        buffer.set("last").await.unwrap();
        cancel.cancel();
        ticker.await.unwrap();
        buffer.flush().await.unwrap();

        assert_eq!(buffer.get().await.unwrap(), "last");
        assert_eq!(storage.history().await.last().map(String::as_str), Some("last"));
    }
}
