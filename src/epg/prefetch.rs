//! Background batch prefetch
//!
//! Walks a channel list in fixed-size batches on a spawned task, feeding the
//! progress tracker and flushing the cache periodically. Fetch failures never
//! stop the batch; every channel ends up with real or synthetic data.

use std::sync::Arc;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::epg::cache::ScheduleCache;
use crate::epg::fetcher::Fetcher;
use crate::epg::models::Channel;
use crate::epg::progress::{ProgressSnapshot, ProgressTracker};

/// Invoked with a snapshot after every processed channel
pub type ProgressCallback = Arc<dyn Fn(&ProgressSnapshot) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchOutcome {
    /// Every channel was already fresh or had no schedule source
    NothingToLoad,
    Completed,
    Cancelled,
}

/// Handle to a running prefetch. Dropping it does not stop the task.
pub struct PrefetchHandle {
    task: JoinHandle<PrefetchOutcome>,
    cancel: CancellationToken,
}

impl PrefetchHandle {
    /// Stop before the next batch; the current batch finishes
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn abort_handle(&self) -> AbortHandle {
        self.task.abort_handle()
    }

    pub async fn wait(self) -> PrefetchOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("EPG prefetch task failed: {}", e);
                PrefetchOutcome::Cancelled
            }
        }
    }
}

pub struct Prefetcher {
    fetcher: Arc<Fetcher>,
    cache: Arc<ScheduleCache>,
    progress: Arc<ProgressTracker>,
    batch_size: usize,
    flush_every: usize,
    /// Shared by every run so overlapping prefetches respect one bound
    permits: Arc<Semaphore>,
}

impl Prefetcher {
    pub fn new(
        fetcher: Arc<Fetcher>,
        cache: Arc<ScheduleCache>,
        progress: Arc<ProgressTracker>,
        batch_size: usize,
        flush_every: usize,
    ) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            fetcher,
            cache,
            progress,
            batch_size,
            flush_every: flush_every.max(1),
            permits: Arc::new(Semaphore::new(batch_size)),
        }
    }

    /// Run `run` on a background task
    pub fn spawn(
        self: &Arc<Self>,
        channels: Vec<Channel>,
        on_progress: Option<ProgressCallback>,
    ) -> PrefetchHandle {
        let cancel = CancellationToken::new();
        let prefetcher = Arc::clone(self);
        let token = cancel.clone();

        let task = tokio::spawn(async move { prefetcher.run(channels, on_progress, token).await });

        PrefetchHandle { task, cancel }
    }

    pub async fn run(
        &self,
        channels: Vec<Channel>,
        on_progress: Option<ProgressCallback>,
        cancel: CancellationToken,
    ) -> PrefetchOutcome {
        let requested = channels.len();
        let pending: Vec<Channel> = channels
            .into_iter()
            .filter(|c| c.has_schedule_source && !self.cache.has(&c.key))
            .collect();

        if pending.is_empty() {
            debug!("EPG prefetch: nothing to load ({} channels requested)", requested);
            let snapshot = self.progress.nothing_to_load();
            emit(&on_progress, &snapshot);
            return PrefetchOutcome::NothingToLoad;
        }

        info!(
            "EPG prefetch started: {} of {} channels need data",
            pending.len(),
            requested
        );
        let batch = self.progress.begin(pending.len());
        emit(&on_progress, &self.progress.snapshot());

        let mut processed = 0usize;
        let mut cancelled = false;

        for chunk in pending.chunks(self.batch_size) {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let mut in_flight: FuturesUnordered<_> =
                chunk.iter().map(|channel| self.fetch_one(channel)).collect();

            while let Some(channel) = in_flight.next().await {
                processed += 1;

                let label = if channel.display_name.is_empty() {
                    channel.key.as_str()
                } else {
                    channel.display_name.as_str()
                };
                if let Some(snapshot) = self.progress.record(batch, label) {
                    emit(&on_progress, &snapshot);
                }

                if processed % self.flush_every == 0 {
                    self.flush().await;
                }
            }

            // Let other tasks run between batches
            tokio::task::yield_now().await;
        }

        self.flush().await;

        let (message, outcome) = if cancelled {
            ("cancelled", PrefetchOutcome::Cancelled)
        } else {
            ("done", PrefetchOutcome::Completed)
        };
        if let Some(snapshot) = self.progress.finish(batch, message) {
            emit(&on_progress, &snapshot);
        }

        info!("EPG prefetch {}: {} channels processed", message, processed);
        outcome
    }

    async fn fetch_one<'a>(&'a self, channel: &'a Channel) -> &'a Channel {
        // The semaphore is never closed, a failed acquire only loses the bound
        let _permit = self.permits.acquire().await.ok();
        self.fetcher.fetch(channel).await;
        channel
    }

    async fn flush(&self) {
        let cache = Arc::clone(&self.cache);
        if let Err(e) = tokio::task::spawn_blocking(move || cache.persist()).await {
            warn!("EPG cache flush task failed: {}", e);
        }
    }
}

fn emit(on_progress: &Option<ProgressCallback>, snapshot: &ProgressSnapshot) {
    if let Some(callback) = on_progress {
        callback(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epg::progress::ProgressPhase;
    use crate::epg::sources::SourceResolver;
    use crate::epg::testing::StubClient;
    use crate::epg::parser::generate_synthetic;
    use crate::store::{KeyValueStore, MemoryStore, StoreError};
    use parking_lot::Mutex;
    use std::time::Duration;

    struct Harness {
        prefetcher: Arc<Prefetcher>,
        cache: Arc<ScheduleCache>,
        progress: Arc<ProgressTracker>,
        client: Arc<StubClient>,
        store: Arc<MemoryStore>,
    }

    /// One mirror per channel, so every fetch is exactly one request
    fn harness(delay: Duration) -> Harness {
        let store = Arc::new(MemoryStore::new());
        harness_on(store.clone(), store, delay)
    }

    fn harness_on(
        backend: Arc<dyn KeyValueStore>,
        store: Arc<MemoryStore>,
        delay: Duration,
    ) -> Harness {
        let cache = Arc::new(ScheduleCache::new(
            backend.clone(),
            "epg_cache",
            chrono::Duration::hours(24),
        ));
        let sources = Arc::new(SourceResolver::new(
            backend,
            "epg_custom_source",
            vec!["http://mirror.test/{channel}.xml".to_string()],
        ));
        let client = Arc::new(StubClient::with_delay(delay));
        let fetcher = Arc::new(Fetcher::new(
            cache.clone(),
            sources,
            client.clone(),
            Duration::from_secs(1),
        ));
        let progress = Arc::new(ProgressTracker::new());
        let prefetcher = Arc::new(Prefetcher::new(fetcher, cache.clone(), progress.clone(), 8, 10));
        Harness {
            prefetcher,
            cache,
            progress,
            client,
            store,
        }
    }

    /// Counts cache writes and the channel count of each written blob
    struct CountingStore {
        inner: MemoryStore,
        flushed: Mutex<Vec<usize>>,
    }

    impl KeyValueStore for CountingStore {
        fn read(&self, namespace: &str) -> Result<Option<String>, StoreError> {
            self.inner.read(namespace)
        }

        fn write(&self, namespace: &str, value: &str) -> Result<(), StoreError> {
            if namespace == "epg_cache" {
                let records: serde_json::Map<String, serde_json::Value> =
                    serde_json::from_str(value).unwrap();
                self.flushed.lock().push(records.len());
            }
            self.inner.write(namespace, value)
        }

        fn remove(&self, namespace: &str) -> Result<(), StoreError> {
            self.inner.remove(namespace)
        }

        fn keys(&self) -> Result<Vec<String>, StoreError> {
            self.inner.keys()
        }
    }

    fn channels(count: usize) -> Vec<Channel> {
        (0..count)
            .map(|i| Channel::new(format!("ch{}", i), format!("Channel {}", i)))
            .collect()
    }

    fn recorder() -> (ProgressCallback, Arc<Mutex<Vec<ProgressSnapshot>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: ProgressCallback = Arc::new(move |s: &ProgressSnapshot| sink.lock().push(s.clone()));
        (callback, seen)
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let h = harness(Duration::from_millis(20));

        let outcome = h
            .prefetcher
            .run(channels(21), None, CancellationToken::new())
            .await;

        assert_eq!(outcome, PrefetchOutcome::Completed);
        assert_eq!(h.client.requests(), 21);
        assert_eq!(h.client.max_in_flight(), 8);
        assert_eq!(h.cache.len(), 21);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let h = harness(Duration::from_millis(5));
        let (callback, seen) = recorder();
        assert_eq!(h.progress.snapshot().phase, ProgressPhase::Idle);

        h.prefetcher
            .run(channels(12), Some(callback), CancellationToken::new())
            .await;

        let seen = seen.lock();
        let (last, loading) = seen.split_last().unwrap();
        assert_eq!(loading.len(), 13);
        assert_eq!(loading[0].processed, 0);
        assert!(loading.iter().all(|s| s.is_loading && s.total == 12));
        assert!(loading.windows(2).all(|w| w[0].processed <= w[1].processed));

        assert!(!last.is_loading);
        assert_eq!(last.processed, 12);
        assert_eq!(last.message, "done");
        assert_eq!(last.fraction_complete, 1.0);
        assert_eq!(h.progress.snapshot().phase, ProgressPhase::Complete);
    }

    #[tokio::test]
    async fn test_fresh_channels_are_skipped() {
        let h = harness(Duration::ZERO);
        let all = channels(20);
        for channel in &all[..5] {
            h.cache.put(&channel.key, generate_synthetic(&channel.key));
        }
        let (callback, seen) = recorder();

        h.prefetcher
            .run(all, Some(callback), CancellationToken::new())
            .await;

        assert_eq!(seen.lock()[0].total, 15);
        assert_eq!(h.client.requests(), 15);
        assert_eq!(h.cache.len(), 20);
    }

    #[tokio::test]
    async fn test_nothing_to_load() {
        let h = harness(Duration::ZERO);
        let (callback, seen) = recorder();
        let list = vec![
            Channel::without_schedule("radio1", "Radio 1"),
            Channel::without_schedule("radio2", "Radio 2"),
        ];

        let outcome = h
            .prefetcher
            .run(list, Some(callback), CancellationToken::new())
            .await;

        assert_eq!(outcome, PrefetchOutcome::NothingToLoad);
        assert_eq!(h.client.requests(), 0);
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].message, "nothing to load");
        assert!(!seen[0].is_loading);
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let h = harness(Duration::ZERO);
        let token = CancellationToken::new();
        token.cancel();

        let outcome = h.prefetcher.run(channels(5), None, token).await;

        assert_eq!(outcome, PrefetchOutcome::Cancelled);
        assert_eq!(h.client.requests(), 0);
        let snapshot = h.progress.snapshot();
        assert!(!snapshot.is_loading);
        assert_eq!(snapshot.message, "cancelled");
    }

    #[tokio::test]
    async fn test_cancel_stops_after_current_batch() {
        let h = harness(Duration::from_millis(100));
        let handle = h.prefetcher.spawn(channels(20), None);

        while h.client.requests() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.cancel();

        assert_eq!(handle.wait().await, PrefetchOutcome::Cancelled);
        let snapshot = h.progress.snapshot();
        assert_eq!(snapshot.processed, 8);
        assert!(!snapshot.is_loading);
        assert_eq!(h.client.requests(), 8);
    }

    #[tokio::test]
    async fn test_cache_is_flushed_every_ten_channels() {
        let counting = Arc::new(CountingStore {
            inner: MemoryStore::new(),
            flushed: Mutex::new(Vec::new()),
        });
        let h = harness_on(counting.clone(), Arc::new(MemoryStore::new()), Duration::ZERO);

        h.prefetcher
            .run(channels(25), None, CancellationToken::new())
            .await;

        // After the 10th and 20th channel, then once at the end
        assert_eq!(*counting.flushed.lock(), vec![10, 20, 25]);
    }

    #[tokio::test]
    async fn test_cache_is_flushed() {
        let h = harness(Duration::ZERO);

        h.prefetcher
            .run(channels(25), None, CancellationToken::new())
            .await;

        assert!(h.store.read("epg_cache").unwrap().is_some());
        let reloaded = ScheduleCache::new(h.store.clone(), "epg_cache", chrono::Duration::hours(24));
        reloaded.load();
        assert_eq!(reloaded.len(), 25);
    }
}
