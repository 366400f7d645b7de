//! EPG (Electronic Program Guide) acquisition
//!
//! Fetches, parses and caches per-channel broadcast schedules. Sources are
//! tried in order (cache, custom XMLTV URL, public mirrors) and a synthetic
//! schedule fills in when nothing else works, so the guide never has gaps.

pub mod cache;
pub mod client;
pub mod error;
pub mod fetcher;
pub mod models;
pub mod parser;
pub mod prefetch;
pub mod progress;
pub mod sources;

#[cfg(test)]
pub(crate) mod testing;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::EpgConfig;
use crate::store::{KeyValueStore, SqliteStore};

pub use cache::{CacheStats, ScheduleCache};
pub use client::{HttpClient, HttpResponse, ReqwestClient};
pub use error::EpgError;
pub use fetcher::Fetcher;
pub use models::{current_entry, entries_in_range, next_entry, Channel, ScheduleEntry};
pub use prefetch::{PrefetchHandle, PrefetchOutcome, Prefetcher, ProgressCallback};
pub use progress::{ProgressPhase, ProgressSnapshot, ProgressTracker};
pub use sources::SourceResolver;

/// Shared state for EPG operations
///
/// Cheap to clone; clones share the cache, source settings and progress.
#[derive(Clone)]
pub struct EpgService {
    store: Arc<dyn KeyValueStore>,
    cache: Arc<ScheduleCache>,
    sources: Arc<SourceResolver>,
    fetcher: Arc<Fetcher>,
    progress: Arc<ProgressTracker>,
    prefetcher: Arc<Prefetcher>,
    active_prefetch: Arc<Mutex<Option<(CancellationToken, AbortHandle)>>>,
}

impl EpgService {
    /// Build the service on top of `store` and `client`, hydrating the cache
    pub fn new(config: &EpgConfig, store: Arc<dyn KeyValueStore>, client: Arc<dyn HttpClient>) -> Self {
        let cache = Arc::new(ScheduleCache::new(
            store.clone(),
            &config.cache_namespace,
            config.cache_ttl(),
        ));
        cache.load();

        let sources = Arc::new(SourceResolver::new(
            store.clone(),
            &config.source_namespace,
            config.mirror_templates.clone(),
        ));
        let fetcher = Arc::new(Fetcher::new(
            cache.clone(),
            sources.clone(),
            client,
            config.request_timeout(),
        ));
        let progress = Arc::new(ProgressTracker::new());
        let prefetcher = Arc::new(Prefetcher::new(
            fetcher.clone(),
            cache.clone(),
            progress.clone(),
            config.batch_size,
            config.flush_every,
        ));

        info!(
            "EPG service initialized ({} cached channels, {} mirrors)",
            cache.len(),
            config.mirror_templates.len()
        );

        Self {
            store,
            cache,
            sources,
            fetcher,
            progress,
            prefetcher,
            active_prefetch: Arc::new(Mutex::new(None)),
        }
    }

    /// Open with a SQLite store at `db_path` and a reqwest client
    pub fn open(config: &EpgConfig, db_path: &Path) -> anyhow::Result<Self> {
        let mut store = SqliteStore::open(db_path)
            .with_context(|| format!("Failed to open EPG store at {:?}", db_path))?;
        if let Some(bytes) = config.max_store_bytes {
            store = store.with_max_value_bytes(bytes);
        }
        let client = ReqwestClient::new(&config.user_agent)?;
        Ok(Self::new(config, Arc::new(store), Arc::new(client)))
    }

    /// Schedule for one channel; `None` only without a schedule source
    pub async fn get_schedule(&self, channel: &Channel) -> Option<Vec<ScheduleEntry>> {
        self.fetcher.fetch(channel).await
    }

    /// Programme airing now and the one after it
    pub async fn now_and_next(
        &self,
        channel: &Channel,
    ) -> Option<(Option<ScheduleEntry>, Option<ScheduleEntry>)> {
        let entries = self.get_schedule(channel).await?;
        let now = Utc::now();
        Some((
            current_entry(&entries, now).cloned(),
            next_entry(&entries, now).cloned(),
        ))
    }

    /// Start a background prefetch, cancelling any prefetch still running
    pub fn prefetch_all(
        &self,
        channels: Vec<Channel>,
        on_progress: Option<ProgressCallback>,
    ) -> PrefetchHandle {
        let handle = self.prefetcher.spawn(channels, on_progress);

        let previous = self
            .active_prefetch
            .lock()
            .replace((handle.cancel_token(), handle.abort_handle()));
        if let Some((token, task)) = previous {
            if !task.is_finished() && !token.is_cancelled() {
                info!("Superseding running EPG prefetch");
                token.cancel();
            }
        }

        handle
    }

    pub fn cancel_prefetch(&self) {
        if let Some((token, _)) = self.active_prefetch.lock().take() {
            token.cancel();
        }
    }

    /// A prefetch started by `prefetch_all` is still running
    pub fn is_prefetching(&self) -> bool {
        self.active_prefetch
            .lock()
            .as_ref()
            .is_some_and(|(_, task)| !task.is_finished())
    }

    pub fn progress_snapshot(&self) -> ProgressSnapshot {
        self.progress.snapshot()
    }

    pub fn set_custom_source(&self, url: Option<&str>) {
        self.sources.set_custom_source(url);
    }

    pub fn custom_source(&self) -> Option<String> {
        self.sources.custom_source()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Namespaces currently held by the backing store
    pub fn stored_namespaces(&self) -> Vec<String> {
        match self.store.keys() {
            Ok(mut keys) => {
                keys.sort();
                keys
            }
            Err(e) => {
                warn!("Failed to list EPG store namespaces: {}", e);
                Vec::new()
            }
        }
    }

    /// Flush the cache; call before the process exits
    pub fn persist(&self) {
        self.cache.persist();
    }

    /// Cancel any prefetch and flush the cache
    pub async fn shutdown(&self) {
        info!("Stopping EPG service...");
        self.cancel_prefetch();

        let cache = self.cache.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || cache.persist()).await {
            warn!("Failed to persist EPG cache on shutdown: {}", e);
        }

        info!("EPG service stopped");
    }
}
