//! Single-channel EPG fetch
//!
//! Cache -> custom source -> public mirrors -> synthetic schedule. Every
//! failure along the way is logged and the next step runs; callers always
//! get a non-empty schedule for channels that declare a schedule source.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::select_ok;
use tracing::{debug, info, warn};

use crate::epg::cache::ScheduleCache;
use crate::epg::client::HttpClient;
use crate::epg::error::EpgError;
use crate::epg::models::{Channel, ScheduleEntry};
use crate::epg::parser::{decode_document, generate_synthetic, try_parse_schedule};
use crate::epg::sources::SourceResolver;

pub struct Fetcher {
    cache: Arc<ScheduleCache>,
    sources: Arc<SourceResolver>,
    client: Arc<dyn HttpClient>,
    request_timeout: Duration,
}

impl Fetcher {
    pub fn new(
        cache: Arc<ScheduleCache>,
        sources: Arc<SourceResolver>,
        client: Arc<dyn HttpClient>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            sources,
            client,
            request_timeout,
        }
    }

    /// Schedule for `channel`; `None` only when it has no schedule source
    pub async fn fetch(&self, channel: &Channel) -> Option<Vec<ScheduleEntry>> {
        if !channel.has_schedule_source {
            return None;
        }
        let key = channel.key.as_str();

        if let Some(entries) = self.cache.get(key) {
            debug!("EPG cache hit for {}", key);
            return Some(entries);
        }

        if let Some(url) = self.sources.custom_url_for(key) {
            match self.fetch_document(&url, key).await {
                Ok(entries) => {
                    info!("Fetched {} programmes for {} from custom source", entries.len(), key);
                    return Some(self.store(key, entries));
                }
                Err(e) => warn!("Custom EPG source failed for {}: {}", key, e),
            }
        }

        if let Some(entries) = self.fetch_from_mirrors(key).await {
            info!("Fetched {} programmes for {} from mirror", entries.len(), key);
            return Some(self.store(key, entries));
        }

        // Cached too, so a known-bad source is not retried before the TTL runs out
        info!("No EPG data for {}, using synthetic schedule", key);
        Some(self.store(key, generate_synthetic(key)))
    }

    fn store(&self, key: &str, entries: Vec<ScheduleEntry>) -> Vec<ScheduleEntry> {
        self.cache.put(key, entries.clone());
        entries
    }

    /// Query every mirror at once and take the first usable answer
    async fn fetch_from_mirrors(&self, key: &str) -> Option<Vec<ScheduleEntry>> {
        let urls = self.sources.mirror_urls(key);
        if urls.is_empty() {
            debug!("No mirror URLs for {}", key);
            return None;
        }

        let attempts = urls.iter().map(|url| {
            Box::pin(async move {
                let result = self.fetch_document(url, key).await;
                if let Err(ref e) = result {
                    debug!("Mirror {} failed: {}", url, e);
                }
                result
            })
        });

        // Remaining requests are dropped (aborted) once one succeeds
        let result = select_ok(attempts).await;
        match result {
            Ok((entries, _pending)) => Some(entries),
            Err(e) => {
                debug!("All {} mirrors failed for {}, last error: {}", urls.len(), key, e);
                None
            }
        }
    }

    /// GET `url` and parse it for `key`; an empty result is an error here
    async fn fetch_document(&self, url: &str, key: &str) -> Result<Vec<ScheduleEntry>, EpgError> {
        let request = self.client.get(url, self.request_timeout);
        let response = match tokio::time::timeout(self.request_timeout, request).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(EpgError::NetworkTimeout {
                    url: url.to_string(),
                })
            }
        };

        if !response.is_success() {
            return Err(EpgError::network(url, format!("HTTP {}", response.status)));
        }

        // Large guides take a while to parse, keep that off the async workers
        let body = response.body;
        let channel_key = key.to_string();
        let entries = tokio::task::spawn_blocking(move || {
            let document = decode_document(&body)?;
            try_parse_schedule(&document, &channel_key)
        })
        .await
        .map_err(|e| EpgError::Parse(format!("parser task failed: {}", e)))??;

        if entries.is_empty() {
            return Err(EpgError::NotFoundInDocument {
                channel: key.to_string(),
            });
        }
        Ok(entries)
    }
}
