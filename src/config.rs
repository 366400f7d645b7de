//! EPG service configuration

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Records older than this are refetched
const DEFAULT_CACHE_TTL_HOURS: u64 = 24;

/// Per-request network timeout
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum concurrent channel fetches during a prefetch
const DEFAULT_BATCH_SIZE: usize = 8;

/// Flush the cache to storage every N processed channels
const DEFAULT_FLUSH_EVERY: usize = 10;

/// Public per-channel XMLTV mirrors, `{channel}` is the normalized key
const DEFAULT_MIRRORS: &[&str] = &[
    "https://iptv-org.github.io/epg/guides/channels/{channel}.xml",
    "https://epgshare01.online/epgshare01/channels/{channel}.xml.gz",
    "https://raw.githubusercontent.com/iptv-org/epg/master/channels/{channel}.xml",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EpgConfig {
    pub cache_ttl_hours: u64,
    pub request_timeout_secs: u64,
    pub batch_size: usize,
    pub flush_every: usize,
    pub mirror_templates: Vec<String>,
    pub user_agent: String,
    /// Storage namespace for the serialized schedule cache
    pub cache_namespace: String,
    /// Storage namespace for the custom source URL
    pub source_namespace: String,
    /// Largest blob the store accepts; bigger caches are trimmed on flush
    pub max_store_bytes: Option<usize>,
    pub debug_logging: bool,
}

impl Default for EpgConfig {
    fn default() -> Self {
        Self {
            cache_ttl_hours: DEFAULT_CACHE_TTL_HOURS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            batch_size: DEFAULT_BATCH_SIZE,
            flush_every: DEFAULT_FLUSH_EVERY,
            mirror_templates: DEFAULT_MIRRORS.iter().map(|m| m.to_string()).collect(),
            user_agent: format!("ynotv-epg/{}", env!("CARGO_PKG_VERSION")),
            cache_namespace: "epg_cache".to_string(),
            source_namespace: "epg_custom_source".to_string(),
            max_store_bytes: None,
            debug_logging: false,
        }
    }
}

impl EpgConfig {
    /// Load configuration from a JSON file; missing fields take defaults
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read EPG config {:?}", path))?;
        let config: EpgConfig =
            serde_json::from_str(&content).context("Failed to parse EPG config")?;
        Ok(config.sanitized())
    }

    pub fn with_ttl_hours(mut self, hours: u64) -> Self {
        self.cache_ttl_hours = hours;
        self
    }

    pub fn with_mirrors<I, S>(mut self, templates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.mirror_templates = templates.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_store_bytes(mut self, bytes: usize) -> Self {
        self.max_store_bytes = Some(bytes);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.cache_ttl_hours as i64)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Zero batch or flush sizes would stall the prefetcher
    fn sanitized(mut self) -> Self {
        self.batch_size = self.batch_size.max(1);
        self.flush_every = self.flush_every.max(1);
        self.request_timeout_secs = self.request_timeout_secs.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = EpgConfig::default();
        assert_eq!(config.cache_ttl(), chrono::Duration::hours(24));
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.flush_every, 10);
        assert!(config.mirror_templates.iter().all(|m| m.contains("{channel}")));
    }

    #[test]
    fn test_load_partial_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("epg.json");
        std::fs::write(
            &path,
            r#"{ "batch_size": 0, "mirror_templates": ["http://m/{channel}.xml"], "max_store_bytes": 4096 }"#,
        )
        .unwrap();

        let config = EpgConfig::load(&path).unwrap();
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.mirror_templates, vec!["http://m/{channel}.xml"]);
        assert_eq!(config.cache_ttl_hours, 24);
        assert_eq!(config.cache_namespace, "epg_cache");
        assert_eq!(config.max_store_bytes, Some(4096));
        assert_eq!(EpgConfig::default().max_store_bytes, None);
    }

    #[test]
    fn test_load_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        assert!(EpgConfig::load(&temp_dir.path().join("nope.json")).is_err());
    }
}
