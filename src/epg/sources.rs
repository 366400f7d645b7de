//! EPG source resolution
//!
//! Decides which URLs to query for a channel: the user's custom XMLTV source
//! when one is configured, otherwise a fixed list of public mirrors derived
//! from the channel key.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::store::KeyValueStore;

/// Placeholder substituted with the normalized channel key
const CHANNEL_PLACEHOLDER: &str = "{channel}";

/// Resolves source URLs and owns the persisted custom source
pub struct SourceResolver {
    store: Arc<dyn KeyValueStore>,
    namespace: String,
    mirror_templates: Vec<String>,
    custom_url: RwLock<Option<String>>,
}

impl SourceResolver {
    /// Create a resolver, restoring the custom source from storage
    pub fn new(store: Arc<dyn KeyValueStore>, namespace: &str, mirror_templates: Vec<String>) -> Self {
        let custom_url = match store.read(namespace) {
            Ok(url) => url.and_then(|u| clean_url(&u)),
            Err(e) => {
                warn!("Failed to read custom EPG source: {}", e);
                None
            }
        };

        if let Some(ref url) = custom_url {
            info!("Using custom EPG source: {}", url);
        }

        Self {
            store,
            namespace: namespace.to_string(),
            mirror_templates,
            custom_url: RwLock::new(custom_url),
        }
    }

    pub fn custom_source(&self) -> Option<String> {
        self.custom_url.read().clone()
    }

    /// Set or clear the custom source. Blank URLs clear it.
    ///
    /// Cached schedules are left untouched; they age out through the TTL.
    pub fn set_custom_source(&self, url: Option<&str>) {
        let url = url.and_then(clean_url);

        let result = match url {
            Some(ref u) => self.store.write(&self.namespace, u),
            None => self.store.remove(&self.namespace),
        };
        if let Err(e) = result {
            warn!("Failed to persist custom EPG source: {}", e);
        }

        info!("Custom EPG source set to {:?}", url);
        *self.custom_url.write() = url;
    }

    /// Custom source URL for `channel_key`, if one is configured
    pub fn custom_url_for(&self, channel_key: &str) -> Option<String> {
        self.custom_url
            .read()
            .as_deref()
            .map(|template| expand_template(template, channel_key))
    }

    /// Public mirror URLs for `channel_key`
    pub fn mirror_urls(&self, channel_key: &str) -> Vec<String> {
        if normalize_channel_key(channel_key).is_empty() {
            return Vec::new();
        }
        self.mirror_templates
            .iter()
            .map(|template| expand_template(template, channel_key))
            .collect()
    }
}

/// Lowercase the key and keep only URL-safe characters.
///
/// Whitespace turns into `_`, anything else outside `[a-z0-9._-]` is dropped.
pub fn normalize_channel_key(key: &str) -> String {
    key.trim()
        .chars()
        .filter_map(|c| match c {
            c if c.is_ascii_alphanumeric() => Some(c.to_ascii_lowercase()),
            '.' | '-' | '_' => Some(c),
            c if c.is_whitespace() => Some('_'),
            _ => None,
        })
        .collect()
}

fn expand_template(template: &str, channel_key: &str) -> String {
    if template.contains(CHANNEL_PLACEHOLDER) {
        template.replace(CHANNEL_PLACEHOLDER, &normalize_channel_key(channel_key))
    } else {
        template.to_string()
    }
}

fn clean_url(url: &str) -> Option<String> {
    let url = url.trim();
    (!url.is_empty()).then(|| url.to_string())
}
