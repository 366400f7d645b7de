//! EPG schedule cache
//!
//! In-memory map of channel key -> schedule, hydrated from and flushed to a
//! `KeyValueStore` as one JSON blob.
//!
//! Features:
//! - TTL based freshness (records are replaced wholesale, never patched)
//! - Concurrent readers, serialized writers
//! - Quota handling on flush: evict the oldest half and retry once
//!
//! Nothing here returns an error to the caller. Storage problems are logged
//! and behave like a cache miss.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::epg::models::{CacheRecord, ScheduleEntry};
use crate::store::{KeyValueStore, StoreError};

/// Channel schedule cache
pub struct ScheduleCache {
    records: RwLock<HashMap<String, CacheRecord>>,
    store: Arc<dyn KeyValueStore>,
    namespace: String,
    ttl: chrono::Duration,
}

impl ScheduleCache {
    pub fn new(store: Arc<dyn KeyValueStore>, namespace: &str, ttl: chrono::Duration) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            store,
            namespace: namespace.to_string(),
            ttl,
        }
    }

    /// Fresh, non-empty record exists for `key`
    pub fn has(&self, key: &str) -> bool {
        self.has_at(key, Utc::now())
    }

    pub fn has_at(&self, key: &str, now: DateTime<Utc>) -> bool {
        self.records
            .read()
            .get(key)
            .is_some_and(|record| self.is_fresh(record, now))
    }

    /// Cached entries for `key`, only when `has(key)` holds
    pub fn get(&self, key: &str) -> Option<Vec<ScheduleEntry>> {
        self.get_at(key, Utc::now())
    }

    pub fn get_at(&self, key: &str, now: DateTime<Utc>) -> Option<Vec<ScheduleEntry>> {
        let records = self.records.read();
        let record = records.get(key)?;
        self.is_fresh(record, now).then(|| record.entries.clone())
    }

    /// Replace the record for `key`
    pub fn put(&self, key: &str, entries: Vec<ScheduleEntry>) {
        self.put_at(key, entries, Utc::now());
    }

    pub fn put_at(&self, key: &str, entries: Vec<ScheduleEntry>, fetched_at: DateTime<Utc>) {
        debug!("Caching {} entries for {}", entries.len(), key);
        self.records
            .write()
            .insert(key.to_string(), CacheRecord { entries, fetched_at });
    }

    /// Drop every record, in memory and in storage
    pub fn clear(&self) {
        self.records.write().clear();
        if let Err(e) = self.store.remove(&self.namespace) {
            warn!("Failed to remove persisted EPG cache: {}", e);
        }
        info!("EPG cache cleared");
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn is_fresh(&self, record: &CacheRecord, now: DateTime<Utc>) -> bool {
        !record.entries.is_empty() && now - record.fetched_at < self.ttl
    }

    /// Hydrate from storage, replacing in-memory records
    pub fn load(&self) {
        let blob = match self.store.read(&self.namespace) {
            Ok(Some(blob)) => blob,
            Ok(None) => {
                debug!("No persisted EPG cache found");
                return;
            }
            Err(e) => {
                warn!("Failed to read persisted EPG cache: {}", e);
                return;
            }
        };

        match serde_json::from_str::<HashMap<String, CacheRecord>>(&blob) {
            Ok(records) => {
                info!("Loaded {} cached EPG channels", records.len());
                *self.records.write() = records;
            }
            Err(e) => warn!("Discarding unreadable EPG cache: {}", e),
        }
    }

    /// Flush to storage; best effort
    pub fn persist(&self) {
        match self.write_snapshot() {
            Ok(()) => {}
            Err(e) if e.is_capacity_exceeded() => {
                let evicted = self.evict_oldest_half();
                warn!("EPG cache does not fit in storage ({}), evicted {} oldest channels", e, evicted);
                if let Err(e) = self.write_snapshot() {
                    warn!("EPG cache not persisted after eviction: {}", e);
                }
            }
            Err(e) => warn!("Failed to persist EPG cache: {}", e),
        }
    }

    fn write_snapshot(&self) -> Result<(), StoreError> {
        let blob = {
            let records = self.records.read();
            match serde_json::to_string(&*records) {
                Ok(blob) => blob,
                Err(e) => {
                    warn!("Failed to serialize EPG cache: {}", e);
                    return Ok(());
                }
            }
        };
        self.store.write(&self.namespace, &blob)?;
        debug!("Persisted EPG cache ({} bytes)", blob.len());
        Ok(())
    }

    /// Remove the older half of records by `fetched_at`, returning how many went
    fn evict_oldest_half(&self) -> usize {
        let mut records = self.records.write();

        let mut by_age: Vec<(DateTime<Utc>, String)> = records
            .iter()
            .map(|(key, record)| (record.fetched_at, key.clone()))
            .collect();
        by_age.sort();

        let count = by_age.len().div_ceil(2);
        for (_, key) in by_age.into_iter().take(count) {
            records.remove(&key);
        }
        count
    }

    pub fn stats(&self) -> CacheStats {
        let now = Utc::now();
        let records = self.records.read();

        CacheStats {
            records: records.len(),
            fresh_records: records.values().filter(|r| self.is_fresh(r, now)).count(),
            entries: records.values().map(|r| r.entries.len()).sum(),
            oldest_fetched_at: records.values().map(|r| r.fetched_at).min(),
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub records: usize,
    pub fresh_records: usize,
    pub entries: usize,
    pub oldest_fetched_at: Option<DateTime<Utc>>,
}
