//! Data models for EPG operations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One programme occurrence on a channel, covering `[start, end)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Key the entry was fetched/parsed for
    pub channel_key: String,
}

impl ScheduleEntry {
    /// `end` must be strictly after `start`
    pub fn is_valid(&self) -> bool {
        self.end > self.start
    }

    pub fn is_airing_at(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}

/// A channel as supplied by the playlist layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub key: String,
    pub display_name: String,
    /// False when the playlist gives no EPG id for this channel
    pub has_schedule_source: bool,
}

impl Channel {
    pub fn new(key: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            display_name: display_name.into(),
            has_schedule_source: true,
        }
    }

    pub fn without_schedule(key: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            has_schedule_source: false,
            ..Self::new(key, display_name)
        }
    }
}

/// Cached schedule for one channel key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRecord {
    pub entries: Vec<ScheduleEntry>,
    pub fetched_at: DateTime<Utc>,
}

/// Programme airing at `at`, entries must be sorted by start
pub fn current_entry(entries: &[ScheduleEntry], at: DateTime<Utc>) -> Option<&ScheduleEntry> {
    entries.iter().find(|e| e.is_airing_at(at))
}

/// First programme starting after `at`
pub fn next_entry(entries: &[ScheduleEntry], at: DateTime<Utc>) -> Option<&ScheduleEntry> {
    entries.iter().find(|e| e.start > at)
}

/// Programmes overlapping `[from, to)`
pub fn entries_in_range(
    entries: &[ScheduleEntry],
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Vec<&ScheduleEntry> {
    entries.iter().filter(|e| e.end > from && e.start < to).collect()
}
