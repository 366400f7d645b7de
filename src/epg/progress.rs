//! Batch prefetch progress
//!
//! Idle -> Loading -> Complete, re-entered by every new prefetch. Readers
//! poll `snapshot()`; the prefetch task is the only writer.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPhase {
    Idle,
    Loading,
    Complete,
}

/// Identifies one prefetch run; updates from older runs are ignored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchId(u64);

/// Progress update sent to the UI
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub phase: ProgressPhase,
    pub total: usize,
    pub processed: usize,
    pub is_loading: bool,
    pub message: String,
    /// Wall-clock start of the current run
    pub started_at: Option<DateTime<Utc>>,
    pub fraction_complete: f64,
    /// Channels per second
    pub throughput: f64,
    pub estimated_remaining_seconds: Option<u64>,
    /// "calculating", "42s", "3m 20s" or "1h 5m"
    pub eta: String,
}

#[derive(Debug)]
struct ProgressState {
    phase: ProgressPhase,
    total: usize,
    processed: usize,
    message: String,
    started_at: Option<Instant>,
    started_wall: Option<DateTime<Utc>>,
    /// Set once the run completes, freezes elapsed time
    finished_at: Option<Instant>,
    generation: u64,
}

pub struct ProgressTracker {
    state: Mutex<ProgressState>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ProgressState {
                phase: ProgressPhase::Idle,
                total: 0,
                processed: 0,
                message: String::new(),
                started_at: None,
                started_wall: None,
                finished_at: None,
                generation: 0,
            }),
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        build_snapshot(&self.state.lock(), Instant::now())
    }

    /// Start a new run over `total` channels
    pub fn begin(&self, total: usize) -> BatchId {
        let mut state = self.state.lock();
        state.generation += 1;
        state.phase = ProgressPhase::Loading;
        state.total = total;
        state.processed = 0;
        state.message = format!("loading {} channels", total);
        state.started_at = Some(Instant::now());
        state.started_wall = Some(Utc::now());
        state.finished_at = None;
        BatchId(state.generation)
    }

    /// Count one finished channel; `None` if `batch` was superseded
    pub fn record(&self, batch: BatchId, message: &str) -> Option<ProgressSnapshot> {
        let mut state = self.state.lock();
        if state.generation != batch.0 || state.phase != ProgressPhase::Loading {
            return None;
        }
        state.processed = (state.processed + 1).min(state.total);
        state.message = message.to_string();
        Some(build_snapshot(&state, Instant::now()))
    }

    /// Finalize `batch`; `None` if it was superseded
    pub fn finish(&self, batch: BatchId, message: &str) -> Option<ProgressSnapshot> {
        let mut state = self.state.lock();
        if state.generation != batch.0 {
            return None;
        }
        let now = Instant::now();
        state.phase = ProgressPhase::Complete;
        state.message = message.to_string();
        state.finished_at.get_or_insert(now);
        Some(build_snapshot(&state, now))
    }

    /// Terminal state for a prefetch with no work; supersedes any running batch
    pub fn nothing_to_load(&self) -> ProgressSnapshot {
        let mut state = self.state.lock();
        state.generation += 1;
        state.phase = ProgressPhase::Complete;
        state.total = 0;
        state.processed = 0;
        state.message = "nothing to load".to_string();
        state.started_at = None;
        state.started_wall = None;
        state.finished_at = None;
        build_snapshot(&state, Instant::now())
    }
}

fn build_snapshot(state: &ProgressState, now: Instant) -> ProgressSnapshot {
    let end = state.finished_at.unwrap_or(now);
    let elapsed = state
        .started_at
        .map(|started| end.saturating_duration_since(started))
        .unwrap_or_default();

    let (fraction_complete, remaining) = match state.phase {
        ProgressPhase::Complete => (1.0, Some(Duration::ZERO)),
        ProgressPhase::Idle => (0.0, None),
        ProgressPhase::Loading => {
            let fraction = if state.total == 0 {
                0.0
            } else {
                state.processed as f64 / state.total as f64
            };
            (fraction, estimate_remaining(state.processed, state.total, elapsed))
        }
    };

    let throughput = if elapsed.as_secs_f64() > 0.0 {
        state.processed as f64 / elapsed.as_secs_f64()
    } else {
        0.0
    };

    ProgressSnapshot {
        phase: state.phase,
        total: state.total,
        processed: state.processed,
        is_loading: state.phase == ProgressPhase::Loading,
        message: state.message.clone(),
        started_at: state.started_wall,
        fraction_complete,
        throughput,
        estimated_remaining_seconds: remaining.map(|d| d.as_secs()),
        eta: format_eta(remaining),
    }
}

/// Estimate remaining time; `None` while there is too little data
pub fn estimate_remaining(processed: usize, total: usize, elapsed: Duration) -> Option<Duration> {
    if processed == 0 || elapsed < Duration::from_secs(1) {
        return None;
    }
    if processed >= total {
        return Some(Duration::ZERO);
    }

    let per_item = elapsed.as_secs_f64() / processed as f64;
    Some(Duration::from_secs_f64(per_item * (total - processed) as f64))
}

pub fn format_eta(remaining: Option<Duration>) -> String {
    let Some(remaining) = remaining else {
        return "calculating".to_string();
    };

    let secs = remaining.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_remaining() {
        assert_eq!(estimate_remaining(0, 10, Duration::from_secs(5)), None);
        assert_eq!(estimate_remaining(3, 10, Duration::from_millis(999)), None);
        assert_eq!(
            estimate_remaining(5, 15, Duration::from_secs(10)),
            Some(Duration::from_secs(20))
        );
        assert_eq!(estimate_remaining(15, 15, Duration::from_secs(10)), Some(Duration::ZERO));
    }

    #[test]
    fn test_format_eta() {
        assert_eq!(format_eta(None), "calculating");
        assert_eq!(format_eta(Some(Duration::from_secs(42))), "42s");
        assert_eq!(format_eta(Some(Duration::from_secs(200))), "3m 20s");
        assert_eq!(format_eta(Some(Duration::from_secs(3900))), "1h 5m");
    }

    #[test]
    fn test_lifecycle() {
        let tracker = ProgressTracker::new();
        let idle = tracker.snapshot();
        assert_eq!(idle.phase, ProgressPhase::Idle);
        assert_eq!((idle.total, idle.processed, idle.is_loading), (0, 0, false));

        let batch = tracker.begin(2);
        let loading = tracker.snapshot();
        assert!(loading.is_loading);
        assert_eq!(loading.total, 2);
        assert_eq!(loading.eta, "calculating");

        let first = tracker.record(batch, "BBC One").unwrap();
        assert_eq!(first.processed, 1);
        assert_eq!(first.message, "BBC One");
        assert!((first.fraction_complete - 0.5).abs() < f64::EPSILON);

        tracker.record(batch, "ITV").unwrap();
        // Extra completions never push processed past total
        let extra = tracker.record(batch, "ITV").unwrap();
        assert_eq!(extra.processed, 2);

        let done = tracker.finish(batch, "done").unwrap();
        assert!(!done.is_loading);
        assert_eq!(done.phase, ProgressPhase::Complete);
        assert_eq!(done.fraction_complete, 1.0);
        assert_eq!(done.message, "done");

        // Re-enterable with fresh counters
        let again = tracker.begin(5);
        assert_ne!(again, batch);
        assert_eq!(tracker.snapshot().processed, 0);
        assert_eq!(tracker.snapshot().total, 5);
    }

    #[test]
    fn test_finished_run_keeps_its_rate() {
        let tracker = ProgressTracker::new();
        assert!(tracker.snapshot().started_at.is_none());

        let batch = tracker.begin(2);
        let started_at = tracker.snapshot().started_at.unwrap();
        assert!(started_at <= Utc::now());

        std::thread::sleep(Duration::from_millis(20));
        tracker.record(batch, "BBC One").unwrap();
        tracker.record(batch, "ITV").unwrap();
        let done = tracker.finish(batch, "done").unwrap();
        assert!(done.throughput > 0.0);

        std::thread::sleep(Duration::from_millis(30));
        let later = tracker.snapshot();
        assert_eq!(later.throughput, done.throughput);
        assert_eq!(later.started_at, Some(started_at));
    }

    #[test]
    fn test_superseded_batch_is_ignored() {
        let tracker = ProgressTracker::new();
        let old = tracker.begin(10);
        let new = tracker.begin(3);

        assert!(tracker.record(old, "stale").is_none());
        assert!(tracker.finish(old, "done").is_none());
        assert_eq!(tracker.snapshot().total, 3);

        tracker.record(new, "fresh").unwrap();
        let nothing = tracker.nothing_to_load();
        assert_eq!(nothing.message, "nothing to load");
        assert_eq!(nothing.fraction_complete, 1.0);
        assert!(!nothing.is_loading);
        assert!(tracker.record(new, "late").is_none());
    }
}
