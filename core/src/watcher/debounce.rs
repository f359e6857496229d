/// Debouncer (§4.4): coalesces bursts of filesystem events into a single `debounced-event`
/// per path after a quiet period, with a destructiveness-priority promotion rule and an
/// immediate-emit path for deletes and caller-declared critical patterns.
use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::debug;

use crate::watcher::FileEventKind;

fn destructiveness_rank(kind: FileEventKind) -> u8 {
    match kind {
        FileEventKind::Add => 0,
        FileEventKind::Change => 1,
        FileEventKind::Unlink => 2,
    }
}

struct PendingEntry {
    event_type: FileEventKind,
    first_change_timestamp: DateTime<Utc>,
    last_change_timestamp: DateTime<Utc>,
    armed_at: Instant,
}

#[derive(Debug, Clone)]
pub struct DebouncedEvent {
    pub event_type: FileEventKind,
    pub file_path: String,
    pub first_change_timestamp: DateTime<Utc>,
    pub last_change_timestamp: DateTime<Utc>,
    pub changes_collapsed: u32,
    pub emitted_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DebouncerMetrics {
    pub total_debounced: u64,
    pub total_emitted: u64,
    pub total_collapsed: u64,
    pub immediate_mode_count: u64,
}

/// Owns the per-path pending-entry table. `poll_ready` is called by the owning task loop
/// (grounded in the rest of the crate's `tokio::select!`-driven component loops) to collect
/// entries whose timer has elapsed; there is no background timer task per path.
pub struct Debouncer {
    delay: Duration,
    critical_pattern: Option<Regex>,
    pending: HashMap<String, PendingEntry>,
    quiet_period_samples: Vec<Duration>,
    metrics: DebouncerMetrics,
}

impl Debouncer {
    pub fn new(delay: Duration, critical_pattern: Option<Regex>) -> Self {
        Debouncer {
            delay,
            critical_pattern,
            pending: HashMap::new(),
            quiet_period_samples: Vec::new(),
            metrics: DebouncerMetrics::default(),
        }
    }

    fn is_critical(&self, path: &str) -> bool {
        self.critical_pattern.as_ref().map(|r| r.is_match(path)).unwrap_or(false)
    }

    /// Feeds a raw event in. Returns `Some(event)` when the event bypasses debouncing
    /// entirely (unlink, or a critical-pattern path) and should be emitted immediately.
    pub fn record(&mut self, path: &str, event_type: FileEventKind) -> Option<DebouncedEvent> {
        if event_type == FileEventKind::Unlink {
            self.pending.remove(path);
            self.metrics.immediate_mode_count += 1;
            let now = Utc::now();
            return Some(DebouncedEvent {
                event_type,
                file_path: path.to_string(),
                first_change_timestamp: now,
                last_change_timestamp: now,
                changes_collapsed: 1,
                emitted_at: now,
            });
        }

        if self.is_critical(path) {
            self.metrics.immediate_mode_count += 1;
            let now = Utc::now();
            return Some(DebouncedEvent {
                event_type,
                file_path: path.to_string(),
                first_change_timestamp: now,
                last_change_timestamp: now,
                changes_collapsed: 1,
                emitted_at: now,
            });
        }

        let now = Utc::now();
        let now_instant = Instant::now();
        self.metrics.total_debounced += 1;

        self.pending
            .entry(path.to_string())
            .and_modify(|entry| {
                if destructiveness_rank(event_type) > destructiveness_rank(entry.event_type) {
                    entry.event_type = event_type;
                }
                entry.last_change_timestamp = now;
                entry.armed_at = now_instant;
            })
            .or_insert_with(|| PendingEntry {
                event_type,
                first_change_timestamp: now,
                last_change_timestamp: now,
                armed_at: now_instant,
            });

        None
    }

    /// Collects every entry whose debounce timer has elapsed, emitting one
    /// [`DebouncedEvent`] per path and clearing it from the pending table.
    pub fn poll_ready(&mut self) -> Vec<DebouncedEvent> {
        let now_instant = Instant::now();
        let ready: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, e)| now_instant.duration_since(e.armed_at) >= self.delay)
            .map(|(path, _)| path.clone())
            .collect();

        let mut out = Vec::new();
        for path in ready {
            if let Some(entry) = self.pending.remove(&path) {
                out.push(self.emit(path, entry));
            }
        }
        out
    }

    fn emit(&mut self, path: String, entry: PendingEntry) -> DebouncedEvent {
        let quiet_period = entry
            .last_change_timestamp
            .signed_duration_since(entry.first_change_timestamp)
            .to_std()
            .unwrap_or(Duration::ZERO);
        self.quiet_period_samples.push(quiet_period);
        if self.quiet_period_samples.len() > 100 {
            self.quiet_period_samples.remove(0);
        }

        let delay_ms = self.delay.as_millis().max(1) as f64;
        let quiet_ms = quiet_period.as_millis() as f64;
        let changes_collapsed = ((quiet_ms / delay_ms).round() as u32).max(1);

        self.metrics.total_emitted += 1;
        self.metrics.total_collapsed += changes_collapsed as u64;

        debug!(path, changes_collapsed, "debounced event emitted");

        DebouncedEvent {
            event_type: entry.event_type,
            file_path: path,
            first_change_timestamp: entry.first_change_timestamp,
            last_change_timestamp: entry.last_change_timestamp,
            changes_collapsed,
            emitted_at: Utc::now(),
        }
    }

    /// Immediately emits every pending entry, regardless of elapsed time.
    pub fn flush(&mut self) -> Vec<DebouncedEvent> {
        let paths: Vec<String> = self.pending.keys().cloned().collect();
        let mut out = Vec::new();
        for path in paths {
            if let Some(entry) = self.pending.remove(&path) {
                out.push(self.emit(path, entry));
            }
        }
        out
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn metrics(&self) -> DebouncerMetrics {
        self.metrics
    }

    pub fn average_quiet_period(&self) -> Duration {
        if self.quiet_period_samples.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.quiet_period_samples.iter().sum();
        total / self.quiet_period_samples.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlink_bypasses_debounce_and_clears_pending() {
        let mut debouncer = Debouncer::new(Duration::from_millis(500), None);
        debouncer.record("a.md", FileEventKind::Change);
        assert_eq!(debouncer.pending_count(), 1);
        let emitted = debouncer.record("a.md", FileEventKind::Unlink);
        assert!(emitted.is_some());
        assert_eq!(debouncer.pending_count(), 0);
    }

    #[test]
    fn change_promotes_over_add_by_destructiveness() {
        let mut debouncer = Debouncer::new(Duration::from_millis(0), None);
        debouncer.record("a.md", FileEventKind::Add);
        debouncer.record("a.md", FileEventKind::Change);
        let ready = debouncer.poll_ready();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].event_type, FileEventKind::Change);
    }

    #[test]
    fn critical_pattern_bypasses_debounce() {
        let pattern = Regex::new(r"URGENT").unwrap();
        let mut debouncer = Debouncer::new(Duration::from_millis(500), Some(pattern));
        let emitted = debouncer.record("URGENT_task.md", FileEventKind::Change);
        assert!(emitted.is_some());
        assert_eq!(debouncer.pending_count(), 0);
    }

    #[test]
    fn flush_emits_all_pending_regardless_of_timer() {
        let mut debouncer = Debouncer::new(Duration::from_secs(60), None);
        debouncer.record("a.md", FileEventKind::Add);
        debouncer.record("b.md", FileEventKind::Add);
        assert!(debouncer.poll_ready().is_empty());
        let flushed = debouncer.flush();
        assert_eq!(flushed.len(), 2);
        assert_eq!(debouncer.pending_count(), 0);
    }

    #[test]
    fn clear_drops_pending_without_emitting() {
        let mut debouncer = Debouncer::new(Duration::from_secs(60), None);
        debouncer.record("a.md", FileEventKind::Add);
        debouncer.clear();
        assert_eq!(debouncer.pending_count(), 0);
    }
}
