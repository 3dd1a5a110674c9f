//! Sliding-window connection counter used for auto-banning.
//!
//! Each source address keeps the timestamps of its recent connections.
//! Timestamps older than the window are pruned on every new attempt; the
//! map lives only in memory.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Past this many tracked addresses, idle entries are swept on record.
const GC_THRESHOLD: usize = 1024;

/// Per-address connection timestamps within a rolling window.
#[derive(Debug)]
pub struct AttemptTracker {
    /// Duration of the sliding window.
    window: Duration,
    /// Per-key tracking: key → list of attempt timestamps, oldest first.
    entries: HashMap<String, Vec<Instant>>,
}

impl AttemptTracker {
    /// Create a tracker with a window of `window_secs` seconds.
    pub fn new(window_secs: u64) -> Self {
        Self {
            window: Duration::from_secs(window_secs),
            entries: HashMap::new(),
        }
    }

    /// Record a connection from `key` now and return how many attempts
    /// fall inside the window, this one included.
    pub fn record(&mut self, key: &str) -> usize {
        self.record_at(key, Instant::now())
    }

    /// Same as [`AttemptTracker::record`] with an explicit clock reading.
    pub fn record_at(&mut self, key: &str, now: Instant) -> usize {
        if self.entries.len() > GC_THRESHOLD {
            self.gc_at(now);
        }

        let window = self.window;
        let attempts = self.entries.entry(key.to_string()).or_default();
        attempts.retain(|t| now.saturating_duration_since(*t) <= window);
        attempts.push(now);
        attempts.len()
    }

    /// Attempts from `key` currently inside the window.
    pub fn count(&self, key: &str) -> usize {
        let now = Instant::now();
        self.entries
            .get(key)
            .map(|attempts| {
                attempts
                    .iter()
                    .filter(|t| now.saturating_duration_since(**t) <= self.window)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Drop addresses whose attempts have all aged out.
    pub fn gc(&mut self) {
        self.gc_at(Instant::now());
    }

    fn gc_at(&mut self, now: Instant) {
        let window = self.window;
        self.entries.retain(|_, attempts| {
            attempts.retain(|t| now.saturating_duration_since(*t) <= window);
            !attempts.is_empty()
        });
    }

    /// Number of tracked addresses.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_within_window() {
        let mut tracker = AttemptTracker::new(60);
        let start = Instant::now();
        for i in 0..4 {
            let count = tracker.record_at("1.2.3.4", start + Duration::from_secs(i * 10));
            assert_eq!(count, i as usize + 1);
        }
        assert_eq!(tracker.record_at("5.6.7.8", start), 1);
    }

    #[test]
    fn test_spaced_attempts_do_not_accumulate() {
        let mut tracker = AttemptTracker::new(60);
        let start = Instant::now();
        for i in 0..5 {
            let count = tracker.record_at("1.2.3.4", start + Duration::from_secs(i * 61));
            assert_eq!(count, 1);
        }
    }

    #[test]
    fn test_partial_expiry() {
        let mut tracker = AttemptTracker::new(10);
        let start = Instant::now();
        tracker.record_at("ip", start);
        tracker.record_at("ip", start + Duration::from_secs(8));
        // The first attempt is now 12s old and falls out.
        assert_eq!(tracker.record_at("ip", start + Duration::from_secs(12)), 2);
    }

    #[test]
    fn test_gc_drops_idle_keys() {
        let mut tracker = AttemptTracker::new(0);
        let start = Instant::now();
        tracker.record_at("a", start);
        tracker.record_at("b", start);
        assert_eq!(tracker.len(), 2);
        tracker.gc_at(start + Duration::from_secs(1));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_count_unknown_key() {
        let tracker = AttemptTracker::new(60);
        assert_eq!(tracker.count("nobody"), 0);
    }
}
