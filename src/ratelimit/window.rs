//! Sliding-window log: the admission timestamps recorded for one key.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Budget and window applied to one limiting key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    /// Maximum admissions inside any trailing window
    pub budget: u64,
    /// Length of the trailing window
    pub window: Duration,
}

impl Quota {
    pub fn new(budget: u64, window: Duration) -> Self {
        Self { budget, window }
    }

    /// Window length in microseconds, as stored in the log.
    pub fn window_micros(&self) -> i64 {
        i64::try_from(self.window.as_micros()).unwrap_or(i64::MAX)
    }
}

/// Convert a wall-clock instant to log resolution.
pub fn timestamp_micros(now: DateTime<Utc>) -> i64 {
    now.timestamp_micros()
}

/// Ordered multiset of admission timestamps (microseconds since the epoch).
///
/// A read at `now` only counts timestamps in `(now - window, now]`. Entries
/// at or before `now - window` can be pruned at any time without changing
/// what a read observes.
#[derive(Debug, Clone, Default)]
pub struct SlidingWindowLog {
    entries: VecDeque<i64>,
    /// Window used by the most recent check, for compaction
    window_us: i64,
}

impl SlidingWindowLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of admissions inside `(now - window, now]`.
    pub fn count(&self, now_us: i64, window_us: i64) -> usize {
        let (lo, hi) = self.window_bounds(now_us, window_us);
        hi - lo
    }

    /// Check whether one more admission fits.
    ///
    /// Returns `None` when it fits, otherwise the time until enough entries
    /// leave the window for one to fit.
    pub fn check(&self, quota: &Quota, now_us: i64) -> Option<Duration> {
        let window_us = quota.window_micros();
        let (lo, hi) = self.window_bounds(now_us, window_us);
        let count = (hi - lo) as u64;
        if count < quota.budget {
            return None;
        }

        if quota.budget == 0 {
            return Some(quota.window);
        }
        // With count >= budget, the entry at lo + (count - budget) has to
        // expire before the next admission fits.
        let blocking = self.entries[lo + (count - quota.budget) as usize];
        let wait_us = (blocking.saturating_add(window_us) - now_us).max(0);
        Some(Duration::from_micros(wait_us as u64))
    }

    /// Append an admission at `now_us`, keeping the log ordered.
    pub fn record(&mut self, now_us: i64, window_us: i64) {
        let idx = self.entries.partition_point(|&t| t <= now_us);
        self.entries.insert(idx, now_us);
        self.window_us = window_us;
    }

    /// Check and, if the quota allows, record an admission.
    pub fn try_admit(&mut self, quota: &Quota, now_us: i64) -> bool {
        self.prune(now_us, quota.window_micros());
        if self.check(quota, now_us).is_some() {
            return false;
        }
        self.record(now_us, quota.window_micros());
        true
    }

    /// Drop entries at or before `now - window`.
    pub fn prune(&mut self, now_us: i64, window_us: i64) {
        let cutoff = now_us.saturating_sub(window_us);
        while self.entries.front().is_some_and(|&t| t <= cutoff) {
            self.entries.pop_front();
        }
    }

    /// Prune with the window of the most recent check.
    pub fn compact(&mut self, now_us: i64) {
        self.prune(now_us, self.window_us);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn window_bounds(&self, now_us: i64, window_us: i64) -> (usize, usize) {
        let cutoff = now_us.saturating_sub(window_us);
        let lo = self.entries.partition_point(|&t| t <= cutoff);
        let hi = self.entries.partition_point(|&t| t <= now_us);
        (lo, hi.max(lo))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: i64 = 1000;
    const SEC: i64 = 1000 * MS;

    fn quota(budget: u64, secs: u64) -> Quota {
        Quota::new(budget, Duration::from_secs(secs))
    }

    #[test]
    fn test_budget_then_reject_then_slide() {
        let mut log = SlidingWindowLog::new();
        let q = quota(3, 60);

        assert!(log.try_admit(&q, 0));
        assert!(log.try_admit(&q, SEC));
        assert!(log.try_admit(&q, 2 * SEC));
        assert!(!log.try_admit(&q, 3 * SEC));
        assert!(log.try_admit(&q, 61 * SEC));
    }

    #[test]
    fn test_rejection_leaves_state_unchanged() {
        let mut log = SlidingWindowLog::new();
        let q = quota(1, 10);

        assert!(log.try_admit(&q, 0));
        assert!(!log.try_admit(&q, SEC));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_window_lower_bound_is_exclusive() {
        let mut log = SlidingWindowLog::new();
        let q = quota(1, 60);

        assert!(log.try_admit(&q, 0));
        assert!(!log.try_admit(&q, 60 * SEC - 1));
        assert!(log.try_admit(&q, 60 * SEC));
    }

    #[test]
    fn test_independent_windows() {
        let mut log = SlidingWindowLog::new();
        let q = quota(1, 5);

        assert!(log.try_admit(&q, 100 * SEC));
        assert!(log.try_admit(&q, 105 * SEC + 1));
    }

    #[test]
    fn test_retry_after_tracks_oldest_entry() {
        let mut log = SlidingWindowLog::new();
        let q = quota(2, 60);

        log.record(10 * SEC, q.window_micros());
        log.record(20 * SEC, q.window_micros());

        assert_eq!(log.check(&q, 30 * SEC), Some(Duration::from_secs(40)));
        assert_eq!(log.check(&q, 71 * SEC), None);
    }

    #[test]
    fn test_retry_after_with_excess_entries() {
        let mut log = SlidingWindowLog::new();
        for t in [1, 2, 3, 4] {
            log.record(t * SEC, 60 * SEC);
        }
        // Budget lowered to 2: the third-oldest entry has to expire.
        let q = quota(2, 60);
        assert_eq!(log.check(&q, 5 * SEC), Some(Duration::from_secs(58)));
    }

    #[test]
    fn test_zero_budget_never_admits() {
        let mut log = SlidingWindowLog::new();
        let q = quota(0, 30);
        assert!(!log.try_admit(&q, 0));
        assert_eq!(log.check(&q, 0), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_sub_millisecond_gap_stays_in_window() {
        let mut log = SlidingWindowLog::new();
        let q = quota(1, 60);

        assert!(log.try_admit(&q, 900));
        // 59.9996s after the first admission
        assert!(!log.try_admit(&q, 60 * SEC + 500));
        assert_eq!(log.check(&q, 60 * SEC + 500), Some(Duration::from_micros(400)));
        assert!(log.try_admit(&q, 60 * SEC + 900));
    }

    #[test]
    fn test_out_of_order_record_stays_sorted() {
        let mut log = SlidingWindowLog::new();
        log.record(5 * SEC, 60 * SEC);
        log.record(3 * SEC, 60 * SEC);
        log.record(4 * SEC, 60 * SEC);

        assert_eq!(log.count(4 * SEC, 60 * SEC), 2);
        log.prune(64 * SEC, 60 * SEC);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_prune_preserves_counts() {
        let mut log = SlidingWindowLog::new();
        let q = quota(100, 10);
        for t in 0..20 {
            assert!(log.try_admit(&q, t * SEC));
        }

        let before = log.count(20 * SEC, q.window_micros());
        log.compact(20 * SEC);
        assert_eq!(log.count(20 * SEC, q.window_micros()), before);
        assert_eq!(log.len(), before);
    }

    #[test]
    fn test_sliding_log_never_exceeds_budget() {
        let mut log = SlidingWindowLog::new();
        let q = quota(5, 10);
        let mut admitted = Vec::new();

        for t in (0..200).map(|i| i * 700 * MS) {
            if log.try_admit(&q, t) {
                admitted.push(t);
            }
        }

        for (i, &start) in admitted.iter().enumerate() {
            let in_window = admitted[i..]
                .iter()
                .take_while(|&&t| t < start + q.window_micros())
                .count();
            assert!(in_window <= 5, "window starting at {start} admitted {in_window}");
        }
    }
}
