//! In-process quota ledger.

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::backend::{LedgerBackend, LedgerOutcome, QuotaCheck};
use super::key::LimitingKey;
use super::window::{timestamp_micros, SlidingWindowLog};
use crate::error::{Result, TurnstileError};

/// Single-instance ledger holding one sliding-window log per key.
///
/// Each log sits behind its own mutex, so admissions on different keys never
/// contend. A multi-key admission locks its keys in key order, which keeps
/// concurrent admissions over overlapping key sets deadlock-free.
#[derive(Default)]
pub struct MemoryLedger {
    logs: DashMap<LimitingKey, Arc<Mutex<SlidingWindowLog>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            logs: DashMap::new(),
        }
    }

    /// Admit-and-record check over a set of keys, without going through the
    /// async trait.
    pub fn check_and_record_sync(
        &self,
        checks: &[QuotaCheck],
        now: DateTime<Utc>,
    ) -> Result<LedgerOutcome> {
        let mut seen = HashSet::with_capacity(checks.len());
        if !checks.iter().all(|c| seen.insert(&c.key)) {
            return Err(TurnstileError::Config(
                "duplicate limiting key in one admission".to_string(),
            ));
        }

        let now_us = timestamp_micros(now);
        let handles: Vec<_> = checks.iter().map(|c| self.log_for(&c.key)).collect();

        let mut order: Vec<usize> = (0..checks.len()).collect();
        order.sort_by(|&a, &b| checks[a].key.cmp(&checks[b].key));

        let mut slots: Vec<Option<MutexGuard<'_, SlidingWindowLog>>> =
            checks.iter().map(|_| None).collect();
        for &i in &order {
            slots[i] = Some(handles[i].lock());
        }
        let mut guards: Vec<MutexGuard<'_, SlidingWindowLog>> =
            slots.into_iter().flatten().collect();

        for (check, log) in checks.iter().zip(guards.iter_mut()) {
            log.prune(now_us, check.quota.window_micros());
            if let Some(retry_after) = log.check(&check.quota, now_us) {
                trace!(
                    key = %check.key,
                    budget = check.quota.budget,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Quota exhausted"
                );
                return Ok(LedgerOutcome::Throttled {
                    key: check.key.clone(),
                    retry_after,
                });
            }
        }

        for (check, log) in checks.iter().zip(guards.iter_mut()) {
            log.record(now_us, check.quota.window_micros());
        }

        Ok(LedgerOutcome::Admitted)
    }

    /// Number of admissions currently counted for a key.
    pub fn count(&self, key: &LimitingKey, window: Duration, now: DateTime<Utc>) -> usize {
        let window_us = i64::try_from(window.as_micros()).unwrap_or(i64::MAX);
        self.logs
            .get(key)
            .map(|log| log.lock().count(timestamp_micros(now), window_us))
            .unwrap_or(0)
    }

    /// Drop expired timestamps and forget keys with nothing left.
    ///
    /// A log is only removed while no admission holds a handle to it, so a
    /// concurrent admission can never record into a detached log.
    pub fn compact(&self, now: DateTime<Utc>) -> usize {
        let now_us = timestamp_micros(now);
        let before = self.logs.len();
        self.logs.retain(|_, log| {
            let mut guard = log.lock();
            guard.compact(now_us);
            !(guard.is_empty() && Arc::strong_count(log) == 1)
        });
        let removed = before.saturating_sub(self.logs.len());
        if removed > 0 {
            debug!(removed = removed, remaining = self.logs.len(), "Compacted quota ledger");
        }
        removed
    }

    /// Run `compact` every `interval` until the ledger is dropped.
    pub fn spawn_compaction(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let ledger: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(ledger) = ledger.upgrade() else {
                    break;
                };
                ledger.compact(Utc::now());
            }
            trace!("Quota ledger compaction stopped");
        })
    }

    /// Get the number of tracked keys.
    pub fn key_count(&self) -> usize {
        self.logs.len()
    }

    /// Clear all logs.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.logs.clear();
    }

    fn log_for(&self, key: &LimitingKey) -> Arc<Mutex<SlidingWindowLog>> {
        if let Some(log) = self.logs.get(key) {
            return Arc::clone(log.value());
        }
        let entry = self.logs.entry(key.clone()).or_insert_with(|| {
            debug!(key = %key, "Creating quota ledger entry");
            Arc::new(Mutex::new(SlidingWindowLog::new()))
        });
        Arc::clone(entry.value())
    }
}

#[async_trait]
impl LedgerBackend for MemoryLedger {
    async fn check_and_record(
        &self,
        checks: &[QuotaCheck],
        now: DateTime<Utc>,
    ) -> Result<LedgerOutcome> {
        self.check_and_record_sync(checks, now)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
