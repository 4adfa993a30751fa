//! Ledger trait for abstracting in-process and shared implementations.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::key::LimitingKey;
use super::window::Quota;
use crate::error::Result;

/// One key to check as part of an admission, with the quota it is held to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaCheck {
    pub key: LimitingKey,
    pub quota: Quota,
}

impl QuotaCheck {
    pub fn new(key: LimitingKey, quota: Quota) -> Self {
        Self { key, quota }
    }
}

/// Result of an atomic check-and-record over a set of keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerOutcome {
    /// Every key had room; one timestamp was recorded on each.
    Admitted,
    /// The first key (in check order) without room. Nothing was recorded.
    Throttled {
        key: LimitingKey,
        retry_after: Duration,
    },
}

impl LedgerOutcome {
    pub fn is_admitted(&self) -> bool {
        matches!(self, LedgerOutcome::Admitted)
    }
}

/// Trait for quota ledger implementations.
///
/// Implementations count, per key, the admissions timestamped in
/// `(now - window, now]`. `check_and_record` is one atomic unit: either every
/// key has room and all are recorded, or none is touched. Mutations on the
/// same key are serialized; different keys must not block each other.
///
/// A backend that cannot be reached returns
/// [`TurnstileError::LedgerUnavailable`](crate::error::TurnstileError::LedgerUnavailable),
/// never a made-up outcome.
#[async_trait]
pub trait LedgerBackend: Send + Sync {
    /// Check every key in order and record `now` on all of them if all fit.
    async fn check_and_record(&self, checks: &[QuotaCheck], now: DateTime<Utc>)
        -> Result<LedgerOutcome>;

    /// Single-key form: admit and record if fewer than `budget` entries are
    /// in the window.
    async fn try_admit(
        &self,
        key: &LimitingKey,
        budget: u64,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let check = QuotaCheck::new(key.clone(), Quota::new(budget, window));
        let outcome = self.check_and_record(std::slice::from_ref(&check), now).await?;
        Ok(outcome.is_admitted())
    }

    /// Short name used in diagnostics.
    fn name(&self) -> &'static str;
}
