//! Structured decision events and the sinks that receive them.
//!
//! The pipeline never logs decisions itself; it hands one event per request
//! to a `DecisionSink` supplied by the surrounding service.

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use super::decision::Violation;
use crate::config::FailurePolicy;
use crate::ratelimit::LimitingKey;

/// Why the request ended where it did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EventOutcome {
    Allowed,
    Rejected {
        violations: Vec<Violation>,
    },
    Throttled {
        key: String,
        retry_after_ms: u64,
    },
    /// The ledger failed and the failure policy decided
    LedgerUnavailable {
        error: String,
        policy: FailurePolicy,
    },
}

/// One decision, as reported to a sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecisionEvent {
    pub timestamp: DateTime<Utc>,
    /// Limiting-key discriminator (identity or `anon:<address>`)
    pub caller: String,
    pub identity: Option<String>,
    pub address: String,
    pub method: String,
    pub path: String,
    /// Tier applied, absent when the request never reached the quota check
    pub tier: Option<String>,
    #[serde(flatten)]
    pub outcome: EventOutcome,
}

impl EventOutcome {
    pub fn throttled(key: &LimitingKey, retry_after: Duration) -> Self {
        EventOutcome::Throttled {
            key: key.to_string_key(),
            retry_after_ms: retry_after.as_millis() as u64,
        }
    }
}

/// Receiver of decision events.
pub trait DecisionSink: Send + Sync {
    fn record(&self, event: &DecisionEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl DecisionSink for NullSink {
    fn record(&self, _event: &DecisionEvent) {}
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DecisionSink for TracingSink {
    fn record(&self, event: &DecisionEvent) {
        match &event.outcome {
            EventOutcome::Allowed => info!(
                caller = %event.caller,
                method = %event.method,
                path = %event.path,
                tier = ?event.tier,
                "Request admitted"
            ),
            EventOutcome::Rejected { violations } => warn!(
                caller = %event.caller,
                address = %event.address,
                method = %event.method,
                path = %event.path,
                violations = ?violations.iter().map(|v| v.to_string()).collect::<Vec<_>>(),
                "Request rejected"
            ),
            EventOutcome::Throttled { key, retry_after_ms } => warn!(
                caller = %event.caller,
                key = %key,
                retry_after_ms = retry_after_ms,
                tier = ?event.tier,
                "Request throttled"
            ),
            EventOutcome::LedgerUnavailable { error, policy } => warn!(
                caller = %event.caller,
                error = %error,
                policy = ?policy,
                "Quota ledger unavailable"
            ),
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<DecisionEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DecisionEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl DecisionSink for MemorySink {
    fn record(&self, event: &DecisionEvent) {
        self.events.lock().push(event.clone());
    }
}
