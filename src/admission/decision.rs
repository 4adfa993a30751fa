//! Admission decisions and violation reports.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::inspect::ThreatCategory;

/// Where in the request a violation was found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "location", content = "name", rename_all = "snake_case")]
pub enum FieldLocation {
    Address,
    Path,
    /// A query, form or header field, by name
    Field(String),
}

impl fmt::Display for FieldLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldLocation::Address => f.write_str("address"),
            FieldLocation::Path => f.write_str("path"),
            FieldLocation::Field(name) => write!(f, "field '{}'", name),
        }
    }
}

/// What was wrong at that location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "category", rename_all = "snake_case")]
pub enum ViolationKind {
    /// The caller address is denied by policy
    AddressDenied,
    /// The text matched a threat category
    Threat(ThreatCategory),
}

/// One reason for rejecting a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    #[serde(flatten)]
    pub location: FieldLocation,
    #[serde(flatten)]
    pub kind: ViolationKind,
}

impl Violation {
    pub fn address_denied() -> Self {
        Self {
            location: FieldLocation::Address,
            kind: ViolationKind::AddressDenied,
        }
    }

    pub fn threat(location: FieldLocation, category: ThreatCategory) -> Self {
        Self {
            location,
            kind: ViolationKind::Threat(category),
        }
    }

    pub fn category(&self) -> Option<ThreatCategory> {
        match self.kind {
            ViolationKind::Threat(category) => Some(category),
            ViolationKind::AddressDenied => None,
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ViolationKind::AddressDenied => write!(f, "{}: denied by policy", self.location),
            ViolationKind::Threat(category) => write!(f, "{}: {}", self.location, category),
        }
    }
}

/// The single outcome of admitting one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Throttled {
        #[serde(rename = "retry_after_ms", serialize_with = "serialize_millis")]
        retry_after: Duration,
    },
    Rejected {
        violations: Vec<Violation>,
    },
}

impl Decision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    pub fn is_throttled(&self) -> bool {
        matches!(self, Decision::Throttled { .. })
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Decision::Rejected { .. })
    }

    /// Threat categories among the violations, in report order.
    pub fn threat_categories(&self) -> Vec<ThreatCategory> {
        match self {
            Decision::Rejected { violations } => {
                violations.iter().filter_map(Violation::category).collect()
            }
            _ => Vec::new(),
        }
    }
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}
