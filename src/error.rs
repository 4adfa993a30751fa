//! Error types for the Turnstile gateway.

use thiserror::Error;

use crate::inspect::ThreatCategory;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Malformed or inconsistent configuration (tier table, ledger section, ...)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A pattern rule that does not compile
    #[error("Invalid {category} rule '{pattern}': {source}")]
    InvalidPattern {
        category: ThreatCategory,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// An address range in the allow/deny lists that does not parse
    #[error("Invalid address range '{range}': {reason}")]
    InvalidRange { range: String, reason: String },

    /// The quota ledger backend could not be reached or failed mid-operation
    #[error("Ledger unavailable: {0}")]
    LedgerUnavailable(String),

    /// A caller address that is not an IP address
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TurnstileError {
    /// Whether this error must refuse start-up.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            TurnstileError::Config(_)
                | TurnstileError::InvalidPattern { .. }
                | TurnstileError::InvalidRange { .. }
        )
    }
}

impl From<config::ConfigError> for TurnstileError {
    fn from(err: config::ConfigError) -> Self {
        TurnstileError::Config(err.to_string())
    }
}

impl From<redis::RedisError> for TurnstileError {
    fn from(err: redis::RedisError) -> Self {
        TurnstileError::LedgerUnavailable(err.to_string())
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
