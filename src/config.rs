//! Configuration management for Turnstile.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::inspect::ThreatCategory;

/// Environment variable prefix for layered configuration.
const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the gateway.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Quota ledger configuration
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Quota tiers and caller mapping
    #[serde(default)]
    pub tiers: TierConfig,

    /// Caller address allow/deny ranges
    #[serde(default)]
    pub address_policy: AddressPolicyConfig,

    /// Threat rule tables
    #[serde(default)]
    pub threats: ThreatRulesConfig,
}

impl GatewayConfig {
    /// Parse configuration from a YAML string and validate it.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GatewayConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse gateway config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML file, layered with `TURNSTILE__SECTION__KEY` environment
    /// variables, and validate the result.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading gateway configuration");

        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Yaml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let config: GatewayConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        self.ledger.validate()?;
        self.tiers.validate()
    }
}

/// Which ledger implementation backs the quotas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackendKind {
    /// Single-instance, in-process ledger
    #[default]
    Memory,
    /// Ledger shared by every gateway instance through Redis
    Redis,
}

/// What to decide when the ledger cannot be consulted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Treat the request as throttled
    #[default]
    FailClosed,
    /// Admit the request without recording it
    FailOpen,
}

/// Quota ledger configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default)]
    pub backend: LedgerBackendKind,

    /// Connection URL, required for the redis backend
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Namespace for shared ledger keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Background compaction period for the in-process ledger (0 disables)
    #[serde(default = "default_compaction_interval")]
    pub compaction_interval_secs: u64,

    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Retry hint returned when failing closed
    #[serde(default = "default_fail_closed_retry_after")]
    pub fail_closed_retry_after_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backend: LedgerBackendKind::default(),
            redis_url: None,
            key_prefix: default_key_prefix(),
            compaction_interval_secs: default_compaction_interval(),
            failure_policy: FailurePolicy::default(),
            fail_closed_retry_after_ms: default_fail_closed_retry_after(),
        }
    }
}

impl LedgerConfig {
    pub fn compaction_interval(&self) -> Option<Duration> {
        (self.compaction_interval_secs > 0)
            .then(|| Duration::from_secs(self.compaction_interval_secs))
    }

    pub fn fail_closed_retry_after(&self) -> Duration {
        Duration::from_millis(self.fail_closed_retry_after_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.backend == LedgerBackendKind::Redis
            && self.redis_url.as_deref().map_or(true, str::is_empty)
        {
            return Err(TurnstileError::Config(
                "ledger.redis_url is required for the redis backend".to_string(),
            ));
        }
        if self.key_prefix.is_empty() {
            return Err(TurnstileError::Config(
                "ledger.key_prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_key_prefix() -> String {
    "turnstile".to_string()
}

fn default_compaction_interval() -> u64 {
    60
}

fn default_fail_closed_retry_after() -> u64 {
    1000
}

/// A named quota tier as written in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierDefinition {
    pub name: String,
    /// Admissions allowed per window
    pub budget: u64,
    /// Window length in seconds
    pub window_secs: u64,
}

/// Tier table and caller mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    /// Tier applied to unmapped and anonymous callers
    #[serde(default = "default_tier_name")]
    pub default_tier: String,

    /// Endpoint budget is the tier budget divided by this
    #[serde(default = "default_endpoint_divisor")]
    pub endpoint_budget_divisor: u64,

    #[serde(default = "default_definitions")]
    pub definitions: Vec<TierDefinition>,

    /// Caller identity to tier name. A list rather than a map so that
    /// identities keep their case through the `config` crate, which
    /// lowercases map keys.
    #[serde(default)]
    pub callers: Vec<CallerTier>,
}

/// One caller identity pinned to a tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerTier {
    pub identity: String,
    pub tier: String,
}

impl CallerTier {
    pub fn new(identity: &str, tier: &str) -> Self {
        Self {
            identity: identity.to_string(),
            tier: tier.to_string(),
        }
    }
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            default_tier: default_tier_name(),
            endpoint_budget_divisor: default_endpoint_divisor(),
            definitions: default_definitions(),
            callers: Vec::new(),
        }
    }
}

impl TierConfig {
    pub fn validate(&self) -> Result<()> {
        if self.endpoint_budget_divisor == 0 {
            return Err(TurnstileError::Config(
                "tiers.endpoint_budget_divisor must be greater than zero".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for tier in &self.definitions {
            if !names.insert(tier.name.as_str()) {
                return Err(TurnstileError::Config(format!(
                    "tier '{}' is defined more than once",
                    tier.name
                )));
            }
            if tier.budget == 0 || tier.window_secs == 0 {
                return Err(TurnstileError::Config(format!(
                    "tier '{}' must have a positive budget and window",
                    tier.name
                )));
            }
        }

        if !names.contains(self.default_tier.as_str()) {
            return Err(TurnstileError::Config(format!(
                "default tier '{}' is not defined",
                self.default_tier
            )));
        }

        let mut identities = HashSet::new();
        for caller in &self.callers {
            if !identities.insert(caller.identity.as_str()) {
                return Err(TurnstileError::Config(format!(
                    "caller '{}' is mapped more than once",
                    caller.identity
                )));
            }
            if !names.contains(caller.tier.as_str()) {
                return Err(TurnstileError::Config(format!(
                    "caller '{}' maps to undefined tier '{}'",
                    caller.identity, caller.tier
                )));
            }
        }

        Ok(())
    }
}

fn default_tier_name() -> String {
    "default".to_string()
}

fn default_endpoint_divisor() -> u64 {
    10
}

fn default_definitions() -> Vec<TierDefinition> {
    vec![TierDefinition {
        name: default_tier_name(),
        budget: 100,
        window_secs: 60,
    }]
}

/// Caller address ranges.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddressPolicyConfig {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

/// Threat rule tables; a category left unset keeps its built-in rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThreatRulesConfig {
    /// Header names excluded from inspection (case-insensitive)
    #[serde(default)]
    pub skip_headers: Vec<String>,

    #[serde(default)]
    pub injection: Option<Vec<String>>,

    #[serde(default)]
    pub script_injection: Option<Vec<String>>,

    #[serde(default)]
    pub path_traversal: Option<Vec<String>>,
}

impl ThreatRulesConfig {
    /// The configured replacement table for a category, if any.
    pub fn overrides(&self, category: ThreatCategory) -> Option<&[String]> {
        match category {
            ThreatCategory::Injection => self.injection.as_deref(),
            ThreatCategory::ScriptInjection => self.script_injection.as_deref(),
            ThreatCategory::PathTraversal => self.path_traversal.as_deref(),
        }
    }
}
