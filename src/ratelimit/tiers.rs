//! Quota tiers and limiting-key derivation.
//!
//! A caller identity maps to a named tier; unmapped and anonymous callers get
//! the default tier. Every request is counted against one global key per
//! caller and one key per endpoint, whose budget is a fixed fraction of the
//! tier's budget so a single expensive endpoint cannot drain the whole quota.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::backend::QuotaCheck;
use super::key::LimitingKey;
use super::window::Quota;
use crate::admission::RequestDescriptor;
use crate::config::TierConfig;
use crate::error::{Result, TurnstileError};

/// A named budget over a window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaTier {
    pub name: String,
    pub budget: u64,
    pub window: Duration,
}

impl QuotaTier {
    pub fn new(name: &str, budget: u64, window: Duration) -> Result<Self> {
        if budget == 0 || window.is_zero() {
            return Err(TurnstileError::Config(format!(
                "tier '{}' must have a positive budget and window",
                name
            )));
        }
        Ok(Self {
            name: name.to_string(),
            budget,
            window,
        })
    }

    /// Quota for the caller's global key.
    pub fn global_quota(&self) -> Quota {
        Quota::new(self.budget, self.window)
    }

    /// Quota for each of the caller's endpoint keys.
    pub fn endpoint_quota(&self, divisor: u64) -> Quota {
        Quota::new((self.budget / divisor.max(1)).max(1), self.window)
    }
}

/// Immutable lookup from caller identity to tier.
#[derive(Debug, Clone)]
pub struct TierResolver {
    tiers: HashMap<String, Arc<QuotaTier>>,
    callers: HashMap<String, Arc<QuotaTier>>,
    default_tier: Arc<QuotaTier>,
    endpoint_divisor: u64,
}

impl TierResolver {
    /// Build the resolver, refusing an inconsistent tier table.
    pub fn from_config(config: &TierConfig) -> Result<Self> {
        config.validate()?;

        let mut tiers = HashMap::with_capacity(config.definitions.len());
        for def in &config.definitions {
            let tier = QuotaTier::new(&def.name, def.budget, Duration::from_secs(def.window_secs))?;
            tiers.insert(def.name.clone(), Arc::new(tier));
        }

        let lookup = |name: &str| {
            tiers
                .get(name)
                .cloned()
                .ok_or_else(|| TurnstileError::Config(format!("tier '{}' is not defined", name)))
        };

        let default_tier = lookup(&config.default_tier)?;
        let callers = config
            .callers
            .iter()
            .map(|c| Ok((c.identity.clone(), lookup(&c.tier)?)))
            .collect::<Result<HashMap<_, _>>>()?;

        Ok(Self {
            tiers,
            callers,
            default_tier,
            endpoint_divisor: config.endpoint_budget_divisor,
        })
    }

    /// Tier for a caller; `None` or an unmapped identity yields the default.
    pub fn resolve(&self, identity: Option<&str>) -> &QuotaTier {
        identity
            .and_then(|id| self.callers.get(id))
            .unwrap_or(&self.default_tier)
    }

    /// Look up a tier by name.
    pub fn tier(&self, name: &str) -> Option<&QuotaTier> {
        self.tiers.get(name).map(|t| t.as_ref())
    }

    pub fn default_tier(&self) -> &QuotaTier {
        &self.default_tier
    }

    /// Limiting keys for a request, in check order: global, then endpoint.
    pub fn limiting_checks(&self, request: &RequestDescriptor) -> Vec<QuotaCheck> {
        let tier = self.resolve(request.identity());
        let caller = request.caller();

        vec![
            QuotaCheck::new(LimitingKey::global(caller.clone()), tier.global_quota()),
            QuotaCheck::new(
                LimitingKey::endpoint(caller, &request.endpoint()),
                tier.endpoint_quota(self.endpoint_divisor),
            ),
        ]
    }
}
