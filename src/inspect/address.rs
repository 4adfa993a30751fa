//! Network address allow/deny policy.

use std::net::{IpAddr, SocketAddr};

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::AddressPolicyConfig;
use crate::error::{Result, TurnstileError};

/// Outcome of evaluating a caller address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressVerdict {
    Allow,
    Deny,
}

/// Allow and deny ranges loaded at start-up.
///
/// Deny always wins. When the allow list is non-empty, addresses outside it
/// are denied. Anything that does not parse as an address is denied.
#[derive(Debug, Clone, Default)]
pub struct AddressPolicy {
    allow: Vec<IpNet>,
    deny: Vec<IpNet>,
}

impl AddressPolicy {
    /// A policy that admits every well-formed address.
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Build a policy from CIDR strings or bare addresses.
    pub fn new<S: AsRef<str>>(allow: &[S], deny: &[S]) -> Result<Self> {
        Ok(Self {
            allow: parse_ranges(allow)?,
            deny: parse_ranges(deny)?,
        })
    }

    pub fn from_config(config: &AddressPolicyConfig) -> Result<Self> {
        Self::new(&config.allow, &config.deny)
    }

    /// Evaluate a textual caller address (`ip`, `ip:port` or `[v6]:port`).
    pub fn evaluate(&self, address: &str) -> AddressVerdict {
        match parse_address(address) {
            Ok(ip) => self.evaluate_ip(ip),
            Err(err) => {
                debug!(error = %err, "Denying unparseable caller address");
                AddressVerdict::Deny
            }
        }
    }

    /// Evaluate an already parsed address.
    pub fn evaluate_ip(&self, ip: IpAddr) -> AddressVerdict {
        let ip = ip.to_canonical();

        if self.deny.iter().any(|net| net.contains(&ip)) {
            return AddressVerdict::Deny;
        }
        if !self.allow.is_empty() && !self.allow.iter().any(|net| net.contains(&ip)) {
            return AddressVerdict::Deny;
        }
        AddressVerdict::Allow
    }
}

/// Parse a caller address, tolerating an attached port.
pub fn parse_address(address: &str) -> Result<IpAddr> {
    let trimmed = address.trim();
    if let Ok(ip) = trimmed.parse::<IpAddr>() {
        return Ok(ip);
    }
    trimmed
        .parse::<SocketAddr>()
        .map(|sa| sa.ip())
        .map_err(|_| TurnstileError::InvalidAddress(address.to_string()))
}

fn parse_ranges<S: AsRef<str>>(raw: &[S]) -> Result<Vec<IpNet>> {
    raw.iter().map(|s| parse_range(s.as_ref())).collect()
}

fn parse_range(raw: &str) -> Result<IpNet> {
    let raw = raw.trim();
    if let Ok(net) = raw.parse::<IpNet>() {
        return Ok(net);
    }
    // A bare address is a single-host range.
    raw.parse::<IpAddr>()
        .map(|ip| IpNet::from(ip.to_canonical()))
        .map_err(|e| TurnstileError::InvalidRange {
            range: raw.to_string(),
            reason: e.to_string(),
        })
}
