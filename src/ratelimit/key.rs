//! Limiting key generation and handling.

use serde::{Deserialize, Serialize};

/// What a limiting key counts against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitScope {
    /// Every admission of a caller
    Global,
    /// Admissions of a caller on one endpoint
    Endpoint,
}

/// Whose budget a key counts against.
///
/// Identities and anonymous addresses live in separate namespaces, so an
/// identity spelled like an address never shares a ledger entry with it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Caller {
    /// Authenticated caller identity
    Identity(String),
    /// Canonical address of an unauthenticated caller
    Anonymous(String),
}

impl Caller {
    pub fn anonymous(address: &str) -> Self {
        Caller::Anonymous(address.to_string())
    }

    fn storage_tag(&self) -> String {
        let tag = match self {
            Caller::Identity(id) => format!("id:{}", id),
            Caller::Anonymous(address) => format!("anon:{}", address),
        };
        tag.replace(['{', '}'], "_")
    }
}

impl From<&str> for Caller {
    fn from(identity: &str) -> Self {
        Caller::Identity(identity.to_string())
    }
}

impl From<String> for Caller {
    fn from(identity: String) -> Self {
        Caller::Identity(identity)
    }
}

impl std::fmt::Display for Caller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Caller::Identity(id) => write!(f, "{}", id),
            Caller::Anonymous(address) => write!(f, "anon:{}", address),
        }
    }
}

/// A key that uniquely identifies one quota ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LimitingKey {
    pub scope: LimitScope,
    pub caller: Caller,
    /// Endpoint name, present only for `LimitScope::Endpoint`
    pub endpoint: Option<String>,
}

impl LimitingKey {
    /// The global key of a caller.
    pub fn global(caller: impl Into<Caller>) -> Self {
        Self {
            scope: LimitScope::Global,
            caller: caller.into(),
            endpoint: None,
        }
    }

    /// The per-endpoint key of a caller.
    pub fn endpoint(caller: impl Into<Caller>, endpoint: &str) -> Self {
        Self {
            scope: LimitScope::Endpoint,
            caller: caller.into(),
            endpoint: Some(endpoint.to_string()),
        }
    }

    /// Convert the key to a string representation.
    ///
    /// Format: `global|{caller}` or `endpoint|{caller}|{endpoint}`.
    pub fn to_string_key(&self) -> String {
        match (&self.scope, &self.endpoint) {
            (LimitScope::Endpoint, Some(endpoint)) => {
                format!("endpoint|{}|{}", self.caller, endpoint)
            }
            _ => format!("global|{}", self.caller),
        }
    }

    /// Storage key for a shared backend.
    ///
    /// The caller is wrapped in a `{...}` hash tag so every key of one caller
    /// lands on the same Redis Cluster slot and can be updated by one script.
    pub fn storage_key(&self, prefix: &str) -> String {
        let caller = self.caller.storage_tag();
        match (&self.scope, &self.endpoint) {
            (LimitScope::Endpoint, Some(endpoint)) => {
                format!("{}:{{{}}}:endpoint:{}", prefix, caller, endpoint)
            }
            _ => format!("{}:{{{}}}:global", prefix, caller),
        }
    }
}

impl std::fmt::Display for LimitingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_to_string() {
        assert_eq!(LimitingKey::global("alice").to_string_key(), "global|alice");
        assert_eq!(
            LimitingKey::endpoint("alice", "GET /search").to_string(),
            "endpoint|alice|GET /search"
        );
    }

    #[test]
    fn test_key_equality() {
        assert_eq!(LimitingKey::global("a"), LimitingKey::global("a"));
        assert_ne!(LimitingKey::global("a"), LimitingKey::global("b"));
        assert_ne!(
            LimitingKey::endpoint("a", "GET /x"),
            LimitingKey::endpoint("a", "GET /y")
        );
    }

    #[test]
    fn test_storage_key_shares_hash_tag() {
        let global = LimitingKey::global("alice").storage_key("ts");
        let endpoint = LimitingKey::endpoint("alice", "POST /login").storage_key("ts");
        assert_eq!(global, "ts:{id:alice}:global");
        assert_eq!(endpoint, "ts:{id:alice}:endpoint:POST /login");
    }

    #[test]
    fn test_storage_key_escapes_braces() {
        let key = LimitingKey::global("a{b}c").storage_key("ts");
        assert_eq!(key, "ts:{id:a_b_c}:global");
    }

    #[test]
    fn test_identity_never_collides_with_anonymous() {
        let spoofed = LimitingKey::global("anon:10.0.0.1");
        let anonymous = LimitingKey::global(Caller::anonymous("10.0.0.1"));

        assert_ne!(spoofed, anonymous);
        assert_ne!(spoofed.storage_key("ts"), anonymous.storage_key("ts"));
        assert_eq!(anonymous.storage_key("ts"), "ts:{anon:10.0.0.1}:global");
        assert_eq!(anonymous.to_string_key(), "global|anon:10.0.0.1");
    }

    #[test]
    fn test_global_orders_before_endpoint() {
        assert!(LimitingKey::global("z") < LimitingKey::endpoint("a", "GET /"));
    }
}
