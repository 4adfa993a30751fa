//! Per-request input to the admission pipeline.

use serde::{Deserialize, Serialize};

use crate::inspect::parse_address;
use crate::ratelimit::Caller;

/// Where a request field came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldSource {
    #[default]
    Query,
    Form,
    Header,
}

/// One decoded (name, value) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestField {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub source: FieldSource,
}

/// Immutable description of an inbound request.
///
/// Built by the surrounding service from the raw request with every value
/// already percent-decoded. The identity, when present, has already been
/// authenticated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    #[serde(default)]
    identity: Option<String>,
    address: String,
    method: String,
    path: String,
    #[serde(default)]
    fields: Vec<RequestField>,
}

impl RequestDescriptor {
    pub fn new(address: impl Into<String>, method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            identity: None,
            address: address.into(),
            method: method.into(),
            path: path.into(),
            fields: Vec::new(),
        }
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn with_field(mut self, source: FieldSource, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push(RequestField {
            name: name.into(),
            value: value.into(),
            source,
        });
        self
    }

    pub fn with_query(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.with_field(FieldSource::Query, name, value)
    }

    pub fn with_form(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.with_field(FieldSource::Form, name, value)
    }

    pub fn with_header(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.with_field(FieldSource::Header, name, value)
    }

    /// Authenticated caller identity, if the request carried one.
    pub fn identity(&self) -> Option<&str> {
        self.identity
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Fields in request order.
    pub fn fields(&self) -> &[RequestField] {
        &self.fields
    }

    /// Whose budget this request counts against.
    ///
    /// Anonymous callers are keyed by their address so they do not share a
    /// single budget.
    pub fn caller(&self) -> Caller {
        match self.identity() {
            Some(identity) => Caller::from(identity),
            None => match parse_address(&self.address) {
                Ok(ip) => Caller::Anonymous(ip.to_canonical().to_string()),
                Err(_) => Caller::anonymous(self.address.trim()),
            },
        }
    }

    /// Display form of `caller()`, as reported in decision events.
    pub fn caller_key(&self) -> String {
        self.caller().to_string()
    }

    /// Endpoint name: upper-cased method and path without query string or
    /// trailing slash.
    pub fn endpoint(&self) -> String {
        let path = self.path.split(['?', '#']).next().unwrap_or_default();
        let path = path.trim_end_matches('/');
        let path = if path.is_empty() { "/" } else { path };
        format!("{} {}", self.method.trim().to_ascii_uppercase(), path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_normalisation() {
        let req = RequestDescriptor::new("10.0.0.1", "get", "/search/?q=x");
        assert_eq!(req.endpoint(), "GET /search");

        let root = RequestDescriptor::new("10.0.0.1", "POST", "/");
        assert_eq!(root.endpoint(), "POST /");

        let empty = RequestDescriptor::new("10.0.0.1", "GET", "");
        assert_eq!(empty.endpoint(), "GET /");
    }

    #[test]
    fn test_caller_key() {
        let authed = RequestDescriptor::new("10.0.0.1", "GET", "/").with_identity("alice");
        assert_eq!(authed.caller_key(), "alice");

        let anon = RequestDescriptor::new("10.0.0.1:5555", "GET", "/");
        assert_eq!(anon.caller_key(), "anon:10.0.0.1");

        let blank = RequestDescriptor::new("10.0.0.2", "GET", "/").with_identity("  ");
        assert_eq!(blank.identity(), None);
        assert_eq!(blank.caller_key(), "anon:10.0.0.2");
    }

    #[test]
    fn test_identity_shaped_like_anonymous_key_is_distinct() {
        let spoofed = RequestDescriptor::new("10.0.0.9", "GET", "/").with_identity("anon:10.0.0.1");
        let anon = RequestDescriptor::new("10.0.0.1", "GET", "/");

        assert_eq!(spoofed.caller(), Caller::Identity("anon:10.0.0.1".into()));
        assert_eq!(anon.caller(), Caller::anonymous("10.0.0.1"));
        assert_ne!(spoofed.caller(), anon.caller());
    }

    #[test]
    fn test_fields_keep_order() {
        let req = RequestDescriptor::new("10.0.0.1", "GET", "/")
            .with_query("a", "1")
            .with_header("X-Trace", "t")
            .with_form("b", "2");

        let names: Vec<_> = req.fields().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["a", "X-Trace", "b"]);
        assert_eq!(req.fields()[1].source, FieldSource::Header);
    }

    #[test]
    fn test_deserialize_from_json() {
        let json = r#"{
            "identity": "alice",
            "address": "10.0.0.1",
            "method": "GET",
            "path": "/search",
            "fields": [{"name": "q", "value": "rust"}, {"name": "Accept", "value": "*/*", "source": "header"}]
        }"#;
        let req: RequestDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(req.identity(), Some("alice"));
        assert_eq!(req.fields()[0].source, FieldSource::Query);
        assert_eq!(req.fields()[1].source, FieldSource::Header);
    }
}
