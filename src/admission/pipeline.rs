//! The admission pipeline: validate, then check quotas, then decide.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, trace};

use super::decision::{Decision, FieldLocation, Violation};
use super::events::{DecisionEvent, DecisionSink, EventOutcome};
use super::request::{FieldSource, RequestDescriptor};
use crate::config::{FailurePolicy, GatewayConfig, LedgerBackendKind, LedgerConfig};
use crate::error::{Result, TurnstileError};
use crate::inspect::{AddressPolicy, AddressVerdict, ThreatDetector};
use crate::ratelimit::{LedgerBackend, LedgerOutcome, MemoryLedger, RedisLedger, TierResolver};

/// Orchestrates validation and quota checks into one decision per request.
///
/// Validation runs the address policy and the threat detector over the path
/// and every field value; any violation rejects the request with the full
/// list. Otherwise the caller's limiting keys are checked and recorded in a
/// single atomic ledger call, so a key that fails never leaves another key's
/// budget consumed.
pub struct AdmissionPipeline {
    detector: ThreatDetector,
    address_policy: AddressPolicy,
    tiers: TierResolver,
    ledger: Arc<dyn LedgerBackend>,
    sink: Arc<dyn DecisionSink>,
    skip_headers: HashSet<String>,
    failure_policy: FailurePolicy,
    fail_closed_retry_after: Duration,
}

impl AdmissionPipeline {
    /// Create a pipeline that fails closed with a one second retry hint.
    pub fn new(
        detector: ThreatDetector,
        address_policy: AddressPolicy,
        tiers: TierResolver,
        ledger: Arc<dyn LedgerBackend>,
        sink: Arc<dyn DecisionSink>,
    ) -> Self {
        let defaults = LedgerConfig::default();
        Self {
            detector,
            address_policy,
            tiers,
            ledger,
            sink,
            skip_headers: HashSet::new(),
            failure_policy: defaults.failure_policy,
            fail_closed_retry_after: defaults.fail_closed_retry_after(),
        }
    }

    /// Build every component from configuration around an existing ledger.
    pub fn from_config(
        config: &GatewayConfig,
        ledger: Arc<dyn LedgerBackend>,
        sink: Arc<dyn DecisionSink>,
    ) -> Result<Self> {
        config.validate()?;

        let pipeline = Self::new(
            ThreatDetector::from_config(&config.threats)?,
            AddressPolicy::from_config(&config.address_policy)?,
            TierResolver::from_config(&config.tiers)?,
            ledger,
            sink,
        )
        .with_failure_policy(
            config.ledger.failure_policy,
            config.ledger.fail_closed_retry_after(),
        )
        .with_skipped_headers(&config.threats.skip_headers);

        Ok(pipeline)
    }

    /// Build the configured ledger, then the pipeline.
    ///
    /// The in-process ledger gets a background compaction task that stops
    /// when the ledger is dropped.
    pub async fn connect(config: &GatewayConfig, sink: Arc<dyn DecisionSink>) -> Result<Self> {
        let ledger: Arc<dyn LedgerBackend> = match config.ledger.backend {
            LedgerBackendKind::Memory => {
                let ledger = Arc::new(MemoryLedger::new());
                if let Some(interval) = config.ledger.compaction_interval() {
                    ledger.spawn_compaction(interval);
                }
                ledger as Arc<dyn LedgerBackend>
            }
            LedgerBackendKind::Redis => {
                let url = config.ledger.redis_url.as_deref().ok_or_else(|| {
                    TurnstileError::Config("ledger.redis_url is required".to_string())
                })?;
                Arc::new(RedisLedger::connect(url, &config.ledger.key_prefix).await?)
            }
        };

        info!(
            ledger = ledger.name(),
            failure_policy = ?config.ledger.failure_policy,
            "Admission pipeline ready"
        );

        Self::from_config(config, ledger, sink)
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy, retry_after: Duration) -> Self {
        self.failure_policy = policy;
        self.fail_closed_retry_after = retry_after;
        self
    }

    /// Exclude header fields with these names (case-insensitive) from
    /// threat inspection.
    pub fn with_skipped_headers<S: AsRef<str>>(mut self, names: &[S]) -> Self {
        self.skip_headers = names
            .iter()
            .map(|n| n.as_ref().to_ascii_lowercase())
            .collect();
        self
    }

    pub fn tiers(&self) -> &TierResolver {
        &self.tiers
    }

    /// Every violation in the request: address first, then path, then
    /// fields in request order.
    pub fn validate(&self, request: &RequestDescriptor) -> Vec<Violation> {
        let mut violations = Vec::new();

        if self.address_policy.evaluate(request.address()) == AddressVerdict::Deny {
            violations.push(Violation::address_denied());
        }

        for category in self.detector.classify(request.path()) {
            violations.push(Violation::threat(FieldLocation::Path, category));
        }

        for field in request.fields() {
            if field.source == FieldSource::Header
                && self.skip_headers.contains(&field.name.to_ascii_lowercase())
            {
                continue;
            }
            for category in self.detector.classify(&field.value) {
                violations.push(Violation::threat(
                    FieldLocation::Field(field.name.clone()),
                    category,
                ));
            }
        }

        violations
    }

    /// Decide, surfacing ledger failures to the caller.
    ///
    /// An event is emitted for every returned decision; nothing is emitted
    /// when the ledger fails.
    #[instrument(
        skip(self, request, now),
        fields(method = %request.method(), path = %request.path())
    )]
    pub async fn evaluate(
        &self,
        request: &RequestDescriptor,
        now: DateTime<Utc>,
    ) -> Result<Decision> {
        let violations = self.validate(request);
        if !violations.is_empty() {
            debug!(count = violations.len(), "Request failed validation");
            self.emit(request, now, None, EventOutcome::Rejected {
                violations: violations.clone(),
            });
            return Ok(Decision::Rejected { violations });
        }

        let tier = self.tiers.resolve(request.identity());
        let checks = self.tiers.limiting_checks(request);
        trace!(tier = %tier.name, keys = checks.len(), "Checking quotas");

        match self.ledger.check_and_record(&checks, now).await? {
            LedgerOutcome::Admitted => {
                self.emit(request, now, Some(tier.name.as_str()), EventOutcome::Allowed);
                Ok(Decision::Allow)
            }
            LedgerOutcome::Throttled { key, retry_after } => {
                self.emit(
                    request,
                    now,
                    Some(tier.name.as_str()),
                    EventOutcome::throttled(&key, retry_after),
                );
                Ok(Decision::Throttled { retry_after })
            }
        }
    }

    /// Decide, applying the configured failure policy when the ledger is
    /// unavailable. Exactly one decision and one event per request.
    pub async fn admit(&self, request: &RequestDescriptor, now: DateTime<Utc>) -> Decision {
        match self.evaluate(request, now).await {
            Ok(decision) => decision,
            Err(err) => {
                let tier = self.tiers.resolve(request.identity()).name.clone();
                self.emit(
                    request,
                    now,
                    Some(tier.as_str()),
                    EventOutcome::LedgerUnavailable {
                        error: err.to_string(),
                        policy: self.failure_policy,
                    },
                );
                match self.failure_policy {
                    FailurePolicy::FailOpen => Decision::Allow,
                    FailurePolicy::FailClosed => Decision::Throttled {
                        retry_after: self.fail_closed_retry_after,
                    },
                }
            }
        }
    }

    fn emit(
        &self,
        request: &RequestDescriptor,
        now: DateTime<Utc>,
        tier: Option<&str>,
        outcome: EventOutcome,
    ) {
        self.sink.record(&DecisionEvent {
            timestamp: now,
            caller: request.caller_key(),
            identity: request.identity().map(str::to_string),
            address: request.address().to_string(),
            method: request.method().to_string(),
            path: request.path().to_string(),
            tier: tier.map(str::to_string),
            outcome,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::events::MemorySink;
    use crate::inspect::ThreatCategory;
    use crate::ratelimit::QuotaCheck;
    use async_trait::async_trait;
    use chrono::TimeZone;

    const CONFIG: &str = r#"
tiers:
  default_tier: free
  definitions:
    - name: free
      budget: 3
      window_secs: 60
    - name: premium
      budget: 20
      window_secs: 60
  callers:
    - identity: alice
      tier: premium
address_policy:
  deny: ["203.0.113.0/24"]
threats:
  skip_headers: ["user-agent"]
"#;

    struct UnavailableLedger;

    #[async_trait]
    impl LedgerBackend for UnavailableLedger {
        async fn check_and_record(
            &self,
            _checks: &[QuotaCheck],
            _now: DateTime<Utc>,
        ) -> Result<LedgerOutcome> {
            Err(TurnstileError::LedgerUnavailable("connection refused".into()))
        }

        fn name(&self) -> &'static str {
            "unavailable"
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn pipeline_with(ledger: Arc<dyn LedgerBackend>) -> (AdmissionPipeline, Arc<MemorySink>) {
        let config = GatewayConfig::from_yaml(CONFIG).unwrap();
        let sink = Arc::new(MemorySink::new());
        let pipeline = AdmissionPipeline::from_config(&config, ledger, sink.clone()).unwrap();
        (pipeline, sink)
    }

    fn pipeline() -> (AdmissionPipeline, Arc<MemorySink>, Arc<MemoryLedger>) {
        let ledger = Arc::new(MemoryLedger::new());
        let (pipeline, sink) = pipeline_with(ledger.clone());
        (pipeline, sink, ledger)
    }

    fn request(identity: Option<&str>) -> RequestDescriptor {
        let req = RequestDescriptor::new("10.0.0.1", "GET", "/search");
        match identity {
            Some(id) => req.with_identity(id),
            None => req,
        }
    }

    #[tokio::test]
    async fn test_clean_request_allowed() {
        let (pipeline, sink, _) = pipeline();
        let req = request(Some("alice")).with_query("q", "rust");

        assert_eq!(pipeline.admit(&req, at(0)).await, Decision::Allow);
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].outcome, EventOutcome::Allowed);
        assert_eq!(events[0].tier.as_deref(), Some("premium"));
    }

    #[tokio::test]
    async fn test_injection_field_rejected() {
        let (pipeline, sink, ledger) = pipeline();
        let req = request(Some("alice")).with_query("q", "1; DROP TABLE users;--");

        let decision = pipeline.admit(&req, at(0)).await;
        assert!(decision.is_rejected());
        assert!(decision.threat_categories().contains(&ThreatCategory::Injection));
        // Rejected requests consume no quota.
        assert_eq!(ledger.key_count(), 0);
        assert!(matches!(sink.events()[0].outcome, EventOutcome::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_all_violations_reported() {
        let (pipeline, _, _) = pipeline();
        let req = RequestDescriptor::new("203.0.113.9", "GET", "/files/../../etc/passwd")
            .with_query("q", "' OR '1'='1")
            .with_form("comment", "<script>alert(1)</script>");

        match pipeline.admit(&req, at(0)).await {
            Decision::Rejected { violations } => {
                assert_eq!(violations[0], Violation::address_denied());
                assert_eq!(
                    violations[1],
                    Violation::threat(FieldLocation::Path, ThreatCategory::PathTraversal)
                );
                assert!(violations.contains(&Violation::threat(
                    FieldLocation::Field("q".into()),
                    ThreatCategory::Injection
                )));
                assert!(violations.contains(&Violation::threat(
                    FieldLocation::Field("comment".into()),
                    ThreatCategory::ScriptInjection
                )));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_denied_address_rejected() {
        let (pipeline, _, _) = pipeline();
        let req = RequestDescriptor::new("203.0.113.50", "GET", "/");
        assert_eq!(
            pipeline.admit(&req, at(0)).await,
            Decision::Rejected {
                violations: vec![Violation::address_denied()]
            }
        );

        let malformed = RequestDescriptor::new("not-an-address", "GET", "/");
        assert!(pipeline.admit(&malformed, at(0)).await.is_rejected());
    }

    #[tokio::test]
    async fn test_skipped_header_not_inspected() {
        let (pipeline, _, _) = pipeline();
        let req = request(None)
            .with_header("User-Agent", "Mozilla/5.0 (X11; Linux x86_64)")
            .with_header("Accept", "text/html");
        assert_eq!(pipeline.admit(&req, at(0)).await, Decision::Allow);

        let inspected = request(None).with_header("X-Forwarded-Note", "a;b");
        assert!(pipeline.admit(&inspected, at(1)).await.is_rejected());
    }

    #[tokio::test]
    async fn test_default_tier_for_unknown_caller() {
        let (pipeline, _, _) = pipeline();
        // free tier: 3 per minute globally, endpoint budget floors to 1.
        let paths = ["/a", "/b", "/c", "/d"];
        let mut decisions = Vec::new();
        for (i, path) in paths.iter().enumerate() {
            let req = RequestDescriptor::new("10.0.0.1", "GET", *path).with_identity("mallory");
            decisions.push(pipeline.admit(&req, at(i as i64)).await);
        }

        assert!(decisions[..3].iter().all(Decision::is_allow));
        assert_eq!(
            decisions[3],
            Decision::Throttled {
                retry_after: Duration::from_secs(57)
            }
        );
    }

    #[tokio::test]
    async fn test_global_exhausted_reports_global_retry() {
        let (pipeline, sink, _) = pipeline();
        // Spread over distinct endpoints so only the global key fills up.
        for i in 0..20 {
            let req = RequestDescriptor::new("10.0.0.1", "GET", format!("/item/{i}"))
                .with_identity("alice");
            assert!(pipeline.admit(&req, at(i)).await.is_allow());
        }

        let req = RequestDescriptor::new("10.0.0.1", "GET", "/fresh").with_identity("alice");
        let decision = pipeline.admit(&req, at(30)).await;
        assert_eq!(
            decision,
            Decision::Throttled {
                retry_after: Duration::from_secs(30)
            }
        );

        match &sink.events().last().unwrap().outcome {
            EventOutcome::Throttled { key, .. } => assert_eq!(key, "global|alice"),
            other => panic!("expected throttle event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_endpoint_throttle_does_not_consume_global() {
        let (pipeline, _, ledger) = pipeline();
        // premium endpoint budget is 20 / 10 = 2.
        for i in 0..2 {
            assert!(pipeline.admit(&request(Some("alice")), at(i)).await.is_allow());
        }
        assert!(pipeline.admit(&request(Some("alice")), at(2)).await.is_throttled());

        let global = crate::ratelimit::LimitingKey::global("alice");
        assert_eq!(ledger.count(&global, Duration::from_secs(60), at(2)), 2);
    }

    #[tokio::test]
    async fn test_identity_cannot_drain_anonymous_budget() {
        let (pipeline, _, _) = pipeline();
        let spoofed = request(Some("anon:10.0.0.1"));
        // free endpoint budget is max(1, 3 / 10) = 1.
        assert!(pipeline.admit(&spoofed, at(0)).await.is_allow());
        assert!(pipeline.admit(&spoofed, at(1)).await.is_throttled());

        assert!(pipeline.admit(&request(None), at(1)).await.is_allow());
    }

    #[tokio::test]
    async fn test_window_slides() {
        let (pipeline, _, _) = pipeline();
        let req = request(Some("alice"));
        assert!(pipeline.admit(&req, at(0)).await.is_allow());
        assert!(pipeline.admit(&req, at(1)).await.is_allow());
        assert!(pipeline.admit(&req, at(2)).await.is_throttled());
        assert!(pipeline.admit(&req, at(61)).await.is_allow());
    }

    #[tokio::test]
    async fn test_concurrent_admissions_share_budget() {
        let (pipeline, _, _) = pipeline();
        let requests: Vec<_> = (0..40)
            .map(|i| {
                RequestDescriptor::new("10.0.0.1", "GET", format!("/item/{i}"))
                    .with_identity("alice")
            })
            .collect();

        let decisions =
            futures::future::join_all(requests.iter().map(|r| pipeline.admit(r, at(0)))).await;

        let allowed = decisions.iter().filter(|d| d.is_allow()).count();
        assert_eq!(allowed, 20);
        assert!(decisions.iter().all(|d| d.is_allow() || d.is_throttled()));
    }

    #[tokio::test]
    async fn test_ledger_failure_fails_closed_by_default() {
        let (pipeline, sink) = pipeline_with(Arc::new(UnavailableLedger));
        let req = request(Some("alice"));

        tokio_test::assert_err!(pipeline.evaluate(&req, at(0)).await);
        assert!(sink.is_empty());

        assert_eq!(
            pipeline.admit(&req, at(0)).await,
            Decision::Throttled {
                retry_after: Duration::from_secs(1)
            }
        );
        assert!(matches!(
            sink.events()[0].outcome,
            EventOutcome::LedgerUnavailable {
                policy: FailurePolicy::FailClosed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_ledger_failure_fail_open() {
        let (pipeline, _) = pipeline_with(Arc::new(UnavailableLedger));
        let pipeline = pipeline.with_failure_policy(FailurePolicy::FailOpen, Duration::ZERO);
        assert_eq!(pipeline.admit(&request(None), at(0)).await, Decision::Allow);
    }

    #[tokio::test]
    async fn test_validation_runs_before_ledger() {
        let (pipeline, _) = pipeline_with(Arc::new(UnavailableLedger));
        let req = request(None).with_query("f", "../../etc/passwd");
        let decision = tokio_test::assert_ok!(pipeline.evaluate(&req, at(0)).await);
        assert!(decision.is_rejected());
    }

    #[tokio::test]
    async fn test_connect_memory_backend() {
        let config = GatewayConfig::from_yaml(CONFIG).unwrap();
        let pipeline = AdmissionPipeline::connect(&config, Arc::new(MemorySink::new()))
            .await
            .unwrap();
        assert_eq!(pipeline.tiers().default_tier().name, "free");
        assert!(pipeline.admit(&request(None), at(0)).await.is_allow());
    }
}
