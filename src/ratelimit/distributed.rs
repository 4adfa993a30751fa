//! Quota ledger shared by every gateway instance through Redis.
//!
//! Each key is a sorted set of admission timestamps. A whole admission,
//! pruning, counting and recording over every key of a request, runs as one
//! Lua script, so concurrent instances can never interleave a read and a
//! write on the same key.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};
use std::time::Duration;
use tracing::{debug, info, trace};

use super::backend::{LedgerBackend, LedgerOutcome, QuotaCheck};
use super::window::timestamp_micros;
use crate::error::{Result, TurnstileError};

/// Sliding-window-log admission over `#KEYS` sorted sets.
///
/// ARGV: now_us, member, then (budget, window_us) per key. Scores are
/// microseconds; `int` keeps them exact when handed back to Redis, which
/// would otherwise format numbers with 14 significant digits.
/// Returns `{1, 0, 0}` when admitted, `{0, key_index, retry_after_us}` when
/// the 1-based `key_index` has no room.
const ADMIT_SCRIPT: &str = r#"
local function int(x) return string.format('%.0f', x) end
local now = tonumber(ARGV[1])
local member = ARGV[2]
for i = 1, #KEYS do
  local budget = tonumber(ARGV[1 + 2 * i])
  local window = tonumber(ARGV[2 + 2 * i])
  if budget <= 0 then
    return {0, i, window}
  end
  local cutoff = now - window
  redis.call('ZREMRANGEBYSCORE', KEYS[i], '-inf', int(cutoff))
  local count = redis.call('ZCOUNT', KEYS[i], '(' .. int(cutoff), int(now))
  if count >= budget then
    local blocking = redis.call('ZRANGEBYSCORE', KEYS[i], '(' .. int(cutoff), int(now),
      'WITHSCORES', 'LIMIT', int(count - budget), 1)
    local retry = tonumber(blocking[2]) + window - now
    if retry < 0 then retry = 0 end
    return {0, i, retry}
  end
end
for i = 1, #KEYS do
  redis.call('ZADD', KEYS[i], int(now), member)
  redis.call('PEXPIRE', KEYS[i], int(math.ceil(tonumber(ARGV[2 + 2 * i]) / 1000)))
end
return {1, 0, 0}
"#;

/// A quota ledger stored in Redis.
pub struct RedisLedger {
    connection: MultiplexedConnection,
    key_prefix: String,
    script: Script,
}

impl RedisLedger {
    /// Connect to Redis.
    ///
    /// A malformed URL is a configuration error; an unreachable server is
    /// reported as `LedgerUnavailable`.
    pub async fn connect(url: &str, key_prefix: &str) -> Result<Self> {
        let client = Client::open(url)
            .map_err(|e| TurnstileError::Config(format!("Invalid redis_url: {}", e)))?;
        let connection = client.get_multiplexed_async_connection().await?;

        info!(key_prefix = %key_prefix, "Connected to shared quota ledger");

        Ok(Self {
            connection,
            key_prefix: key_prefix.to_string(),
            script: Script::new(ADMIT_SCRIPT),
        })
    }

    fn storage_keys(&self, checks: &[QuotaCheck]) -> Vec<String> {
        checks
            .iter()
            .map(|c| c.key.storage_key(&self.key_prefix))
            .collect()
    }
}

/// Script arguments after `now_us` and `member`.
fn quota_args(checks: &[QuotaCheck]) -> Vec<i64> {
    checks
        .iter()
        .flat_map(|c| {
            [
                i64::try_from(c.quota.budget).unwrap_or(i64::MAX),
                c.quota.window_micros(),
            ]
        })
        .collect()
}

/// Interpret the script reply.
fn parse_reply(reply: &[i64], checks: &[QuotaCheck]) -> Result<LedgerOutcome> {
    match reply {
        [1, ..] => Ok(LedgerOutcome::Admitted),
        [0, index, retry_us] => {
            let check = usize::try_from(*index)
                .ok()
                .and_then(|i| i.checked_sub(1))
                .and_then(|i| checks.get(i))
                .ok_or_else(|| {
                    TurnstileError::LedgerUnavailable(format!(
                        "admission script returned unknown key index {}",
                        index
                    ))
                })?;
            Ok(LedgerOutcome::Throttled {
                key: check.key.clone(),
                retry_after: Duration::from_micros((*retry_us).max(0) as u64),
            })
        }
        other => Err(TurnstileError::LedgerUnavailable(format!(
            "unexpected admission script reply {:?}",
            other
        ))),
    }
}

#[async_trait]
impl LedgerBackend for RedisLedger {
    async fn check_and_record(
        &self,
        checks: &[QuotaCheck],
        now: DateTime<Utc>,
    ) -> Result<LedgerOutcome> {
        if checks.is_empty() {
            return Ok(LedgerOutcome::Admitted);
        }

        let mut invocation = self.script.prepare_invoke();
        for key in self.storage_keys(checks) {
            invocation.key(key);
        }
        invocation
            .arg(timestamp_micros(now))
            .arg(uuid::Uuid::new_v4().to_string());
        for arg in quota_args(checks) {
            invocation.arg(arg);
        }

        let mut connection = self.connection.clone();
        let reply: Vec<i64> = invocation.invoke_async(&mut connection).await.map_err(|e| {
            debug!(error = %e, "Shared quota ledger call failed");
            TurnstileError::from(e)
        })?;

        let outcome = parse_reply(&reply, checks)?;
        trace!(keys = checks.len(), admitted = outcome.is_admitted(), "Shared ledger admission");
        Ok(outcome)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
