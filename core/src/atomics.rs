use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use redis::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{CoordError, Result};
use crate::keys::KeySpace;
use crate::scripts::{ScriptLibrary, ScriptName, flag_and_detail};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub admitted: bool,
    /// Requests still admissible in the current window.
    pub remaining: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CasOutcome {
    pub applied: bool,
    /// Stored version after the call, whether or not the write applied.
    pub current_version: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: String,
    pub version: i64,
}

/// One step of [`AtomicOps::batch_with_rollback`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOp {
    op: String,
    key: String,
    value: String,
}

impl BatchOp {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new("SET", key, value)
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self::new("DEL", key, "")
    }

    pub fn incr(key: impl Into<String>, delta: i64) -> Self {
        Self::new("INCR", key, delta.to_string())
    }

    /// Builds an operation from its wire name; unknown names abort the batch
    /// server-side.
    pub fn new(op: impl Into<String>, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn op(&self) -> &str {
        &self.op
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every operation applied; one reply per operation, in order.
    Committed(Vec<String>),
    /// Nothing applied; earlier writes were restored.
    RolledBack { reason: String },
}

/// Composite operations that must never be observed half-applied.
#[derive(Clone)]
pub struct AtomicOps {
    scripts: ScriptLibrary,
    keys: KeySpace,
}

impl AtomicOps {
    pub fn new(scripts: ScriptLibrary, keys: KeySpace) -> Self {
        Self { scripts, keys }
    }

    /// Admits at most `max_requests` calls for `key` in any trailing `window`.
    pub async fn sliding_window_rate_limit(
        &self,
        key: &str,
        window: Duration,
        max_requests: u64,
    ) -> Result<RateLimitDecision> {
        let window_ms = window.as_millis();
        if window_ms == 0 {
            return Err(CoordError::InvalidArgument(
                "rate limit window must be at least 1ms".to_string(),
            ));
        }
        if max_requests == 0 {
            return Err(CoordError::InvalidArgument(
                "max_requests must be positive".to_string(),
            ));
        }

        let now_ms = Utc::now().timestamp_millis();
        let member = format!("{now_ms}-{}", Uuid::new_v4().simple());
        let reply = self
            .scripts
            .invoke(
                ScriptName::SlidingWindowRateLimit,
                &[self.keys.rate_limit(key)],
                &[
                    now_ms.to_string(),
                    window_ms.to_string(),
                    max_requests.to_string(),
                    member,
                ],
            )
            .await?;
        let (admitted, remaining) = flag_and_detail(ScriptName::SlidingWindowRateLimit, &reply)?;
        let remaining: i64 = from_value(ScriptName::SlidingWindowRateLimit, &remaining)?;
        let decision = RateLimitDecision {
            admitted: admitted == 1,
            remaining: remaining.max(0) as u64,
        };
        if !decision.admitted {
            debug!(key, "rate limit exceeded");
        }
        Ok(decision)
    }

    /// Writes `value` only when the stored version equals `expected_version`.
    /// A key that was never written has version 0.
    pub async fn compare_and_set(
        &self,
        key: &str,
        expected_version: i64,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<CasOutcome> {
        let ttl_seconds = ttl.map(|ttl| ttl.as_secs().max(1)).unwrap_or(0);
        let reply = self
            .scripts
            .invoke(
                ScriptName::CompareAndSet,
                &[self.keys.versioned(key)],
                &[
                    expected_version.to_string(),
                    value.to_string(),
                    ttl_seconds.to_string(),
                ],
            )
            .await?;
        let (applied, version) = flag_and_detail(ScriptName::CompareAndSet, &reply)?;
        Ok(CasOutcome {
            applied: applied == 1,
            current_version: from_value(ScriptName::CompareAndSet, &version)?,
        })
    }

    pub async fn read_versioned(&self, key: &str) -> Result<Option<Versioned>> {
        let redis_key = self.keys.versioned(key);
        let raw: HashMap<String, String> = self.scripts.store().hgetall(&redis_key).await?;
        let Some(value) = raw.get("value") else {
            return Ok(None);
        };
        let version = raw
            .get("version")
            .and_then(|v| v.parse::<i64>().ok())
            .ok_or_else(|| CoordError::corrupt(&redis_key, "missing version"))?;
        Ok(Some(Versioned {
            value: value.clone(),
            version,
        }))
    }

    /// Adds `delta`; a result above `max_value` is replaced by `reset_value`.
    pub async fn overflow_increment(
        &self,
        key: &str,
        delta: i64,
        max_value: i64,
        reset_value: i64,
    ) -> Result<i64> {
        if reset_value > max_value {
            return Err(CoordError::InvalidArgument(format!(
                "reset_value {reset_value} exceeds max_value {max_value}"
            )));
        }
        self.scripts
            .invoke_as(
                ScriptName::OverflowIncrement,
                &[self.keys.value(key)],
                &[
                    delta.to_string(),
                    max_value.to_string(),
                    reset_value.to_string(),
                ],
            )
            .await
    }

    /// Reads a plain value written by a counter or batch.
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        self.scripts.store().get(&self.keys.value(key)).await
    }

    pub async fn batch_with_rollback(&self, ops: &[BatchOp]) -> Result<BatchOutcome> {
        if ops.is_empty() {
            return Ok(BatchOutcome::Committed(Vec::new()));
        }
        let keys: Vec<String> = ops.iter().map(|op| self.keys.value(&op.key)).collect();
        let args: Vec<String> = ops
            .iter()
            .flat_map(|op| [op.op.clone(), op.value.clone()])
            .collect();

        let reply = self
            .scripts
            .invoke(ScriptName::BatchWithRollback, &keys, &args)
            .await?;
        let Value::Array(items) = reply else {
            return Err(CoordError::unexpected(
                ScriptName::BatchWithRollback.as_str(),
                format!("expected an array, got {reply:?}"),
            ));
        };
        let mut items = items.into_iter();
        let committed: i64 = match items.next() {
            Some(flag) => from_value(ScriptName::BatchWithRollback, &flag)?,
            None => {
                return Err(CoordError::unexpected(
                    ScriptName::BatchWithRollback.as_str(),
                    "empty reply",
                ));
            }
        };
        let rest = items
            .map(|item| from_value::<String>(ScriptName::BatchWithRollback, &item))
            .collect::<Result<Vec<_>>>()?;

        if committed == 1 {
            Ok(BatchOutcome::Committed(rest))
        } else {
            let reason = rest.into_iter().next().unwrap_or_default();
            warn!(reason = %reason, operations = ops.len(), "batch rolled back");
            Ok(BatchOutcome::RolledBack { reason })
        }
    }
}

fn from_value<T: redis::FromRedisValue>(name: ScriptName, value: &Value) -> Result<T> {
    redis::from_redis_value(value).map_err(|err| CoordError::unexpected(name.as_str(), err.to_string()))
}
