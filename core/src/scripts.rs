//! Server-side scripts addressed by stable names.
//!
//! Each script is loaded once at startup. If the server later forgets it
//! (restart, `SCRIPT FLUSH`), the invocation reloads it and retries once.

use std::collections::HashMap;
use std::sync::Arc;

use redis::{ErrorKind, FromRedisValue, Value};
use tracing::{debug, warn};

use crate::error::{CoordError, Result};
use crate::store::KeyValueStore;

const SLIDING_WINDOW_RATE_LIMIT_LUA: &str = include_str!("lua/sliding_window_rate_limit.lua");
const LEASE_DEQUEUE_LUA: &str = include_str!("lua/lease_dequeue.lua");
const DISTRIBUTED_LOCK_LUA: &str = include_str!("lua/distributed_lock.lua");
const COMPARE_AND_SET_LUA: &str = include_str!("lua/compare_and_set.lua");
const OVERFLOW_INCREMENT_LUA: &str = include_str!("lua/overflow_increment.lua");
const BATCH_WITH_ROLLBACK_LUA: &str = include_str!("lua/batch_with_rollback.lua");
const ENQUEUE_LUA: &str = include_str!("lua/enqueue.lua");
const COMPLETE_LUA: &str = include_str!("lua/complete.lua");
const FAIL_LUA: &str = include_str!("lua/fail.lua");
const CANCEL_LUA: &str = include_str!("lua/cancel.lua");
const RENEW_LEASE_LUA: &str = include_str!("lua/renew_lease.lua");
const LOCK_RELEASE_LUA: &str = include_str!("lua/lock_release.lua");
const LOCK_EXTEND_LUA: &str = include_str!("lua/lock_extend.lua");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptName {
    SlidingWindowRateLimit,
    LeaseDequeue,
    DistributedLock,
    CompareAndSet,
    OverflowIncrement,
    BatchWithRollback,
    Enqueue,
    Complete,
    Fail,
    Cancel,
    RenewLease,
    LockRelease,
    LockExtend,
}

impl ScriptName {
    pub const ALL: [ScriptName; 13] = [
        ScriptName::SlidingWindowRateLimit,
        ScriptName::LeaseDequeue,
        ScriptName::DistributedLock,
        ScriptName::CompareAndSet,
        ScriptName::OverflowIncrement,
        ScriptName::BatchWithRollback,
        ScriptName::Enqueue,
        ScriptName::Complete,
        ScriptName::Fail,
        ScriptName::Cancel,
        ScriptName::RenewLease,
        ScriptName::LockRelease,
        ScriptName::LockExtend,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptName::SlidingWindowRateLimit => "sliding_window_rate_limit",
            ScriptName::LeaseDequeue => "lease_dequeue",
            ScriptName::DistributedLock => "distributed_lock",
            ScriptName::CompareAndSet => "compare_and_set",
            ScriptName::OverflowIncrement => "overflow_increment",
            ScriptName::BatchWithRollback => "batch_with_rollback",
            ScriptName::Enqueue => "enqueue",
            ScriptName::Complete => "complete",
            ScriptName::Fail => "fail",
            ScriptName::Cancel => "cancel",
            ScriptName::RenewLease => "renew_lease",
            ScriptName::LockRelease => "lock_release",
            ScriptName::LockExtend => "lock_extend",
        }
    }

    pub fn source(&self) -> &'static str {
        match self {
            ScriptName::SlidingWindowRateLimit => SLIDING_WINDOW_RATE_LIMIT_LUA,
            ScriptName::LeaseDequeue => LEASE_DEQUEUE_LUA,
            ScriptName::DistributedLock => DISTRIBUTED_LOCK_LUA,
            ScriptName::CompareAndSet => COMPARE_AND_SET_LUA,
            ScriptName::OverflowIncrement => OVERFLOW_INCREMENT_LUA,
            ScriptName::BatchWithRollback => BATCH_WITH_ROLLBACK_LUA,
            ScriptName::Enqueue => ENQUEUE_LUA,
            ScriptName::Complete => COMPLETE_LUA,
            ScriptName::Fail => FAIL_LUA,
            ScriptName::Cancel => CANCEL_LUA,
            ScriptName::RenewLease => RENEW_LEASE_LUA,
            ScriptName::LockRelease => LOCK_RELEASE_LUA,
            ScriptName::LockExtend => LOCK_EXTEND_LUA,
        }
    }
}

fn is_no_script(err: &CoordError) -> bool {
    match err {
        CoordError::Store(inner) => {
            inner.kind() == ErrorKind::NoScriptError
                || inner.code().is_some_and(|code| code == "NOSCRIPT")
        }
        _ => false,
    }
}

#[derive(Clone)]
pub struct ScriptLibrary {
    store: Arc<dyn KeyValueStore>,
    hashes: Arc<HashMap<ScriptName, String>>,
}

impl ScriptLibrary {
    /// SHA1 digests are computed locally, so construction never touches the store.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        let hashes = ScriptName::ALL
            .iter()
            .map(|name| (*name, redis::Script::new(name.source()).get_hash().to_string()))
            .collect();
        Self {
            store,
            hashes: Arc::new(hashes),
        }
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub fn hash(&self, name: ScriptName) -> &str {
        self.hashes.get(&name).map(String::as_str).unwrap_or_default()
    }

    /// Loads every script. Safe to call repeatedly.
    pub async fn register_all(&self) -> Result<()> {
        for name in ScriptName::ALL {
            self.register(name).await?;
        }
        debug!(count = ScriptName::ALL.len(), "registered scripts");
        Ok(())
    }

    async fn register(&self, name: ScriptName) -> Result<()> {
        let sha = self.store.script_load(name.source()).await?;
        if sha != self.hash(name) {
            return Err(CoordError::unexpected(
                "SCRIPT LOAD",
                format!("{} hashed to {sha}, expected {}", name.as_str(), self.hash(name)),
            ));
        }
        Ok(())
    }

    pub async fn invoke(&self, name: ScriptName, keys: &[String], args: &[String]) -> Result<Value> {
        let sha = self.hash(name);
        match self.store.eval_sha(sha, keys, args).await {
            Err(err) if is_no_script(&err) => {
                warn!(script = name.as_str(), "script missing from server cache; reloading");
                self.register(name).await?;
                match self.store.eval_sha(sha, keys, args).await {
                    Err(err) if is_no_script(&err) => {
                        Err(CoordError::ScriptUnavailable(name.as_str()))
                    }
                    other => other,
                }
            }
            other => other,
        }
    }

    pub async fn invoke_as<T: FromRedisValue>(
        &self,
        name: ScriptName,
        keys: &[String],
        args: &[String],
    ) -> Result<T> {
        let value = self.invoke(name, keys, args).await?;
        redis::from_redis_value(&value)
            .map_err(|err| CoordError::unexpected(name.as_str(), err.to_string()))
    }
}

/// Splits a `{flag, detail}` reply as returned by most scripts.
pub(crate) fn flag_and_detail(name: ScriptName, value: &Value) -> Result<(i64, Value)> {
    match value {
        Value::Array(items) if !items.is_empty() => {
            let flag: i64 = redis::from_redis_value(&items[0])
                .map_err(|err| CoordError::unexpected(name.as_str(), err.to_string()))?;
            let detail = items.get(1).cloned().unwrap_or(Value::Nil);
            Ok((flag, detail))
        }
        other => Err(CoordError::unexpected(
            name.as_str(),
            format!("expected a two element array, got {other:?}"),
        )),
    }
}
