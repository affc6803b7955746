use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use leaseq_config::CoordSettings;
use redis::Value;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

use crate::coordinator::Coordinator;
use crate::error::{CoordError, Result};
use crate::store::{KeyValueStore, RedisStore};

static REDIS_LOCK: OnceLock<AsyncMutex<()>> = OnceLock::new();

fn redis_lock() -> &'static AsyncMutex<()> {
    REDIS_LOCK.get_or_init(|| AsyncMutex::new(()))
}

/// Serialized access to a flushed test database.
pub struct RedisTestContext {
    _guard: MutexGuard<'static, ()>,
    pub settings: CoordSettings,
    pub store: RedisStore,
}

impl RedisTestContext {
    /// Connects to `LEASEQ_TEST_REDIS_DSN` (default db 15) and flushes it.
    /// Fails when no server answers, so Redis-backed tests never pass vacuously.
    pub async fn new() -> Result<Self> {
        let guard = redis_lock().lock().await;
        let redis_dsn = std::env::var("LEASEQ_TEST_REDIS_DSN")
            .unwrap_or_else(|_| "redis://localhost:6379/15".to_string());

        let connect = async {
            let store = RedisStore::connect(&redis_dsn).await?;
            store.ping().await?;
            store.flushdb().await?;
            Ok::<_, CoordError>(store)
        };
        let store = tokio::time::timeout(Duration::from_secs(5), connect)
            .await
            .map_err(|_| {
                CoordError::InvalidArgument(format!(
                    "timed out connecting to test Redis at {redis_dsn}"
                ))
            })??;

        let settings = CoordSettings {
            redis_dsn,
            key_prefix: "leaseq-test".to_string(),
            base_retry_delay_seconds: 0.0,
            max_retry_delay_seconds: 0.0,
            retry_jitter_factor: 0.0,
            ..CoordSettings::default()
        };
        Ok(Self {
            _guard: guard,
            settings,
            store,
        })
    }

    /// A fresh coordinator over the shared connection.
    pub async fn coordinator(&self) -> Coordinator {
        Coordinator::with_store(self.settings.clone(), std::sync::Arc::new(self.store.clone()))
            .await
            .expect("failed to build coordinator for test")
    }
}

#[derive(Default)]
struct FakeState {
    strings: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, HashSet<String>>,
    loaded: Vec<String>,
    eval_replies: VecDeque<Result<Value>>,
    eval_fallback: Option<Value>,
    eval_calls: usize,
    eval_args: Vec<Vec<String>>,
}

/// In-memory store for tests that do not need Lua. Script evaluations answer
/// from a queue of canned replies.
#[derive(Default)]
pub struct FakeStore {
    state: Mutex<FakeState>,
}

impl FakeStore {
    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake store mutex poisoned")
    }

    pub fn no_script_error() -> CoordError {
        CoordError::Store(redis::RedisError::from((
            redis::ErrorKind::NoScriptError,
            "No matching script",
        )))
    }

    pub fn push_eval_reply(&self, value: Value) {
        self.state().eval_replies.push_back(Ok(value));
    }

    pub fn push_eval_error(&self, err: CoordError) {
        self.state().eval_replies.push_back(Err(err));
    }

    pub fn set_eval_fallback(&self, value: Value) {
        self.state().eval_fallback = Some(value);
    }

    pub fn eval_calls(&self) -> usize {
        self.state().eval_calls
    }

    /// ARGV of every script evaluation, in call order.
    pub fn eval_args(&self) -> Vec<Vec<String>> {
        self.state().eval_args.clone()
    }

    pub fn loaded_scripts(&self) -> Vec<String> {
        self.state().loaded.clone()
    }
}

#[async_trait]
impl KeyValueStore for FakeStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.state().strings.get(key).cloned())
    }

    async fn pttl(&self, key: &str) -> Result<i64> {
        let state = self.state();
        if state.strings.contains_key(key) || state.hashes.contains_key(key) {
            Ok(-1)
        } else {
            Ok(-2)
        }
    }

    async fn expire(&self, key: &str, _seconds: i64) -> Result<bool> {
        let state = self.state();
        Ok(state.strings.contains_key(key)
            || state.hashes.contains_key(key)
            || state.sets.contains_key(key))
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self.state().hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hgetall_many(&self, keys: &[String]) -> Result<Vec<HashMap<String, String>>> {
        let state = self.state();
        Ok(keys
            .iter()
            .map(|key| state.hashes.get(key).cloned().unwrap_or_default())
            .collect())
    }

    async fn hset_multiple(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        let mut state = self.state();
        let hash = state.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn zcard(&self, _key: &str) -> Result<u64> {
        Ok(0)
    }

    async fn zrange_withscores(
        &self,
        _key: &str,
        _start: isize,
        _stop: isize,
    ) -> Result<Vec<(String, f64)>> {
        Ok(Vec::new())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        self.state()
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        if let Some(set) = self.state().sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .state()
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn script_load(&self, source: &str) -> Result<String> {
        self.state().loaded.push(source.to_string());
        Ok(redis::Script::new(source).get_hash().to_string())
    }

    async fn eval_sha(&self, _sha: &str, _keys: &[String], args: &[String]) -> Result<Value> {
        let mut state = self.state();
        state.eval_calls += 1;
        state.eval_args.push(args.to_vec());
        if let Some(reply) = state.eval_replies.pop_front() {
            return reply;
        }
        match state.eval_fallback.clone() {
            Some(value) => Ok(value),
            None => Err(CoordError::unexpected("fake store", "no scripted reply")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_store_round_trips_hashes_and_sets() {
        let store = FakeStore::default();
        store
            .hset_multiple("h", &[("a".to_string(), "1".to_string())])
            .await
            .unwrap();
        assert_eq!(store.hgetall("h").await.unwrap().get("a").map(String::as_str), Some("1"));
        assert!(store.expire("h", 10).await.unwrap());
        assert!(!store.expire("missing", 10).await.unwrap());

        store.sadd("s", "x").await.unwrap();
        assert_eq!(store.smembers("s").await.unwrap(), vec!["x"]);
        store.srem("s", "x").await.unwrap();
        assert!(store.smembers("s").await.unwrap().is_empty());
    }
}
