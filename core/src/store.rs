//! Narrow adapter over the key-value store.
//!
//! Everything above this module talks to [`KeyValueStore`], never to a
//! connection directly, so tests can swap in a fake.

use std::collections::HashMap;
use std::sync::Once;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::debug;

use crate::error::{CoordError, Result};

static CRYPTO_PROVIDER_INIT: Once = Once::new();

/// Installs the rustls ring provider once so `rediss://` DSNs work.
fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        // Already installed by the host application is fine.
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn ping(&self) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<String>>;
    /// Remaining TTL in milliseconds; `-2` when missing, `-1` without expiry.
    async fn pttl(&self, key: &str) -> Result<i64>;
    async fn expire(&self, key: &str, seconds: i64) -> Result<bool>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;
    /// Fetches several hashes in one round trip, preserving input order.
    async fn hgetall_many(&self, keys: &[String]) -> Result<Vec<HashMap<String, String>>>;
    async fn hset_multiple(&self, key: &str, fields: &[(String, String)]) -> Result<()>;
    async fn zcard(&self, key: &str) -> Result<u64>;
    async fn zrange_withscores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>>;
    async fn sadd(&self, key: &str, member: &str) -> Result<()>;
    async fn srem(&self, key: &str, member: &str) -> Result<()>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;
    /// Uploads a script and returns the SHA1 the server assigned it.
    async fn script_load(&self, source: &str) -> Result<String>;
    async fn eval_sha(&self, sha: &str, keys: &[String], args: &[String]) -> Result<redis::Value>;
}

pub(crate) fn summarize_redis_dsn(dsn: &str) -> String {
    let (scheme, rest) = dsn.split_once("://").unwrap_or(("", dsn));
    let without_auth = rest.rsplit('@').next().unwrap_or(rest);
    let host = without_auth
        .split(['/', '?', '#'])
        .next()
        .unwrap_or(without_auth);

    if scheme.is_empty() {
        host.to_string()
    } else if host.is_empty() {
        format!("{scheme}://")
    } else {
        format!("{scheme}://{host}")
    }
}

fn is_tls_handshake_error(err: &redis::RedisError) -> bool {
    let message = err.to_string().to_ascii_lowercase();
    message.contains("tls handshake") || message.contains("handshake eof")
}

fn redis_connect_context(dsn: &str, err: &redis::RedisError) -> String {
    let summary = summarize_redis_dsn(dsn);
    let mut context = if summary.is_empty() {
        "failed to connect to Redis".to_string()
    } else {
        format!("failed to connect to Redis ({summary})")
    };

    if is_tls_handshake_error(err) {
        if dsn.starts_with("rediss://") {
            context.push_str("; TLS handshake failed - verify the endpoint and certificates");
        } else {
            context.push_str("; TLS handshake failed - use rediss:// if Redis requires TLS");
        }
    }

    context
}

/// [`KeyValueStore`] backed by an auto-reconnecting Redis connection.
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(dsn: &str) -> Result<Self> {
        ensure_crypto_provider();

        let client = redis::Client::open(dsn).map_err(|err| {
            CoordError::InvalidArgument(format!(
                "invalid redis dsn ({}): {err}",
                summarize_redis_dsn(dsn)
            ))
        })?;
        let manager = ConnectionManager::new(client).await.map_err(|err| {
            tracing::warn!(error = %err, "{}", redis_connect_context(dsn, &err));
            CoordError::StoreUnavailable(err)
        })?;
        debug!(redis = %summarize_redis_dsn(dsn), "connected to Redis");
        Ok(Self { manager })
    }

    /// Empties the selected database. Intended for tests.
    pub async fn flushdb(&self) -> Result<()> {
        let mut conn = self.manager.clone();
        redis::cmd("FLUSHDB").query_async::<()>(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        Ok(conn.get(key).await?)
    }

    async fn pttl(&self, key: &str) -> Result<i64> {
        let mut conn = self.manager.clone();
        Ok(conn.pttl(key).await?)
    }

    async fn expire(&self, key: &str, seconds: i64) -> Result<bool> {
        let mut conn = self.manager.clone();
        let applied: i64 = conn.expire(key, seconds).await?;
        Ok(applied == 1)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.manager.clone();
        Ok(conn.hgetall(key).await?)
    }

    async fn hgetall_many(&self, keys: &[String]) -> Result<Vec<HashMap<String, String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.manager.clone();
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.hgetall(key);
        }
        Ok(pipe.query_async(&mut conn).await?)
    }

    async fn hset_multiple(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.manager.clone();
        conn.hset_multiple::<_, _, _, ()>(key, fields).await?;
        Ok(())
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let mut conn = self.manager.clone();
        Ok(conn.zcard(key).await?)
    }

    async fn zrange_withscores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>> {
        let mut conn = self.manager.clone();
        Ok(conn.zrange_withscores(key, start, stop).await?)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.sadd::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.srem::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.manager.clone();
        Ok(conn.smembers(key).await?)
    }

    async fn script_load(&self, source: &str) -> Result<String> {
        let mut conn = self.manager.clone();
        let sha: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(source)
            .query_async(&mut conn)
            .await?;
        Ok(sha)
    }

    async fn eval_sha(&self, sha: &str, keys: &[String], args: &[String]) -> Result<redis::Value> {
        let mut conn = self.manager.clone();
        let value = redis::cmd("EVALSHA")
            .arg(sha)
            .arg(keys.len())
            .arg(keys)
            .arg(args)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }
}
