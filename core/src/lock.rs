//! Token-protected mutex over a single Redis instance.
//!
//! Mutual exclusion holds only as far as that one instance is consistent.
//! A replicated deployment without synchronous replication can lose a lock on
//! failover; this is not a quorum (Redlock-style) algorithm.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use leaseq_config::LockSettings;
use tokio::time::Instant;
use tracing::{Instrument, debug, warn};
use uuid::Uuid;

use crate::backoff::jittered_sleep;
use crate::error::{CoordError, Result};
use crate::keys::KeySpace;
use crate::scripts::{ScriptLibrary, ScriptName, flag_and_detail};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// How long the lock lives without an extend.
    pub ttl: Duration,
    /// Upper bound on how long `acquire` keeps retrying.
    pub timeout: Duration,
    pub retry_delay: Duration,
}

impl LockOptions {
    pub fn from_settings(settings: &LockSettings) -> Self {
        Self {
            ttl: Duration::from_secs_f64(settings.default_ttl_seconds.max(0.001)),
            timeout: Duration::from_secs_f64(settings.acquire_timeout_seconds.max(0.0)),
            retry_delay: Duration::from_millis(settings.retry_delay_ms),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }
}

impl Default for LockOptions {
    fn default() -> Self {
        Self::from_settings(&LockSettings::default())
    }
}

/// Diagnostic snapshot. Never decide to proceed on this without acquiring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    pub resource: String,
    pub token: String,
    pub ttl_remaining: Option<Duration>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Stateless front for the lock scripts. Clones share nothing but the store
/// connection, so one manager can serve every task in a process. Callers that
/// want release-by-resource semantics take a [`LockHolder`].
#[derive(Clone)]
pub struct LockManager {
    scripts: ScriptLibrary,
    keys: KeySpace,
    defaults: LockOptions,
}

fn ttl_millis(ttl: Duration) -> u128 {
    ttl.as_millis().max(1)
}

impl LockManager {
    pub fn new(scripts: ScriptLibrary, keys: KeySpace, defaults: LockOptions) -> Self {
        Self {
            scripts,
            keys,
            defaults,
        }
    }

    pub fn defaults(&self) -> LockOptions {
        self.defaults
    }

    /// A holder with its own token table, for one caller.
    pub fn holder(&self) -> LockHolder {
        LockHolder {
            manager: self.clone(),
            tokens: HashMap::new(),
        }
    }

    /// Single attempt. Returns the new token, or `None` while another holder
    /// owns the resource.
    pub async fn try_acquire(&self, resource: &str, ttl: Duration) -> Result<Option<String>> {
        validate_resource(resource)?;
        let token = Uuid::new_v4().to_string();
        let reply = self
            .scripts
            .invoke(
                ScriptName::DistributedLock,
                &[self.keys.lock(resource)],
                &[token.clone(), ttl_millis(ttl).to_string()],
            )
            .await?;
        let (acquired, _holder) = flag_and_detail(ScriptName::DistributedLock, &reply)?;
        Ok((acquired == 1).then_some(token))
    }

    /// Retries with jittered delay until the lock is obtained or
    /// `options.timeout` elapses.
    pub async fn acquire(&self, resource: &str, options: LockOptions) -> Result<String> {
        let span = tracing::debug_span!("leaseq.lock.acquire", resource = %resource);
        self.acquire_with_retry(resource, options)
            .instrument(span)
            .await
    }

    async fn acquire_with_retry(&self, resource: &str, options: LockOptions) -> Result<String> {
        let started = Instant::now();
        let deadline = started + options.timeout;
        loop {
            if let Some(token) = self.try_acquire(resource, options.ttl).await? {
                debug!(waited_ms = started.elapsed().as_millis() as u64, "lock acquired");
                return Ok(token);
            }
            let now = Instant::now();
            if now >= deadline {
                debug!("lock acquire timed out");
                return Err(CoordError::Contention {
                    resource: resource.to_string(),
                    waited: started.elapsed(),
                });
            }
            let sleep = jittered_sleep(options.retry_delay).min(deadline - now);
            tokio::time::sleep(sleep).await;
        }
    }

    /// Deletes the lock only while `token` still owns it.
    pub async fn release(&self, resource: &str, token: &str) -> Result<bool> {
        let released: i64 = self
            .scripts
            .invoke_as(
                ScriptName::LockRelease,
                &[self.keys.lock(resource)],
                &[token.to_string()],
            )
            .await?;
        if released != 1 {
            debug!(resource, "release skipped; token no longer holds the lock");
        }
        Ok(released == 1)
    }

    /// Pushes expiry out by `additional` beyond what remains, while `token`
    /// still owns the lock.
    pub async fn extend(&self, resource: &str, token: &str, additional: Duration) -> Result<bool> {
        let extended: i64 = self
            .scripts
            .invoke_as(
                ScriptName::LockExtend,
                &[self.keys.lock(resource)],
                &[token.to_string(), ttl_millis(additional).to_string()],
            )
            .await?;
        Ok(extended == 1)
    }

    pub async fn is_locked(&self, resource: &str) -> Result<bool> {
        Ok(self
            .scripts
            .store()
            .get(&self.keys.lock(resource))
            .await?
            .is_some())
    }

    pub async fn lock_info(&self, resource: &str) -> Result<Option<LockInfo>> {
        let key = self.keys.lock(resource);
        let store = self.scripts.store();
        let Some(token) = store.get(&key).await? else {
            return Ok(None);
        };
        let pttl = store.pttl(&key).await?;
        let ttl_remaining = (pttl >= 0).then(|| Duration::from_millis(pttl as u64));
        let expires_at = ttl_remaining
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .map(|ttl| Utc::now() + ttl);
        Ok(Some(LockInfo {
            resource: resource.to_string(),
            token,
            ttl_remaining,
            expires_at,
        }))
    }

    /// Acquires and returns a guard that releases on drop if not released
    /// explicitly.
    pub async fn lock(&self, resource: &str, options: LockOptions) -> Result<LockGuard> {
        let token = self.acquire(resource, options).await?;
        Ok(LockGuard {
            manager: self.clone(),
            resource: resource.to_string(),
            token,
            released: false,
        })
    }

    /// Runs `f` while holding the lock. The lock is released on return and,
    /// if the returned future is dropped early, by the guard.
    pub async fn with_lock<F, Fut, T>(&self, resource: &str, options: LockOptions, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.lock(resource, options).await?;
        let output = f().await;
        if !guard.release().await? {
            warn!(resource, "lock expired before the protected section finished");
        }
        Ok(output)
    }
}

fn validate_resource(resource: &str) -> Result<()> {
    if resource.trim().is_empty() {
        return Err(CoordError::InvalidArgument(
            "lock resource cannot be empty".to_string(),
        ));
    }
    Ok(())
}

/// One caller's view of the lock manager: remembers the token from each of
/// its own acquisitions, so `release`/`extend` can be addressed by resource.
/// A token obtained by another holder is never used, even on the same manager.
pub struct LockHolder {
    manager: LockManager,
    tokens: HashMap<String, String>,
}

impl LockHolder {
    pub fn manager(&self) -> &LockManager {
        &self.manager
    }

    /// Last token this holder obtained for `resource`.
    pub fn token(&self, resource: &str) -> Option<&str> {
        self.tokens.get(resource).map(String::as_str)
    }

    pub async fn try_acquire(&mut self, resource: &str, ttl: Duration) -> Result<Option<String>> {
        let token = self.manager.try_acquire(resource, ttl).await?;
        if let Some(token) = &token {
            self.tokens.insert(resource.to_string(), token.clone());
        }
        Ok(token)
    }

    pub async fn acquire(&mut self, resource: &str, options: LockOptions) -> Result<String> {
        let token = self.manager.acquire(resource, options).await?;
        self.tokens.insert(resource.to_string(), token.clone());
        Ok(token)
    }

    /// Returns false when this holder has no token for `resource` or its token
    /// no longer owns the lock.
    pub async fn release(&mut self, resource: &str) -> Result<bool> {
        match self.tokens.remove(resource) {
            Some(token) => self.manager.release(resource, &token).await,
            None => Ok(false),
        }
    }

    pub async fn extend(&self, resource: &str, additional: Duration) -> Result<bool> {
        match self.tokens.get(resource) {
            Some(token) => self.manager.extend(resource, token, additional).await,
            None => Ok(false),
        }
    }
}

pub struct LockGuard {
    manager: LockManager,
    resource: String,
    token: String,
    released: bool,
}

impl LockGuard {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub async fn extend(&self, additional: Duration) -> Result<bool> {
        self.manager
            .extend(&self.resource, &self.token, additional)
            .await
    }

    /// Returns false when the lock had already expired or changed hands.
    /// If this future is dropped before the script replies, the guard's drop
    /// still schedules a release.
    pub async fn release(mut self) -> Result<bool> {
        let released = self.manager.release(&self.resource, &self.token).await?;
        self.released = true;
        Ok(released)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(resource = %self.resource, "lock guard dropped outside a runtime; lock left to expire");
            return;
        };
        let manager = self.manager.clone();
        let resource = std::mem::take(&mut self.resource);
        let token = std::mem::take(&mut self.token);
        handle.spawn(async move {
            if let Err(err) = manager.release(&resource, &token).await {
                warn!(resource = %resource, error = %err, "failed to release dropped lock guard");
            }
        });
    }
}
