use serde::{Deserialize, Serialize};

use crate::defaults::{
    DEFAULT_BASE_RETRY_DELAY_SECONDS, DEFAULT_DEQUEUE_BATCH_SIZE, DEFAULT_IDEMPOTENCY_TTL_SECONDS,
    DEFAULT_JOB_TIMEOUT_SECONDS, DEFAULT_KEY_PREFIX, DEFAULT_LOCK_ACQUIRE_TIMEOUT_SECONDS,
    DEFAULT_LOCK_RETRY_DELAY_MS, DEFAULT_LOCK_TTL_SECONDS, DEFAULT_MAX_PAYLOAD_BYTES,
    DEFAULT_MAX_RETRIES, DEFAULT_MAX_RETRY_DELAY_SECONDS, DEFAULT_PRIORITY,
    DEFAULT_PROMOTE_BATCH_SIZE, DEFAULT_QUEUE_NAME, DEFAULT_RECLAIM_BATCH_SIZE,
    DEFAULT_REDIS_DSN, DEFAULT_RESULT_TTL_SECONDS, DEFAULT_RETRY_JITTER_FACTOR,
    DEFAULT_WORKER_HEARTBEAT_TTL_SECONDS,
};

/// Defaults for the distributed lock manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default, deny_unknown_fields)]
pub struct LockSettings {
    /// How long an acquired lock lives before the store expires it.
    pub default_ttl_seconds: f64,
    /// How long `acquire` keeps retrying before reporting contention.
    pub acquire_timeout_seconds: f64,
    /// Base delay between acquire attempts; jitter is applied on top.
    pub retry_delay_ms: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            default_ttl_seconds: DEFAULT_LOCK_TTL_SECONDS,
            acquire_timeout_seconds: DEFAULT_LOCK_ACQUIRE_TIMEOUT_SECONDS,
            retry_delay_ms: DEFAULT_LOCK_RETRY_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct CoordSettings {
    pub redis_dsn: String,
    pub key_prefix: String,
    pub default_queue_name: String,
    pub default_priority: i64,
    pub default_max_retries: i64,
    pub default_job_timeout_seconds: i64,
    pub default_result_ttl_seconds: i64,
    pub dequeue_batch_size: usize,
    pub reclaim_batch_size: usize,
    pub promote_batch_size: usize,
    pub base_retry_delay_seconds: f64,
    pub max_retry_delay_seconds: f64,
    pub retry_jitter_factor: f64,
    pub worker_heartbeat_ttl_seconds: i64,
    pub idempotency_ttl_seconds: i64,
    pub max_payload_bytes: usize,
    pub lock: LockSettings,
}

impl Default for CoordSettings {
    fn default() -> Self {
        Self {
            redis_dsn: DEFAULT_REDIS_DSN.to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            default_queue_name: DEFAULT_QUEUE_NAME.to_string(),
            default_priority: DEFAULT_PRIORITY,
            default_max_retries: DEFAULT_MAX_RETRIES,
            default_job_timeout_seconds: DEFAULT_JOB_TIMEOUT_SECONDS,
            default_result_ttl_seconds: DEFAULT_RESULT_TTL_SECONDS,
            dequeue_batch_size: DEFAULT_DEQUEUE_BATCH_SIZE,
            reclaim_batch_size: DEFAULT_RECLAIM_BATCH_SIZE,
            promote_batch_size: DEFAULT_PROMOTE_BATCH_SIZE,
            base_retry_delay_seconds: DEFAULT_BASE_RETRY_DELAY_SECONDS,
            max_retry_delay_seconds: DEFAULT_MAX_RETRY_DELAY_SECONDS,
            retry_jitter_factor: DEFAULT_RETRY_JITTER_FACTOR,
            worker_heartbeat_ttl_seconds: DEFAULT_WORKER_HEARTBEAT_TTL_SECONDS,
            idempotency_ttl_seconds: DEFAULT_IDEMPOTENCY_TTL_SECONDS,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            lock: LockSettings::default(),
        }
    }
}
