pub const DEFAULT_REDIS_DSN: &str = "redis://localhost:6379/0";
pub const DEFAULT_KEY_PREFIX: &str = "leaseq";
pub const DEFAULT_QUEUE_NAME: &str = "default";

pub const DEFAULT_PRIORITY: i64 = 0;
pub const DEFAULT_MAX_RETRIES: i64 = 3;
pub const DEFAULT_JOB_TIMEOUT_SECONDS: i64 = 300;
pub const DEFAULT_RESULT_TTL_SECONDS: i64 = 60 * 60 * 24;
pub const DEFAULT_IDEMPOTENCY_TTL_SECONDS: i64 = 60 * 60 * 6;

pub const DEFAULT_DEQUEUE_BATCH_SIZE: usize = 1;
pub const DEFAULT_RECLAIM_BATCH_SIZE: usize = 100;
pub const DEFAULT_PROMOTE_BATCH_SIZE: usize = 100;

pub const DEFAULT_BASE_RETRY_DELAY_SECONDS: f64 = 5.0;
pub const DEFAULT_MAX_RETRY_DELAY_SECONDS: f64 = 60.0 * 60.0;
pub const DEFAULT_RETRY_JITTER_FACTOR: f64 = 0.2;

pub const DEFAULT_WORKER_HEARTBEAT_TTL_SECONDS: i64 = 90;
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 512 * 1024;

pub const DEFAULT_LOCK_TTL_SECONDS: f64 = 30.0;
pub const DEFAULT_LOCK_ACQUIRE_TIMEOUT_SECONDS: f64 = 10.0;
pub const DEFAULT_LOCK_RETRY_DELAY_MS: u64 = 100;
