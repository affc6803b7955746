//! leaseq - distributed coordination on a single Redis instance.
//!
//! - Priority job queue with lease-based, at-least-once delivery
//! - Token-protected distributed lock with scoped guards
//! - Atomic composite operations (rate limiting, CAS, counters, batches)
//!
//! Every read-decide-write sequence runs as a server-side Lua script, so
//! concurrent workers never observe a half-applied step.

pub mod atomics;
pub mod backoff;
pub mod coordinator;
pub mod error;
pub mod job;
pub mod keys;
pub mod lock;
pub mod queue;
pub mod scripts;
pub mod store;
pub mod telemetry;
pub mod validator;

#[cfg(test)]
mod test_support;

pub use atomics::{AtomicOps, BatchOp, BatchOutcome, CasOutcome, RateLimitDecision, Versioned};
pub use backoff::RetryPolicy;
pub use coordinator::Coordinator;
pub use error::{CoordError, Result};
pub use job::{Job, JobResult, JobStatus, QueueStats, WorkerInfo};
pub use keys::KeySpace;
pub use lock::{LockGuard, LockHolder, LockInfo, LockManager, LockOptions};
pub use queue::{CompleteOutcome, EnqueueOptions, FailOutcome, JobQueue};
pub use scripts::{ScriptLibrary, ScriptName};
pub use store::{KeyValueStore, RedisStore};
pub use validator::{AcceptAll, Payload, PayloadValidator, SizeLimitValidator, ValidationError};

pub use leaseq_config::CoordSettings;
