//! Redis key layout.
//!
//! Every key lives under a configurable prefix so several deployments can
//! share one database:
//!
//! | key | type |
//! |---|---|
//! | `{p}:job:{id}` | hash, one job record |
//! | `{p}:queue:{q}:ready` | zset, score `-priority`, member `{seq:016}\|{id}` |
//! | `{p}:queue:{q}:delayed` | zset, score = run-at ms |
//! | `{p}:queue:{q}:processing` | zset, score = lease deadline ms |
//! | `{p}:queue:{q}:seq` | string counter for FIFO tie-breaks |
//! | `{p}:queue:{q}:stats` | hash of lifetime counters |
//! | `{p}:queues` | set of known queue names |
//! | `{p}:worker:{id}` / `{p}:workers` | worker hash / registry set |
//! | `{p}:lock:{resource}` | string holding the owner token |
//! | `{p}:ratelimit:{k}` | zset of admitted request timestamps |
//! | `{p}:cas:{k}` | hash with `value` and `version` |
//! | `{p}:kv:{k}` | plain string for counters and batches |
//! | `{p}:idempotency:{k}` | job id owning an idempotency key |

use leaseq_config::MEMBER_SEPARATOR;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let prefix = prefix.trim_end_matches(':').to_string();
        Self { prefix }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Prefix that turns a job id into its record key; scripts build keys from it.
    pub fn job_prefix(&self) -> String {
        format!("{}:job:", self.prefix)
    }

    pub fn job(&self, job_id: &str) -> String {
        format!("{}:job:{job_id}", self.prefix)
    }

    fn queue(&self, queue_name: &str, suffix: &str) -> String {
        format!("{}:queue:{queue_name}:{suffix}", self.prefix)
    }

    pub fn ready(&self, queue_name: &str) -> String {
        self.queue(queue_name, "ready")
    }

    pub fn delayed(&self, queue_name: &str) -> String {
        self.queue(queue_name, "delayed")
    }

    pub fn processing(&self, queue_name: &str) -> String {
        self.queue(queue_name, "processing")
    }

    pub fn sequence(&self, queue_name: &str) -> String {
        self.queue(queue_name, "seq")
    }

    pub fn stats(&self, queue_name: &str) -> String {
        self.queue(queue_name, "stats")
    }

    pub fn queues(&self) -> String {
        format!("{}:queues", self.prefix)
    }

    pub fn worker(&self, worker_id: &str) -> String {
        format!("{}:worker:{worker_id}", self.prefix)
    }

    pub fn workers(&self) -> String {
        format!("{}:workers", self.prefix)
    }

    pub fn lock(&self, resource: &str) -> String {
        format!("{}:lock:{resource}", self.prefix)
    }

    pub fn rate_limit(&self, key: &str) -> String {
        format!("{}:ratelimit:{key}", self.prefix)
    }

    pub fn versioned(&self, key: &str) -> String {
        format!("{}:cas:{key}", self.prefix)
    }

    /// Plain string values touched by counters and batches.
    pub fn value(&self, key: &str) -> String {
        format!("{}:kv:{key}", self.prefix)
    }

    pub fn idempotency(&self, key: &str) -> String {
        format!("{}:idempotency:{key}", self.prefix)
    }
}

/// Extracts the job id from a ready-set member (`{seq:016}|{job_id}`).
pub fn job_id_from_member(member: &str) -> Option<&str> {
    member
        .split_once(MEMBER_SEPARATOR)
        .map(|(_, job_id)| job_id)
        .filter(|job_id| !job_id.is_empty())
}
