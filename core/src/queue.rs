//! Priority job queue with lease-based delivery.
//!
//! Per queue the service keeps three sorted sets: `ready` (eligible now,
//! highest priority first, FIFO within a priority), `delayed` (scored by
//! run-at time) and `processing` (scored by lease deadline). A job is in at
//! most one of them at a time and every move between them happens inside a
//! server-side script. Delivery is at-least-once: a lease that runs out is
//! handed to the next dequeue, so handlers must be idempotent.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use leaseq_config::{CoordSettings, validate_name};
use serde_json::Map;
use tracing::{Instrument, debug, info, warn};

use crate::backoff::RetryPolicy;
use crate::error::{CoordError, Result};
use crate::job::{Job, JobResult, QueueStats, WorkerInfo};
use crate::keys::{KeySpace, job_id_from_member};
use crate::scripts::{ScriptLibrary, ScriptName, flag_and_detail};
use crate::store::KeyValueStore;
use crate::validator::{Payload, PayloadValidator, SizeLimitValidator};

/// Per-job overrides for [`JobQueue::enqueue`]; unset fields take the
/// configured defaults.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub job_id: Option<String>,
    pub priority: Option<i64>,
    /// Not dequeued before this instant. Takes precedence over `delay_by`.
    pub delay_until: Option<DateTime<Utc>>,
    pub delay_by: Option<Duration>,
    pub max_retries: Option<i64>,
    pub timeout_seconds: Option<i64>,
    /// How long a terminal record is kept; 0 keeps it forever.
    pub result_ttl_seconds: Option<i64>,
    pub metadata: Option<Map<String, serde_json::Value>>,
    /// A repeat enqueue with the same key returns the first job's id while
    /// that job's record still exists.
    pub idempotency_key: Option<String>,
    pub idempotency_ttl_seconds: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteOutcome {
    Completed,
    AlreadyCompleted,
    UnknownJob,
    /// The lease moved to another worker.
    NotOwner,
    NotProcessing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back to pending; eligible again after `delay`.
    Retrying { attempt_count: i64, delay: Duration },
    Failed { attempt_count: i64 },
    UnknownJob,
    NotOwner,
    NotProcessing,
}

#[derive(Clone)]
pub struct JobQueue {
    scripts: ScriptLibrary,
    keys: KeySpace,
    settings: Arc<CoordSettings>,
    validator: Arc<dyn PayloadValidator>,
    retry_policy: RetryPolicy,
}

/// Upper bound on a job lease: 30 days.
pub const MAX_TIMEOUT_SECONDS: i64 = 30 * 24 * 60 * 60;

fn clock() -> (DateTime<Utc>, i64, String) {
    let now = Utc::now();
    (now, now.timestamp_millis(), now.to_rfc3339())
}

fn check_name(label: &str, value: &str) -> Result<()> {
    validate_name(label, value).map_err(|err| CoordError::InvalidArgument(err.to_string()))
}

fn chrono_duration(duration: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|_| CoordError::InvalidArgument(format!("duration {duration:?} out of range")))
}

impl JobQueue {
    pub fn new(scripts: ScriptLibrary, keys: KeySpace, settings: Arc<CoordSettings>) -> Self {
        let validator = Arc::new(SizeLimitValidator::new(settings.max_payload_bytes));
        let retry_policy = RetryPolicy::from_settings(&settings);
        Self {
            scripts,
            keys,
            settings,
            validator,
            retry_policy,
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn PayloadValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn settings(&self) -> &CoordSettings {
        &self.settings
    }

    /// The configured `default_queue_name`.
    pub fn default_queue(&self) -> &str {
        &self.settings.default_queue_name
    }

    fn store(&self) -> &Arc<dyn KeyValueStore> {
        self.scripts.store()
    }

    fn worker_key(&self, worker_id: Option<&str>) -> String {
        worker_id
            .map(|worker_id| self.keys.worker(worker_id))
            .unwrap_or_default()
    }

    /// Validates the payload, persists the job and places it in the ready or
    /// delayed set. Nothing is written when validation fails.
    pub async fn enqueue(
        &self,
        queue_name: &str,
        job_type: &str,
        payload: Payload,
        options: EnqueueOptions,
    ) -> Result<String> {
        let job_id = options.job_id.clone().unwrap_or_else(Job::new_id);
        let span = tracing::info_span!(
            "leaseq.enqueue",
            job_id = %job_id,
            job_type = %job_type,
            queue_name = %queue_name
        );
        self.enqueue_inner(queue_name, job_type, payload, options, job_id)
            .instrument(span)
            .await
    }

    /// [`JobQueue::enqueue`] onto the configured default queue.
    pub async fn enqueue_default(
        &self,
        job_type: &str,
        payload: Payload,
        options: EnqueueOptions,
    ) -> Result<String> {
        self.enqueue(self.default_queue(), job_type, payload, options)
            .await
    }

    async fn enqueue_inner(
        &self,
        queue_name: &str,
        job_type: &str,
        payload: Payload,
        options: EnqueueOptions,
        job_id: String,
    ) -> Result<String> {
        check_name("queue_name", queue_name)?;
        check_name("job_id", &job_id)?;
        if job_type.trim().is_empty() {
            return Err(CoordError::InvalidArgument(
                "job_type cannot be empty".to_string(),
            ));
        }

        let max_retries = options
            .max_retries
            .unwrap_or(self.settings.default_max_retries);
        if max_retries < 0 {
            return Err(CoordError::InvalidArgument(
                "max_retries must be >= 0".to_string(),
            ));
        }
        let timeout_seconds = options
            .timeout_seconds
            .unwrap_or(self.settings.default_job_timeout_seconds);
        if !(1..=MAX_TIMEOUT_SECONDS).contains(&timeout_seconds) {
            return Err(CoordError::InvalidArgument(format!(
                "timeout_seconds must be between 1 and {MAX_TIMEOUT_SECONDS}"
            )));
        }
        let result_ttl_seconds = options
            .result_ttl_seconds
            .unwrap_or(self.settings.default_result_ttl_seconds)
            .max(0);
        if let Some(key) = options.idempotency_key.as_deref() {
            check_name("idempotency_key", key)?;
        }

        let payload = self.validator.validate(job_type, payload)?;

        let (now, _, _) = clock();
        let delay_until = match (options.delay_until, options.delay_by) {
            (Some(until), _) => Some(until),
            (None, Some(delay)) if !delay.is_zero() => Some(now + chrono_duration(delay)?),
            _ => None,
        };
        let delay_score = delay_until
            .filter(|until| *until > now)
            .map(|until| until.timestamp_millis())
            .unwrap_or(0);

        let mut job = Job::new(queue_name, job_type, payload);
        job.id = job_id;
        job.priority = options.priority.unwrap_or(self.settings.default_priority);
        job.delay_until = delay_until;
        job.max_retries = max_retries;
        job.timeout_seconds = timeout_seconds;
        job.created_at = now;
        job.metadata = options.metadata.unwrap_or_default();
        job.result_ttl_seconds = result_ttl_seconds;

        let idempotency_key = options
            .idempotency_key
            .as_deref()
            .map(|key| self.keys.idempotency(key))
            .unwrap_or_default();
        let idempotency_ttl = options
            .idempotency_ttl_seconds
            .unwrap_or(self.settings.idempotency_ttl_seconds);

        let keys = [
            self.keys.job(&job.id),
            self.keys.ready(queue_name),
            self.keys.delayed(queue_name),
            self.keys.sequence(queue_name),
            self.keys.stats(queue_name),
            self.keys.queues(),
            idempotency_key,
        ];
        let mut args = vec![
            self.keys.job_prefix(),
            job.id.clone(),
            queue_name.to_string(),
            job.priority.to_string(),
            delay_score.to_string(),
            idempotency_ttl.to_string(),
        ];
        for (field, value) in job.to_fields()? {
            args.push(field);
            args.push(value);
        }

        let reply = self.scripts.invoke(ScriptName::Enqueue, &keys, &args).await?;
        let (status, returned) = flag_and_detail(ScriptName::Enqueue, &reply)?;
        let returned_id: String = redis::from_redis_value(&returned)
            .map_err(|err| CoordError::unexpected(ScriptName::Enqueue.as_str(), err.to_string()))?;

        match status {
            1 => {
                let delayed = delay_score > 0;
                info!(delayed, priority = job.priority, "job enqueued");
                Ok(returned_id)
            }
            0 => {
                debug!(existing_job_id = %returned_id, "idempotency key matched an existing job");
                Ok(returned_id)
            }
            -1 => Err(CoordError::DuplicateJob(returned_id)),
            other => Err(CoordError::unexpected(
                ScriptName::Enqueue.as_str(),
                format!("status {other}"),
            )),
        }
    }

    /// Leases the next ready job, if any. Expired leases are reclaimed and due
    /// delayed jobs promoted in the same atomic step.
    pub async fn dequeue(&self, queue_name: &str, worker_id: Option<&str>) -> Result<Option<Job>> {
        Ok(self
            .dequeue_batch(queue_name, worker_id, 1)
            .await?
            .into_iter()
            .next())
    }

    /// Leases up to the configured `dequeue_batch_size` jobs.
    pub async fn poll(&self, queue_name: &str, worker_id: Option<&str>) -> Result<Vec<Job>> {
        self.dequeue_batch(queue_name, worker_id, self.settings.dequeue_batch_size)
            .await
    }

    pub async fn dequeue_batch(
        &self,
        queue_name: &str,
        worker_id: Option<&str>,
        max_items: usize,
    ) -> Result<Vec<Job>> {
        check_name("queue_name", queue_name)?;
        if let Some(worker_id) = worker_id {
            check_name("worker_id", worker_id)?;
        }
        if max_items == 0 {
            return Ok(Vec::new());
        }

        let span = tracing::debug_span!(
            "leaseq.dequeue",
            queue_name = %queue_name,
            worker_id = worker_id.unwrap_or_default()
        );
        self.lease_ready(queue_name, worker_id, max_items)
            .instrument(span)
            .await
    }

    async fn lease_ready(
        &self,
        queue_name: &str,
        worker_id: Option<&str>,
        max_items: usize,
    ) -> Result<Vec<Job>> {
        let (_, now_ms, now_iso) = clock();
        let keys = [
            self.keys.ready(queue_name),
            self.keys.processing(queue_name),
            self.keys.delayed(queue_name),
            self.keys.sequence(queue_name),
            self.keys.stats(queue_name),
            self.worker_key(worker_id),
        ];
        let args = [
            self.keys.job_prefix(),
            now_ms.to_string(),
            now_iso,
            max_items.to_string(),
            worker_id.unwrap_or_default().to_string(),
            self.settings.reclaim_batch_size.to_string(),
            self.settings.promote_batch_size.to_string(),
        ];
        let job_ids: Vec<String> = self
            .scripts
            .invoke_as(ScriptName::LeaseDequeue, &keys, &args)
            .await?;
        if job_ids.is_empty() {
            return Ok(Vec::new());
        }

        let jobs = self.load_jobs(&job_ids).await?;
        for job in &jobs {
            debug!(job_id = %job.id, attempt = job.attempt_count, "job leased");
        }
        Ok(jobs)
    }

    async fn load_jobs(&self, job_ids: &[String]) -> Result<Vec<Job>> {
        let record_keys: Vec<String> = job_ids.iter().map(|id| self.keys.job(id)).collect();
        let records = self.store().hgetall_many(&record_keys).await?;
        let mut jobs = Vec::with_capacity(records.len());
        for (key, raw) in record_keys.iter().zip(records) {
            if raw.is_empty() {
                warn!(key = %key, "job record vanished before it could be read");
                continue;
            }
            jobs.push(Job::from_fields(key, &raw)?);
        }
        Ok(jobs)
    }

    /// Marks a leased job completed. Repeated calls are harmless.
    pub async fn complete(
        &self,
        job_id: &str,
        result: serde_json::Value,
        worker_id: Option<&str>,
    ) -> Result<CompleteOutcome> {
        let Some(job) = self.get_job(job_id).await? else {
            return Ok(CompleteOutcome::UnknownJob);
        };
        let (_, _, now_iso) = clock();
        let keys = [
            self.keys.job(job_id),
            self.keys.processing(&job.queue_name),
            self.keys.stats(&job.queue_name),
            self.worker_key(worker_id),
        ];
        let args = [
            job_id.to_string(),
            worker_id.unwrap_or_default().to_string(),
            serde_json::to_string(&result)?,
            now_iso,
        ];
        let status: i64 = self
            .scripts
            .invoke_as(ScriptName::Complete, &keys, &args)
            .await?;
        let outcome = match status {
            1 => CompleteOutcome::Completed,
            0 => CompleteOutcome::AlreadyCompleted,
            -1 => CompleteOutcome::UnknownJob,
            -2 => CompleteOutcome::NotOwner,
            -3 => CompleteOutcome::NotProcessing,
            other => {
                return Err(CoordError::unexpected(
                    ScriptName::Complete.as_str(),
                    format!("status {other}"),
                ));
            }
        };
        match outcome {
            CompleteOutcome::Completed => info!(job_id, queue_name = %job.queue_name, "job completed"),
            CompleteOutcome::NotOwner => {
                warn!(job_id, worker_id = worker_id.unwrap_or_default(), "completion from a worker that lost the lease ignored")
            }
            _ => debug!(job_id, ?outcome, "complete was a no-op"),
        }
        Ok(outcome)
    }

    /// Records a failed attempt. The job returns to pending while attempts
    /// remain (after a backoff delay) and is otherwise left terminally failed.
    pub async fn fail(
        &self,
        job_id: &str,
        error: &str,
        details: Option<serde_json::Value>,
        worker_id: Option<&str>,
    ) -> Result<FailOutcome> {
        let Some(job) = self.get_job(job_id).await? else {
            return Ok(FailOutcome::UnknownJob);
        };
        let (now, now_ms, now_iso) = clock();
        let delay = self.retry_policy.delay_for(job.attempt_count);
        let retry_at = now + chrono_duration(delay)?;
        let details = match details {
            Some(details) => serde_json::to_string(&details)?,
            None => String::new(),
        };

        let keys = [
            self.keys.job(job_id),
            self.keys.processing(&job.queue_name),
            self.keys.ready(&job.queue_name),
            self.keys.delayed(&job.queue_name),
            self.keys.sequence(&job.queue_name),
            self.keys.stats(&job.queue_name),
            self.worker_key(worker_id),
        ];
        let args = [
            job_id.to_string(),
            worker_id.unwrap_or_default().to_string(),
            error.to_string(),
            details,
            now_iso,
            now_ms.to_string(),
            delay.as_millis().to_string(),
            retry_at.to_rfc3339(),
        ];
        let status: i64 = self.scripts.invoke_as(ScriptName::Fail, &keys, &args).await?;
        let outcome = match status {
            1 => FailOutcome::Retrying {
                attempt_count: job.attempt_count,
                delay,
            },
            2 => FailOutcome::Failed {
                attempt_count: job.attempt_count,
            },
            -1 => FailOutcome::UnknownJob,
            -2 => FailOutcome::NotOwner,
            -3 => FailOutcome::NotProcessing,
            other => {
                return Err(CoordError::unexpected(
                    ScriptName::Fail.as_str(),
                    format!("status {other}"),
                ));
            }
        };
        match outcome {
            FailOutcome::Retrying { delay, .. } => info!(
                job_id,
                error,
                retry_delay_ms = delay.as_millis() as u64,
                "job failed; retrying"
            ),
            FailOutcome::Failed { attempt_count } => {
                warn!(job_id, error, attempt_count, "job failed permanently")
            }
            _ => debug!(job_id, ?outcome, "fail was a no-op"),
        }
        Ok(outcome)
    }

    /// Cancels a job that has not been leased yet. Returns false for unknown
    /// jobs and for jobs past `Pending`; in-flight handlers are not signalled.
    pub async fn cancel(&self, job_id: &str) -> Result<bool> {
        let Some(job) = self.get_job(job_id).await? else {
            return Ok(false);
        };
        let (_, _, now_iso) = clock();
        let keys = [
            self.keys.job(job_id),
            self.keys.ready(&job.queue_name),
            self.keys.delayed(&job.queue_name),
            self.keys.stats(&job.queue_name),
        ];
        let status: i64 = self
            .scripts
            .invoke_as(ScriptName::Cancel, &keys, &[job_id.to_string(), now_iso])
            .await?;
        if status == 1 {
            info!(job_id, queue_name = %job.queue_name, "job cancelled");
        }
        Ok(status == 1)
    }

    /// Extends a held lease to `extension` from now. `None` when the worker
    /// no longer holds it.
    pub async fn renew_lease(
        &self,
        job_id: &str,
        worker_id: &str,
        extension: Duration,
    ) -> Result<Option<DateTime<Utc>>> {
        let Some(job) = self.get_job(job_id).await? else {
            return Ok(None);
        };
        let (_, now_ms, _) = clock();
        let deadline: i64 = self
            .scripts
            .invoke_as(
                ScriptName::RenewLease,
                &[self.keys.job(job_id), self.keys.processing(&job.queue_name)],
                &[
                    job_id.to_string(),
                    worker_id.to_string(),
                    extension.as_millis().to_string(),
                    now_ms.to_string(),
                ],
            )
            .await?;
        if deadline <= 0 {
            return Ok(None);
        }
        Ok(DateTime::<Utc>::from_timestamp_millis(deadline))
    }

    /// Ready jobs in dequeue order, without leasing them.
    pub async fn peek(&self, queue_name: &str, count: usize) -> Result<Vec<Job>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let members = self
            .store()
            .zrange_withscores(&self.keys.ready(queue_name), 0, count as isize - 1)
            .await?;
        let job_ids: Vec<String> = members
            .iter()
            .filter_map(|(member, _)| job_id_from_member(member).map(str::to_string))
            .collect();
        self.load_jobs(&job_ids).await
    }

    pub async fn queue_length(&self, queue_name: &str) -> Result<u64> {
        self.store().zcard(&self.keys.ready(queue_name)).await
    }

    pub async fn delayed_count(&self, queue_name: &str) -> Result<u64> {
        self.store().zcard(&self.keys.delayed(queue_name)).await
    }

    pub async fn processing_count(&self, queue_name: &str) -> Result<u64> {
        self.store().zcard(&self.keys.processing(queue_name)).await
    }

    pub async fn get_queue_stats(&self, queue_name: &str) -> Result<QueueStats> {
        let ready = self.queue_length(queue_name).await?;
        let delayed = self.delayed_count(queue_name).await?;
        let processing = self.processing_count(queue_name).await?;
        let counters = self.store().hgetall(&self.keys.stats(queue_name)).await?;
        Ok(QueueStats::from_counters(
            queue_name, ready, delayed, processing, &counters,
        ))
    }

    pub async fn list_queues(&self) -> Result<Vec<String>> {
        let mut queues = self.store().smembers(&self.keys.queues()).await?;
        queues.sort();
        Ok(queues)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        let key = self.keys.job(job_id);
        let raw = self.store().hgetall(&key).await?;
        if raw.is_empty() {
            return Ok(None);
        }
        Ok(Some(Job::from_fields(&key, &raw)?))
    }

    pub async fn get_result(&self, job_id: &str) -> Result<Option<JobResult>> {
        Ok(self.get_job(job_id).await?.map(|job| JobResult::from(&job)))
    }

    /// Polls until the job is terminal. `None` when `timeout` elapses first
    /// or the record does not exist.
    pub async fn wait_for_result(
        &self,
        job_id: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Option<JobResult>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.get_result(job_id).await? {
                None => return Ok(None),
                Some(result) if result.status.is_terminal() => return Ok(Some(result)),
                Some(_) => {}
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }

    /// Announces a worker. Its record expires unless refreshed by `heartbeat`.
    pub async fn register_worker(&self, worker_id: &str, queues: &[&str]) -> Result<()> {
        check_name("worker_id", worker_id)?;
        for queue in queues {
            check_name("queue_name", queue)?;
        }
        let (_, _, now_iso) = clock();
        let key = self.keys.worker(worker_id);
        let fields = vec![
            ("queues".to_string(), queues.join(",")),
            ("started_at".to_string(), now_iso.clone()),
            ("last_seen".to_string(), now_iso),
        ];
        self.store().hset_multiple(&key, &fields).await?;
        self.store()
            .expire(&key, self.settings.worker_heartbeat_ttl_seconds)
            .await?;
        self.store().sadd(&self.keys.workers(), worker_id).await?;
        info!(worker_id, ?queues, "worker registered");
        Ok(())
    }

    /// Refreshes the worker record. Returns false if it had already expired.
    pub async fn heartbeat(&self, worker_id: &str) -> Result<bool> {
        let key = self.keys.worker(worker_id);
        let (_, _, now_iso) = clock();
        if !self
            .store()
            .expire(&key, self.settings.worker_heartbeat_ttl_seconds)
            .await?
        {
            warn!(worker_id, "heartbeat for an expired worker; register again");
            return Ok(false);
        }
        self.store()
            .hset_multiple(&key, &[("last_seen".to_string(), now_iso)])
            .await?;
        Ok(true)
    }

    pub async fn get_worker_info(&self, worker_id: &str) -> Result<Option<WorkerInfo>> {
        let raw = self.store().hgetall(&self.keys.worker(worker_id)).await?;
        if raw.is_empty() {
            return Ok(None);
        }
        Ok(Some(WorkerInfo::from_fields(worker_id, &raw)))
    }

    /// Live workers, sorted by id. Registry entries whose record expired are
    /// pruned.
    pub async fn list_workers(&self) -> Result<Vec<WorkerInfo>> {
        let registry = self.keys.workers();
        let mut worker_ids = self.store().smembers(&registry).await?;
        worker_ids.sort();
        let keys: Vec<String> = worker_ids.iter().map(|id| self.keys.worker(id)).collect();
        let records: Vec<HashMap<String, String>> = self.store().hgetall_many(&keys).await?;

        let mut workers = Vec::with_capacity(worker_ids.len());
        for (worker_id, raw) in worker_ids.iter().zip(records) {
            if raw.is_empty() {
                self.store().srem(&registry, worker_id).await?;
                continue;
            }
            workers.push(WorkerInfo::from_fields(worker_id, &raw));
        }
        Ok(workers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;
    use crate::test_support::{FakeStore, RedisTestContext};
    use crate::validator::ValidationError;
    use serde_json::json;

    fn payload(value: serde_json::Value) -> Payload {
        match value {
            serde_json::Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    fn opts(priority: i64, max_retries: i64, timeout_seconds: i64) -> EnqueueOptions {
        EnqueueOptions {
            priority: Some(priority),
            max_retries: Some(max_retries),
            timeout_seconds: Some(timeout_seconds),
            ..Default::default()
        }
    }

    struct RejectEverything;

    impl PayloadValidator for RejectEverything {
        fn validate(&self, _job_type: &str, _payload: Payload) -> Result<Payload, ValidationError> {
            Err(ValidationError::Rejected("script fragment".to_string()))
        }
    }

    #[tokio::test]
    async fn rejected_payload_writes_nothing() {
        let store = Arc::new(FakeStore::default());
        let queue = JobQueue::new(
            ScriptLibrary::new(store.clone()),
            KeySpace::new("t"),
            Arc::new(CoordSettings::default()),
        )
        .with_validator(Arc::new(RejectEverything));

        let err = queue
            .enqueue("emails", "send", payload(json!({"body": "<script>"})), EnqueueOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::InvalidPayload(_)));
        assert_eq!(store.eval_calls(), 0);
    }

    #[tokio::test]
    async fn invalid_names_are_rejected_before_any_write() {
        let store = Arc::new(FakeStore::default());
        let queue = JobQueue::new(
            ScriptLibrary::new(store.clone()),
            KeySpace::new("t"),
            Arc::new(CoordSettings::default()),
        );

        let err = queue
            .enqueue("bad queue", "send", Payload::new(), EnqueueOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::InvalidArgument(_)));

        let err = queue
            .enqueue("emails", "send", Payload::new(), opts(0, 0, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::InvalidArgument(_)));

        let err = queue
            .enqueue("emails", "send", Payload::new(), opts(0, 0, MAX_TIMEOUT_SECONDS + 1))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::InvalidArgument(_)));
        assert_eq!(store.eval_calls(), 0);
    }

    #[tokio::test]
    async fn enqueue_default_targets_configured_queue() {
        let store = Arc::new(FakeStore::default());
        store.push_eval_reply(redis::Value::Array(vec![
            redis::Value::Int(1),
            redis::Value::BulkString(b"job-1".to_vec()),
        ]));
        let settings = CoordSettings {
            default_queue_name: "mailers".to_string(),
            ..CoordSettings::default()
        };
        let queue = JobQueue::new(
            ScriptLibrary::new(store.clone()),
            KeySpace::new("t"),
            Arc::new(settings),
        );
        assert_eq!(queue.default_queue(), "mailers");

        let job_id = queue
            .enqueue_default(
                "send",
                Payload::new(),
                EnqueueOptions {
                    job_id: Some("job-1".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(job_id, "job-1");
        let args = store.eval_args();
        assert_eq!(args.len(), 1);
        assert_eq!(args[0][2], "mailers");
    }

    #[tokio::test]
    async fn failing_twice_exhausts_two_retries() {
        let ctx = RedisTestContext::new().await.unwrap();
        let queue = ctx.coordinator().await.queue().clone();
        let job_id = queue
            .enqueue("reports", "export", payload(json!({"id": 1})), opts(5, 2, 30))
            .await
            .unwrap();

        let job = queue.dequeue("reports", Some("w1")).await.unwrap().unwrap();
        assert_eq!(job.id, job_id);
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.attempt_count, 1);
        assert_eq!(job.worker_id.as_deref(), Some("w1"));

        let outcome = queue.fail(&job_id, "boom", None, Some("w1")).await.unwrap();
        assert!(matches!(outcome, FailOutcome::Retrying { attempt_count: 1, .. }));
        let pending = queue.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(pending.status, JobStatus::Pending);
        assert_eq!(pending.attempt_count, 1);
        assert_eq!(pending.last_error.as_deref(), Some("boom"));

        let job = queue.dequeue("reports", Some("w1")).await.unwrap().unwrap();
        assert_eq!(job.attempt_count, 2);
        assert_eq!(job.status, JobStatus::Processing);

        let outcome = queue
            .fail(&job_id, "boom again", Some(json!({"code": 500})), Some("w1"))
            .await
            .unwrap();
        assert_eq!(outcome, FailOutcome::Failed { attempt_count: 2 });
        let failed = queue.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.attempt_count, failed.max_retries);
        assert_eq!(failed.error_details, Some(json!({"code": 500})));
        assert!(failed.completed_at.is_some());

        assert!(queue.dequeue("reports", Some("w1")).await.unwrap().is_none());
        let stats = queue.get_queue_stats("reports").await.unwrap();
        assert_eq!(stats.retried_total, 1);
        assert_eq!(stats.failed_total, 1);
        assert_eq!(stats.processing, 0);
    }

    #[tokio::test]
    async fn delayed_job_is_not_dequeued_early() {
        let ctx = RedisTestContext::new().await.unwrap();
        let queue = ctx.coordinator().await.queue().clone();
        let options = EnqueueOptions {
            delay_until: Some(Utc::now() + chrono::Duration::seconds(3600)),
            ..Default::default()
        };
        let job_id = queue
            .enqueue("later", "digest", Payload::new(), options)
            .await
            .unwrap();

        assert!(queue.dequeue("later", None).await.unwrap().is_none());
        assert_eq!(queue.queue_length("later").await.unwrap(), 0);
        assert_eq!(queue.delayed_count("later").await.unwrap(), 1);
        let job = queue.get_job(&job_id).await.unwrap().unwrap();
        assert!(!job.is_ready(Utc::now()));
    }

    #[tokio::test]
    async fn delayed_job_is_promoted_once_due() {
        let ctx = RedisTestContext::new().await.unwrap();
        let queue = ctx.coordinator().await.queue().clone();
        let options = EnqueueOptions {
            delay_by: Some(Duration::from_millis(200)),
            ..Default::default()
        };
        let job_id = queue
            .enqueue("soon", "digest", Payload::new(), options)
            .await
            .unwrap();
        assert!(queue.dequeue("soon", None).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(300)).await;
        let job = queue.dequeue("soon", None).await.unwrap().unwrap();
        assert_eq!(job.id, job_id);
        assert_eq!(queue.delayed_count("soon").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn concurrent_dequeue_has_a_single_winner() {
        let ctx = RedisTestContext::new().await.unwrap();
        let coordinator = ctx.coordinator().await;
        let first = coordinator.queue().clone();
        let second = coordinator.queue().clone();
        first
            .enqueue("race", "work", Payload::new(), EnqueueOptions::default())
            .await
            .unwrap();

        let (a, b) = tokio::join!(
            first.dequeue("race", Some("worker-a")),
            second.dequeue("race", Some("worker-b")),
        );
        let winners = [a.unwrap(), b.unwrap()]
            .into_iter()
            .filter(Option::is_some)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(first.processing_count("race").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn higher_priority_first_then_fifo() {
        let ctx = RedisTestContext::new().await.unwrap();
        let queue = ctx.coordinator().await.queue().clone();
        let low = queue
            .enqueue("mixed", "t", Payload::new(), opts(1, 0, 30))
            .await
            .unwrap();
        let high_a = queue
            .enqueue("mixed", "t", Payload::new(), opts(5, 0, 30))
            .await
            .unwrap();
        let high_b = queue
            .enqueue("mixed", "t", Payload::new(), opts(5, 0, 30))
            .await
            .unwrap();

        let peeked: Vec<String> = queue
            .peek("mixed", 10)
            .await
            .unwrap()
            .into_iter()
            .map(|job| job.id)
            .collect();
        assert_eq!(peeked, vec![high_a.clone(), high_b.clone(), low.clone()]);

        let batch = queue.dequeue_batch("mixed", None, 2).await.unwrap();
        let ids: Vec<&str> = batch.iter().map(|job| job.id.as_str()).collect();
        assert_eq!(ids, vec![high_a.as_str(), high_b.as_str()]);
        let last = queue.dequeue("mixed", None).await.unwrap().unwrap();
        assert_eq!(last.id, low);
    }

    #[tokio::test]
    async fn poll_uses_configured_batch_size() {
        let ctx = RedisTestContext::new().await.unwrap();
        let queue = ctx.coordinator().await.queue().clone();
        for _ in 0..3 {
            queue
                .enqueue("polled", "t", Payload::new(), EnqueueOptions::default())
                .await
                .unwrap();
        }
        let leased = queue.poll("polled", Some("w1")).await.unwrap();
        assert_eq!(leased.len(), queue.settings().dequeue_batch_size);
        assert_eq!(queue.queue_length("polled").await.unwrap(), 2);
        assert!(queue.dequeue_batch("polled", None, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed_once() {
        let ctx = RedisTestContext::new().await.unwrap();
        let queue = ctx.coordinator().await.queue().clone();
        let job_id = queue
            .enqueue("leases", "slow", Payload::new(), opts(0, 3, 1))
            .await
            .unwrap();
        queue.dequeue("leases", Some("w1")).await.unwrap().unwrap();
        assert!(queue.dequeue("leases", Some("w2")).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let (a, b) = tokio::join!(
            queue.dequeue("leases", Some("w2")),
            queue.dequeue("leases", Some("w3")),
        );
        let claimed: Vec<Job> = [a.unwrap(), b.unwrap()].into_iter().flatten().collect();
        assert_eq!(claimed.len(), 1);
        let job = &claimed[0];
        assert_eq!(job.id, job_id);
        assert_eq!(job.attempt_count, 2);
        let new_owner = job.worker_id.clone().unwrap();

        let stale = queue.complete(&job_id, json!("late"), Some("w1")).await.unwrap();
        assert_eq!(stale, CompleteOutcome::NotOwner);
        let done = queue
            .complete(&job_id, json!({"rows": 3}), Some(&new_owner))
            .await
            .unwrap();
        assert_eq!(done, CompleteOutcome::Completed);
        let again = queue
            .complete(&job_id, json!({"rows": 3}), Some(&new_owner))
            .await
            .unwrap();
        assert_eq!(again, CompleteOutcome::AlreadyCompleted);

        let stats = queue.get_queue_stats("leases").await.unwrap();
        assert_eq!(stats.reclaimed_total, 1);
        assert_eq!(stats.completed_total, 1);
    }

    #[tokio::test]
    async fn expired_lease_without_retries_left_fails() {
        let ctx = RedisTestContext::new().await.unwrap();
        let queue = ctx.coordinator().await.queue().clone();
        let job_id = queue
            .enqueue("leases", "slow", Payload::new(), opts(0, 1, 1))
            .await
            .unwrap();
        queue.dequeue("leases", Some("w1")).await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(queue.dequeue("leases", Some("w2")).await.unwrap().is_none());
        let job = queue.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.last_error.as_deref(), Some("lease expired"));
        assert_eq!(queue.processing_count("leases").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn renew_lease_keeps_ownership() {
        let ctx = RedisTestContext::new().await.unwrap();
        let queue = ctx.coordinator().await.queue().clone();
        let job_id = queue
            .enqueue("leases", "slow", Payload::new(), opts(0, 1, 1))
            .await
            .unwrap();
        queue.dequeue("leases", Some("w1")).await.unwrap().unwrap();

        let deadline = queue
            .renew_lease(&job_id, "w1", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert!(deadline > Utc::now() + chrono::Duration::seconds(20));
        assert!(queue.renew_lease(&job_id, "w2", Duration::from_secs(30)).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(queue.dequeue("leases", Some("w2")).await.unwrap().is_none());
        let job = queue.get_job(&job_id).await.unwrap().unwrap();
        assert!(!job.is_lease_expired(Utc::now()));
    }

    #[tokio::test]
    async fn cancel_only_affects_pending_jobs() {
        let ctx = RedisTestContext::new().await.unwrap();
        let queue = ctx.coordinator().await.queue().clone();
        let pending = queue
            .enqueue("c", "t", Payload::new(), EnqueueOptions::default())
            .await
            .unwrap();
        assert!(queue.cancel(&pending).await.unwrap());
        assert!(!queue.cancel(&pending).await.unwrap());
        assert_eq!(queue.queue_length("c").await.unwrap(), 0);
        assert_eq!(
            queue.get_job(&pending).await.unwrap().unwrap().status,
            JobStatus::Cancelled
        );

        let running = queue
            .enqueue("c", "t", Payload::new(), EnqueueOptions::default())
            .await
            .unwrap();
        queue.dequeue("c", None).await.unwrap().unwrap();
        assert!(!queue.cancel(&running).await.unwrap());
        assert!(!queue.cancel("no-such-job").await.unwrap());
        assert_eq!(queue.get_queue_stats("c").await.unwrap().cancelled_total, 1);
    }

    #[tokio::test]
    async fn unknown_jobs_are_benign() {
        let ctx = RedisTestContext::new().await.unwrap();
        let queue = ctx.coordinator().await.queue().clone();
        assert_eq!(
            queue.complete("ghost", json!(null), None).await.unwrap(),
            CompleteOutcome::UnknownJob
        );
        assert_eq!(
            queue.fail("ghost", "x", None, None).await.unwrap(),
            FailOutcome::UnknownJob
        );
        assert!(queue.get_result("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn idempotency_key_returns_first_job() {
        let ctx = RedisTestContext::new().await.unwrap();
        let queue = ctx.coordinator().await.queue().clone();
        let options = EnqueueOptions {
            idempotency_key: Some("order-77".to_string()),
            ..Default::default()
        };
        let first = queue
            .enqueue("orders", "charge", Payload::new(), options.clone())
            .await
            .unwrap();
        let second = queue
            .enqueue("orders", "charge", Payload::new(), options)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(queue.queue_length("orders").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn explicit_duplicate_job_id_is_rejected() {
        let ctx = RedisTestContext::new().await.unwrap();
        let queue = ctx.coordinator().await.queue().clone();
        let options = EnqueueOptions {
            job_id: Some("fixed-id".to_string()),
            ..Default::default()
        };
        queue
            .enqueue("q", "t", Payload::new(), options.clone())
            .await
            .unwrap();
        let err = queue
            .enqueue("q", "t", Payload::new(), options)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::DuplicateJob(id) if id == "fixed-id"));
    }

    #[tokio::test]
    async fn failure_with_backoff_waits_in_delayed_set() {
        let ctx = RedisTestContext::new().await.unwrap();
        let queue = ctx
            .coordinator()
            .await
            .queue()
            .clone()
            .with_retry_policy(RetryPolicy {
                base_delay_seconds: 60.0,
                max_delay_seconds: 600.0,
                jitter_factor: 0.0,
            });
        let job_id = queue
            .enqueue("retry", "t", Payload::new(), opts(0, 3, 30))
            .await
            .unwrap();
        queue.dequeue("retry", None).await.unwrap().unwrap();

        let outcome = queue.fail(&job_id, "flaky", None, None).await.unwrap();
        assert_eq!(
            outcome,
            FailOutcome::Retrying {
                attempt_count: 1,
                delay: Duration::from_secs(60)
            }
        );
        assert_eq!(queue.queue_length("retry").await.unwrap(), 0);
        assert_eq!(queue.delayed_count("retry").await.unwrap(), 1);
        let job = queue.get_job(&job_id).await.unwrap().unwrap();
        assert!(job.delay_until.is_some_and(|until| until > Utc::now()));
        assert!(queue.dequeue("retry", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn worker_bookkeeping_tracks_jobs() {
        let ctx = RedisTestContext::new().await.unwrap();
        let queue = ctx.coordinator().await.queue().clone();
        queue.register_worker("w-books", &["books"]).await.unwrap();
        let job_id = queue
            .enqueue("books", "index", Payload::new(), EnqueueOptions::default())
            .await
            .unwrap();

        queue.dequeue("books", Some("w-books")).await.unwrap().unwrap();
        let info = queue.get_worker_info("w-books").await.unwrap().unwrap();
        assert_eq!(info.current_job.as_deref(), Some(job_id.as_str()));
        assert_eq!(info.queues, vec!["books"]);

        queue
            .complete(&job_id, json!(true), Some("w-books"))
            .await
            .unwrap();
        let info = queue.get_worker_info("w-books").await.unwrap().unwrap();
        assert_eq!(info.jobs_completed, 1);
        assert_eq!(info.current_job, None);

        assert!(queue.heartbeat("w-books").await.unwrap());
        assert!(!queue.heartbeat("w-never").await.unwrap());
        let workers = queue.list_workers().await.unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].worker_id, "w-books");
    }

    #[tokio::test]
    async fn wait_for_result_sees_completion() {
        let ctx = RedisTestContext::new().await.unwrap();
        let queue = ctx.coordinator().await.queue().clone();
        let job_id = queue
            .enqueue("wait", "t", Payload::new(), EnqueueOptions::default())
            .await
            .unwrap();

        let timed_out = queue
            .wait_for_result(&job_id, Duration::from_millis(50), Duration::from_millis(10))
            .await
            .unwrap();
        assert!(timed_out.is_none());

        let worker = queue.clone();
        let handle = tokio::spawn(async move {
            let job = worker.dequeue("wait", None).await.unwrap().unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            worker.complete(&job.id, json!({"ok": true}), None).await.unwrap();
        });

        let result = queue
            .wait_for_result(&job_id, Duration::from_secs(5), Duration::from_millis(20))
            .await
            .unwrap()
            .unwrap();
        handle.await.unwrap();
        assert_eq!(result.status, JobStatus::Completed);
        assert_eq!(result.result, Some(json!({"ok": true})));
        assert_eq!(result.attempt_count, 1);
    }

    #[tokio::test]
    async fn queues_are_registered_on_enqueue() {
        let ctx = RedisTestContext::new().await.unwrap();
        let queue = ctx.coordinator().await.queue().clone();
        for name in ["beta", "alpha", "beta"] {
            queue
                .enqueue(name, "t", Payload::new(), EnqueueOptions::default())
                .await
                .unwrap();
        }
        assert_eq!(queue.list_queues().await.unwrap(), vec!["alpha", "beta"]);
        let stats = queue.get_queue_stats("beta").await.unwrap();
        assert_eq!(stats.ready, 2);
        assert_eq!(stats.enqueued_total, 2);
    }
}
