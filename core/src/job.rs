use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{CoordError, Result};
use crate::validator::Payload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(JobStatus::Pending),
            "PROCESSING" => Some(JobStatus::Processing),
            "COMPLETED" => Some(JobStatus::Completed),
            "FAILED" => Some(JobStatus::Failed),
            "CANCELLED" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Edges of the job state machine. `Processing -> Pending` covers both a
    /// retryable failure and a reclaimed lease; `Failed -> Pending` is the
    /// retry of a failure recorded before requeueing.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Pending)
                | (Failed, Pending)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub queue_name: String,
    pub job_type: String,
    #[serde(default)]
    pub payload: Payload,
    pub priority: i64,
    #[serde(default)]
    pub delay_until: Option<DateTime<Utc>>,
    pub max_retries: i64,
    pub timeout_seconds: i64,
    pub status: JobStatus,

    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub lease_deadline: Option<DateTime<Utc>>,

    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub attempt_count: i64,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub error_details: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub result_ttl_seconds: i64,
}

impl Job {
    pub fn new_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// A fresh pending job with no attempts.
    pub fn new(
        queue_name: impl Into<String>,
        job_type: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            id: Self::new_id(),
            queue_name: queue_name.into(),
            job_type: job_type.into(),
            payload,
            priority: 0,
            delay_until: None,
            max_retries: 0,
            timeout_seconds: 0,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            lease_deadline: None,
            worker_id: None,
            attempt_count: 0,
            last_error: None,
            error_details: None,
            result: None,
            metadata: Map::new(),
            result_ttl_seconds: 0,
        }
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.delay_until.is_none_or(|until| now >= until)
    }

    pub fn is_retryable(&self) -> bool {
        self.status == JobStatus::Failed && self.attempt_count < self.max_retries
    }

    /// Uses the renewed lease deadline when one was recorded, otherwise
    /// `started_at + timeout_seconds`.
    pub fn is_lease_expired(&self, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Processing {
            return false;
        }
        if let Some(deadline) = self.lease_deadline {
            return now > deadline;
        }
        match self.started_at {
            Some(started) => {
                (now - started).num_milliseconds() > self.timeout_seconds.saturating_mul(1000)
            }
            None => false,
        }
    }

    pub(crate) fn to_fields(&self) -> Result<Vec<(String, String)>> {
        let mut fields: Vec<(String, String)> = vec![
            ("id".to_string(), self.id.clone()),
            ("queue_name".to_string(), self.queue_name.clone()),
            ("job_type".to_string(), self.job_type.clone()),
            ("payload".to_string(), serde_json::to_string(&self.payload)?),
            ("priority".to_string(), self.priority.to_string()),
            ("max_retries".to_string(), self.max_retries.to_string()),
            ("timeout_seconds".to_string(), self.timeout_seconds.to_string()),
            ("status".to_string(), self.status.as_str().to_string()),
            ("created_at".to_string(), self.created_at.to_rfc3339()),
            ("attempt_count".to_string(), self.attempt_count.to_string()),
            ("metadata".to_string(), serde_json::to_string(&self.metadata)?),
            (
                "result_ttl_seconds".to_string(),
                self.result_ttl_seconds.to_string(),
            ),
        ];

        if let Some(value) = self.delay_until {
            fields.push(("delay_until".to_string(), value.to_rfc3339()));
        }
        if let Some(value) = self.started_at {
            fields.push(("started_at".to_string(), value.to_rfc3339()));
        }
        if let Some(value) = self.completed_at {
            fields.push(("completed_at".to_string(), value.to_rfc3339()));
        }
        if let Some(value) = self.lease_deadline {
            fields.push((
                "lease_deadline_ms".to_string(),
                value.timestamp_millis().to_string(),
            ));
        }
        if let Some(value) = self.worker_id.as_ref() {
            fields.push(("worker_id".to_string(), value.clone()));
        }
        if let Some(value) = self.last_error.as_ref() {
            fields.push(("last_error".to_string(), value.clone()));
        }
        if let Some(value) = self.error_details.as_ref() {
            fields.push(("error_details".to_string(), serde_json::to_string(value)?));
        }
        if let Some(value) = self.result.as_ref() {
            fields.push(("result".to_string(), serde_json::to_string(value)?));
        }

        Ok(fields)
    }

    pub(crate) fn from_fields(key: &str, raw: &HashMap<String, String>) -> Result<Self> {
        let required = |field: &str| {
            raw.get(field)
                .cloned()
                .ok_or_else(|| CoordError::corrupt(key, format!("missing {field}")))
        };

        let status = raw
            .get("status")
            .and_then(|value| JobStatus::parse(value))
            .ok_or_else(|| CoordError::corrupt(key, "invalid status"))?;
        let created_at = raw
            .get("created_at")
            .and_then(|value| parse_datetime(value))
            .ok_or_else(|| CoordError::corrupt(key, "missing created_at"))?;
        let payload = match raw.get("payload") {
            Some(value) => serde_json::from_str(value)
                .map_err(|err| CoordError::corrupt(key, format!("payload: {err}")))?,
            None => Map::new(),
        };

        Ok(Job {
            id: required("id")?,
            queue_name: required("queue_name")?,
            job_type: required("job_type")?,
            payload,
            priority: parse_int(raw, "priority").unwrap_or(0),
            delay_until: raw.get("delay_until").and_then(|v| parse_datetime(v)),
            max_retries: parse_int(raw, "max_retries").unwrap_or(0),
            timeout_seconds: parse_int(raw, "timeout_seconds").unwrap_or(0),
            status,
            created_at,
            started_at: raw.get("started_at").and_then(|v| parse_datetime(v)),
            completed_at: raw.get("completed_at").and_then(|v| parse_datetime(v)),
            lease_deadline: parse_int(raw, "lease_deadline_ms")
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            worker_id: raw.get("worker_id").filter(|v| !v.is_empty()).cloned(),
            attempt_count: parse_int(raw, "attempt_count").unwrap_or(0),
            last_error: raw.get("last_error").cloned(),
            error_details: raw.get("error_details").and_then(|v| parse_json(v)),
            result: raw.get("result").and_then(|v| parse_json(v)),
            metadata: raw
                .get("metadata")
                .and_then(|v| serde_json::from_str(v).ok())
                .unwrap_or_default(),
            result_ttl_seconds: parse_int(raw, "result_ttl_seconds").unwrap_or(0),
        })
    }
}

pub(crate) fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub(crate) fn parse_json(raw: &str) -> Option<Value> {
    if raw.is_empty() || raw.eq_ignore_ascii_case("null") {
        return None;
    }
    serde_json::from_str(raw).ok()
}

fn parse_int(raw: &HashMap<String, String>, field: &str) -> Option<i64> {
    raw.get(field).and_then(|value| value.parse::<i64>().ok())
}

/// Outcome of a job as seen by a producer.
#[derive(Debug, Clone, PartialEq)]
pub struct JobResult {
    pub job_id: String,
    pub status: JobStatus,
    pub result: Option<Value>,
    pub last_error: Option<String>,
    pub error_details: Option<Value>,
    pub attempt_count: i64,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Job> for JobResult {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            status: job.status,
            result: job.result.clone(),
            last_error: job.last_error.clone(),
            error_details: job.error_details.clone(),
            attempt_count: job.attempt_count,
            completed_at: job.completed_at,
        }
    }
}

/// Point-in-time view of a queue. Diagnostic only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queue_name: String,
    pub ready: u64,
    pub delayed: u64,
    pub processing: u64,
    pub enqueued_total: u64,
    pub completed_total: u64,
    pub failed_total: u64,
    pub retried_total: u64,
    pub cancelled_total: u64,
    pub reclaimed_total: u64,
}

impl QueueStats {
    pub(crate) fn from_counters(
        queue_name: &str,
        ready: u64,
        delayed: u64,
        processing: u64,
        counters: &HashMap<String, String>,
    ) -> Self {
        let counter = |field: &str| {
            counters
                .get(field)
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(0)
        };
        Self {
            queue_name: queue_name.to_string(),
            ready,
            delayed,
            processing,
            enqueued_total: counter("enqueued"),
            completed_total: counter("completed"),
            failed_total: counter("failed"),
            retried_total: counter("retried"),
            cancelled_total: counter("cancelled"),
            reclaimed_total: counter("reclaimed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerInfo {
    pub worker_id: String,
    pub queues: Vec<String>,
    pub current_job: Option<String>,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl WorkerInfo {
    pub(crate) fn from_fields(worker_id: &str, raw: &HashMap<String, String>) -> Self {
        let count = |field: &str| {
            raw.get(field)
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(0)
        };
        let queues = raw
            .get("queues")
            .map(|value| {
                value
                    .split(',')
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Self {
            worker_id: worker_id.to_string(),
            queues,
            current_job: raw.get("current_job").filter(|v| !v.is_empty()).cloned(),
            jobs_completed: count("jobs_completed"),
            jobs_failed: count("jobs_failed"),
            started_at: raw.get("started_at").and_then(|v| parse_datetime(v)),
            last_seen: raw.get("last_seen").and_then(|v| parse_datetime(v)),
        }
    }
}
