//! Boundary check applied to job payloads before anything is written.
//!
//! Sanitizing business input is the caller's concern; the queue only needs a
//! seam to reject payloads and a default that bounds their size.

use serde_json::{Map, Value};
use thiserror::Error;

/// Job payload: a JSON object of scalar or nested values.
pub type Payload = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("payload is {actual} bytes, limit is {limit}")]
    TooLarge { actual: usize, limit: usize },
    #[error("field '{field}' rejected: {reason}")]
    Field { field: String, reason: String },
    #[error("{0}")]
    Rejected(String),
}

pub trait PayloadValidator: Send + Sync {
    /// Returns the payload to persist, possibly sanitized, or rejects it.
    fn validate(&self, job_type: &str, payload: Payload) -> Result<Payload, ValidationError>;
}

/// Trusts the caller completely.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl PayloadValidator for AcceptAll {
    fn validate(&self, _job_type: &str, payload: Payload) -> Result<Payload, ValidationError> {
        Ok(payload)
    }
}

/// Rejects payloads whose JSON encoding exceeds a byte limit, and keys with
/// control characters.
#[derive(Debug, Clone, Copy)]
pub struct SizeLimitValidator {
    max_bytes: usize,
}

impl SizeLimitValidator {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }
}

impl PayloadValidator for SizeLimitValidator {
    fn validate(&self, _job_type: &str, payload: Payload) -> Result<Payload, ValidationError> {
        if let Some(field) = payload.keys().find(|key| key.chars().any(char::is_control)) {
            return Err(ValidationError::Field {
                field: field.escape_debug().to_string(),
                reason: "control characters are not allowed in field names".to_string(),
            });
        }
        let encoded = serde_json::to_vec(&payload)
            .map_err(|err| ValidationError::Rejected(format!("payload is not encodable: {err}")))?;
        if encoded.len() > self.max_bytes {
            return Err(ValidationError::TooLarge {
                actual: encoded.len(),
                limit: self.max_bytes,
            });
        }
        Ok(payload)
    }
}
