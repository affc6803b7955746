use std::time::Duration;

use thiserror::Error;

use crate::validator::ValidationError;

pub type Result<T, E = CoordError> = std::result::Result<T, E>;

/// Errors surfaced by the coordination layer.
///
/// Operating on an unknown job id is not an error; those paths report
/// through outcome enums or `Option` instead.
#[derive(Debug, Error)]
pub enum CoordError {
    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] ValidationError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("lock on '{resource}' not acquired within {waited:?}")]
    Contention { resource: String, waited: Duration },

    #[error("script '{0}' is not available on the server after re-registering")]
    ScriptUnavailable(&'static str),

    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] redis::RedisError),

    #[error("store error: {0}")]
    Store(#[source] redis::RedisError),

    #[error("unexpected reply from {context}: {detail}")]
    UnexpectedReply {
        context: &'static str,
        detail: String,
    },

    #[error("corrupt record '{key}': {detail}")]
    CorruptRecord { key: String, detail: String },

    #[error("job id '{0}' already exists")]
    DuplicateJob(String),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoordError {
    pub(crate) fn unexpected(context: &'static str, detail: impl Into<String>) -> Self {
        CoordError::UnexpectedReply {
            context,
            detail: detail.into(),
        }
    }

    pub(crate) fn corrupt(key: impl Into<String>, detail: impl Into<String>) -> Self {
        CoordError::CorruptRecord {
            key: key.into(),
            detail: detail.into(),
        }
    }

    /// True for failures a caller may reasonably retry later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoordError::StoreUnavailable(_)
                | CoordError::ScriptUnavailable(_)
                | CoordError::Contention { .. }
        )
    }
}

impl From<redis::RedisError> for CoordError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_io_error()
            || err.is_timeout()
        {
            CoordError::StoreUnavailable(err)
        } else {
            CoordError::Store(err)
        }
    }
}
