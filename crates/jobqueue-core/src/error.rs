//! Error types for the engine.
//!
//! Internal plumbing (store implementations, the demo binary) propagates
//! with `anyhow::Result` and `?`; anything a caller needs to branch on is a
//! variant of [`JobQueueError`].

use chrono::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobQueueError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("job not found")]
    NotFound,

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("job is not in a state that allows this operation: {0}")]
    Conflict(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// The `code` values from the tenant-facing HTTP contract (`spec.md` §6).
/// The engine never serves HTTP itself; this mapping exists so whatever
/// transport layer sits in front of it doesn't have to reinvent it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ValidationError,
    NotAuthenticated,
    AuthenticationFailed,
    PermissionDenied,
    NotFound,
    RateLimited,
    ServerError,
}

impl JobQueueError {
    pub fn code(&self) -> ErrorCode {
        match self {
            JobQueueError::Validation(_) => ErrorCode::ValidationError,
            JobQueueError::NotFound => ErrorCode::NotFound,
            JobQueueError::RateLimited { .. } => ErrorCode::RateLimited,
            JobQueueError::Conflict(_) => ErrorCode::ValidationError,
            JobQueueError::Store(_) => ErrorCode::ServerError,
        }
    }

    pub fn http_status(&self) -> u16 {
        match self.code() {
            ErrorCode::ValidationError => 400,
            ErrorCode::NotAuthenticated => 401,
            ErrorCode::AuthenticationFailed => 401,
            ErrorCode::PermissionDenied => 403,
            ErrorCode::NotFound => 404,
            ErrorCode::RateLimited => 429,
            ErrorCode::ServerError => 500,
        }
    }
}
