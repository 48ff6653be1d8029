use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::types::DeliveryStatus;

/// Errors surfaced by the pipeline's caller-facing operations.
///
/// Delivery failures are deliberately absent: a failing endpoint is never an
/// error to the event publisher, only a state visible on the delivery row.
#[derive(Debug, thiserror::Error)]
pub enum CourierError {
    /// Bad or missing input. Never retried.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Missing or unresolvable bearer credential.
    #[error("unauthorized")]
    Unauthorized,

    /// Entity absent, or present but not owned by the caller.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Replay precondition violated.
    #[error("only DEAD deliveries can be replayed (status is {status})")]
    InvalidState { status: DeliveryStatus },

    /// Record or object store backend fault.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The delivery queue is no longer accepting work.
    #[error("delivery queue is shut down")]
    QueueClosed,

    #[error("internal error: {0}")]
    Internal(String),
}

/// JSON error body returned by the HTTP surface.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    pub status: u16,
}

impl IntoResponse for CourierError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self {
            CourierError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            CourierError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            CourierError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            CourierError::InvalidState { .. } => (StatusCode::BAD_REQUEST, "invalid_state"),
            CourierError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "store_error"),
            CourierError::QueueClosed => (StatusCode::SERVICE_UNAVAILABLE, "queue_unavailable"),
            CourierError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let body = ErrorBody {
            error: kind.to_string(),
            message: self.to_string(),
            status: status.as_u16(),
        };

        (status, axum::Json(body)).into_response()
    }
}

/// Fault reported by a store backend.
///
/// The in-memory implementations never produce one; real backends map their
/// driver errors here.
#[derive(Debug, thiserror::Error)]
#[error("store backend: {0}")]
pub struct StoreError(pub String);

/// Why a single HTTP delivery attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptFailure {
    /// The request exceeded the configured timeout.
    Timeout,

    /// Transport-level fault before a status line was read.
    Network(String),

    /// The endpoint answered with a non-2xx status.
    Status(u16),
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptFailure::Timeout => write!(f, "request timed out"),
            AttemptFailure::Network(detail) => write!(f, "network error: {detail}"),
            AttemptFailure::Status(code) => write!(f, "endpoint returned HTTP {code}"),
        }
    }
}

/// Result of one job execution, as seen by the queue.
#[derive(Debug, Clone)]
pub enum JobError {
    /// Transient failure. The queue re-schedules while attempts remain and
    /// abandons once the budget is spent.
    Retry(String),

    /// Non-retryable failure. The queue abandons the job immediately.
    Fatal(String),
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobError::Retry(reason) => write!(f, "retryable: {reason}"),
            JobError::Fatal(reason) => write!(f, "fatal: {reason}"),
        }
    }
}

impl std::error::Error for JobError {}
