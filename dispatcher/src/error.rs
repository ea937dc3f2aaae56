//! Error types for the dispatcher.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chat_dispatch_common::{ErrorBody, ErrorDetail, SessionId};

use crate::dispatch::RequestId;
use crate::engine::InferenceError;

/// Where a request was when its deadline passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Never reached a worker.
    Queued,
    /// Worker call reported timeout or finished after the deadline.
    Inference,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Queued => write!(f, "queued"),
            Stage::Inference => write!(f, "inference"),
        }
    }
}

/// Every way a submission can be refused or a request can end unsuccessfully.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    #[error("Queue is full (capacity: {capacity})")]
    QueueFull { capacity: usize },

    #[error("Session {0} is closed")]
    SessionClosed(SessionId),

    #[error("Dispatcher is shutting down")]
    ShuttingDown,

    #[error("Deadline exceeded while {0}")]
    Timeout(Stage),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Unknown request: {0}")]
    UnknownRequest(RequestId),
}

impl DispatchError {
    /// Whether the caller may reasonably resubmit later.
    ///
    /// The dispatcher never retries on its own; this is only a hint.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::QueueFull { .. } | DispatchError::Timeout(_))
    }

    /// Stable machine-readable code used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::QueueFull { .. } => "queue_full",
            DispatchError::SessionClosed(_) => "session_closed",
            DispatchError::ShuttingDown => "shutting_down",
            DispatchError::Timeout(_) => "timeout",
            DispatchError::Inference(_) => "inference_error",
            DispatchError::Cancelled => "cancelled",
            DispatchError::UnknownRequest(_) => "unknown_request",
        }
    }

    /// Map a worker failure to the caller-facing error.
    pub(crate) fn from_inference(err: InferenceError) -> Self {
        match err {
            InferenceError::Timeout => DispatchError::Timeout(Stage::Inference),
            InferenceError::Failed(msg) => DispatchError::Inference(msg),
        }
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = match &self {
            DispatchError::QueueFull { .. } => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::SessionClosed(_) => StatusCode::GONE,
            DispatchError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            DispatchError::Inference(_) => StatusCode::BAD_GATEWAY,
            DispatchError::Cancelled => StatusCode::CONFLICT,
            DispatchError::UnknownRequest(_) => StatusCode::NOT_FOUND,
        };

        let mut response = (status, Json(error_body(&self))).into_response();
        if let DispatchError::QueueFull { .. } = self {
            response
                .headers_mut()
                .insert("retry-after", axum::http::HeaderValue::from_static("1"));
        }
        response
    }
}

/// Build the JSON error envelope for an error.
pub fn error_body(err: &DispatchError) -> ErrorBody {
    ErrorBody {
        error: ErrorDetail {
            error_type: err.code().to_string(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        },
    }
}
