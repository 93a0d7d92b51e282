use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::session::InvalidSessionName;
use crate::source::SourceError;
use crate::stream::StreamLimitReached;

/// Structured error type for all API handlers.
///
/// Each variant maps to an HTTP status code, a machine-readable code string,
/// and a human-readable message. Implements [`IntoResponse`] so handlers can
/// return `Result<T, ApiError>` directly.
#[derive(Debug)]
pub enum ApiError {
    /// 400 - Session name failed validation. Never reaches the output source.
    InvalidSessionName(String),
    /// 503 - The open-stream cap has been reached.
    TooManyStreams(usize),
    /// 502 - The output source (tmux) failed.
    SourceUnavailable(String),
}

impl ApiError {
    /// Returns the HTTP status code for this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidSessionName(_) => StatusCode::BAD_REQUEST,
            ApiError::TooManyStreams(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::SourceUnavailable(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Returns a machine-readable error code string.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidSessionName(_) => "invalid_session_name",
            ApiError::TooManyStreams(_) => "too_many_streams",
            ApiError::SourceUnavailable(_) => "source_unavailable",
        }
    }

    /// Returns a human-readable error message.
    pub fn message(&self) -> String {
        match self {
            ApiError::InvalidSessionName(detail) => format!("Invalid session name: {}.", detail),
            ApiError::TooManyStreams(max) => {
                format!("Too many open streams (max {}). Try again shortly.", max)
            }
            ApiError::SourceUnavailable(detail) => {
                format!("Output source unavailable: {}.", detail)
            }
        }
    }
}

impl From<InvalidSessionName> for ApiError {
    fn from(err: InvalidSessionName) -> Self {
        ApiError::InvalidSessionName(err.reason)
    }
}

impl From<StreamLimitReached> for ApiError {
    fn from(err: StreamLimitReached) -> Self {
        ApiError::TooManyStreams(err.0)
    }
}

impl From<SourceError> for ApiError {
    fn from(err: SourceError) -> Self {
        ApiError::SourceUnavailable(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}
