use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::relay::PeerRole;

/// Application-wide error type for the HTTP surface and startup
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures inside the mirroring subsystem.
///
/// None of these are fatal to the process: every variant is handled where it
/// occurs and at most turns into an advisory message to the remaining peer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MirrorError {
    /// Target role has no current peer, or its channel is closed
    #[error("{0} is not connected")]
    PeerAbsent(PeerRole),

    /// A message referenced a session that is not the current one
    #[error("session mismatch (current: {current:?}, received: {received:?})")]
    SessionMismatch {
        current: Option<String>,
        received: Option<String>,
    },

    /// Capture or convert process failed
    #[error("capture process failure: {0}")]
    ProcessFailure(String),

    /// Outstanding bytes on a channel are above the ceiling
    #[error("channel saturated ({outstanding} bytes outstanding, ceiling {ceiling})")]
    ChannelSaturated { outstanding: u64, ceiling: u64 },

    /// Channel was closed; the write was discarded
    #[error("channel closed")]
    ChannelClosed,

    /// Playout queue overflowed and the oldest entries were dropped
    #[error("playout queue overflow, dropped {dropped} chunks")]
    BufferOverflow { dropped: usize },

    /// Sink refused an append because its buffer is full
    #[error("playout sink quota exceeded")]
    SinkQuotaExceeded,

    /// Malformed message or out-of-order media unit
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

/// Error response body (unified success format)
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            success: false,
            message: self.to_string(),
        };

        tracing::error!(
            error_type = std::any::type_name_of_val(&self),
            error_message = %body.message,
            "Request failed"
        );

        (status, Json(body)).into_response()
    }
}

/// Result type alias for handlers
pub type Result<T> = std::result::Result<T, AppError>;
