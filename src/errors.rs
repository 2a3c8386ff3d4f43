use crate::services::storage_service::{ErrorKind, StorageError};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for handler errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Settings | ErrorKind::ConversionDisabled => StatusCode::BAD_REQUEST,
        ErrorKind::Read | ErrorKind::Write | ErrorKind::CommandFailed | ErrorKind::Timeout => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        let status = status_for(err.kind());
        if status.is_server_error() {
            tracing::error!(error = ?err, "request failed");
        } else {
            tracing::debug!(error = %err, "request rejected");
        }
        AppError::new(status, err.to_string())
    }
}
