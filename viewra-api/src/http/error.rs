// HTTP error handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type for HTTP handlers
pub type AppResult<T> = Result<T, AppError>;

/// Application error with HTTP status code
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn unsupported_media(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNSUPPORTED_MEDIA_TYPE, message)
    }

    pub fn range_not_satisfiable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::RANGE_NOT_SATISFIABLE, message)
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

impl std::error::Error for AppError {}

/// Error response JSON structure
#[derive(Debug, Serialize, Deserialize)]
struct ErrorResponse {
    error: String,
    status: u16,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = Json(ErrorResponse {
            error: self.message,
            status: status.as_u16(),
        });

        (status, body).into_response()
    }
}

/// Convert `viewra_core` errors to HTTP errors
impl From<viewra_core::Error> for AppError {
    fn from(err: viewra_core::Error) -> Self {
        use viewra_core::Error;

        match err {
            Error::NotFound(msg) => Self::not_found(msg),
            Error::Validation(msg) => Self::bad_request(msg),
            Error::Unsupported(msg) => Self::unsupported_media(msg),
            Error::Conflict(msg) => Self::conflict(msg),
            Error::Transient(msg) => {
                tracing::error!("Transient error: {}", msg);
                Self::internal_server_error(msg)
            }
            Error::Fatal(msg) => {
                tracing::error!("Fatal error: {}", msg);
                Self::service_unavailable("Transcoding subsystem unavailable")
            }
            Error::Io(e) => {
                tracing::error!("I/O error: {}", e);
                Self::internal_server_error("I/O error")
            }
            Error::Serialization(e) => {
                tracing::error!("Serialization error: {}", e);
                Self::internal_server_error("Data processing error")
            }
        }
    }
}

/// Convert anyhow errors to HTTP errors
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!("Anyhow error: {}", err);
        Self::internal_server_error("Internal server error")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_error_kinds_map_to_statuses() {
        let cases = [
            (
                viewra_core::Error::NotFound("x".into()),
                StatusCode::NOT_FOUND,
            ),
            (
                viewra_core::Error::Validation("x".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                viewra_core::Error::Unsupported("x".into()),
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ),
            (
                viewra_core::Error::Conflict("x".into()),
                StatusCode::CONFLICT,
            ),
            (
                viewra_core::Error::Transient("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                viewra_core::Error::Fatal("x".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }
}
