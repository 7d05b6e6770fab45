//! Unified API error handling with structured responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

use crate::agent::AgentError;
use crate::sandbox::files::FileError;
use crate::session::ServiceError;

/// API error type with structured responses.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Gone: {0}")]
    Gone(String),

    #[error("Busy: {0}")]
    Busy(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Gateway error: {0}")]
    BadGateway(String),
}

impl ApiError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Conflict(_) | Self::Busy(_) => StatusCode::CONFLICT,
            Self::Gone(_) => StatusCode::GONE,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BadGateway(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Conflict(_) => "CONFLICT",
            Self::Gone(_) => "GONE",
            Self::Busy(_) => "BUSY",
            Self::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::BadGateway(_) => "BAD_GATEWAY",
        }
    }
}

/// Structured error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
    #[serde(rename = "statusCode")]
    pub status_code: u16,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();

        match &self {
            ApiError::Internal(msg) | ApiError::BadGateway(msg) => {
                error!(error_code = code, message = %msg, "API error");
            }
            ApiError::ServiceUnavailable(msg) => {
                warn!(error_code = code, message = %msg, "Service unavailable");
            }
            _ => {
                tracing::debug!(error_code = code, message = %message, "Client error");
            }
        }

        let body = ErrorResponse {
            error: message,
            code,
            status_code: status.as_u16(),
        };

        (status, Json(body)).into_response()
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::AgentNotFound(what) => ApiError::NotFound(format!("agent {}", what)),
            ServiceError::SessionNotFound(what) => ApiError::NotFound(what),
            ServiceError::InvalidState(msg) => ApiError::BadRequest(msg),
            ServiceError::Gone(what) => ApiError::Gone(what),
            ServiceError::Busy => {
                ApiError::Busy("a message is already streaming for this session".to_string())
            }
            ServiceError::CapacityExceeded => {
                ApiError::ServiceUnavailable("sandbox capacity exceeded".to_string())
            }
            ServiceError::NoRunner => {
                ApiError::ServiceUnavailable("no live runner available".to_string())
            }
            ServiceError::CreateFailed(msg) => {
                ApiError::Internal(format!("sandbox create failed: {}", msg))
            }
            ServiceError::Persistence(msg) => ApiError::Internal(msg),
            ServiceError::BadRequest(msg) => ApiError::BadRequest(msg),
            ServiceError::File(e) => e.into(),
            ServiceError::Agent(e) => e.into(),
            ServiceError::Internal(msg) => ApiError::Internal(msg),
        }
    }
}

impl From<FileError> for ApiError {
    fn from(err: FileError) -> Self {
        match err {
            FileError::NotFound(what) => ApiError::NotFound(what),
            FileError::BadPath(msg) | FileError::IsDirectory(msg) => ApiError::BadRequest(msg),
            FileError::TooLarge(what) => {
                ApiError::BadRequest(format!("file too large to read: {}", what))
            }
            FileError::Io(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<AgentError> for ApiError {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::NotFound(what) => ApiError::NotFound(format!("agent {}", what)),
            AgentError::AlreadyExists(what) => {
                ApiError::Conflict(format!("agent already exists: {}", what))
            }
            AgentError::InvalidBundle(msg) => ApiError::BadRequest(msg),
            AgentError::File(e) => e.into(),
            AgentError::Store(e) => ApiError::Internal(e.to_string()),
            AgentError::Io(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<crate::session::HostError> for ApiError {
    fn from(err: crate::session::HostError) -> Self {
        ApiError::from(ServiceError::from(err))
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ApiError::not_found("").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::Busy(String::new()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(ApiError::Gone(String::new()).status_code(), StatusCode::GONE);
        assert_eq!(
            ApiError::ServiceUnavailable(String::new()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_service_error_mapping() {
        assert!(matches!(
            ApiError::from(ServiceError::Busy),
            ApiError::Busy(_)
        ));
        assert!(matches!(
            ApiError::from(ServiceError::CapacityExceeded),
            ApiError::ServiceUnavailable(_)
        ));
        assert!(matches!(
            ApiError::from(ServiceError::Gone("s".into())),
            ApiError::Gone(_)
        ));
        assert!(matches!(
            ApiError::from(ServiceError::AgentNotFound("a".into())),
            ApiError::NotFound(_)
        ));
    }

    #[test]
    fn test_file_error_mapping() {
        assert!(matches!(
            ApiError::from(FileError::BadPath("..".into())),
            ApiError::BadRequest(_)
        ));
        assert!(matches!(
            ApiError::from(FileError::IsDirectory("d".into())),
            ApiError::BadRequest(_)
        ));
    }
}
