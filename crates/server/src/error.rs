//! HTTP error mapping for the REST handlers.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use fg_core::CoreError;
use serde::Serialize;

#[derive(Clone, Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

#[derive(Clone, Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

/// Error returned by every handler.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "invalid_argument",
            Self::Unauthorized(_) => "unauthorized",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Internal(_) => "internal",
        }
    }

    fn into_message(self) -> String {
        match self {
            Self::BadRequest(m)
            | Self::Unauthorized(m)
            | Self::NotFound(m)
            | Self::Conflict(m)
            | Self::Internal(m) => m,
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        let message = err.to_string();
        match err {
            CoreError::Validation(_) | CoreError::AdmissionDenied { .. } | CoreError::Config(_) => {
                Self::BadRequest(message)
            }
            CoreError::InvalidSignature(_) => Self::Unauthorized(message),
            CoreError::ProcessNotFound(_)
            | CoreError::CheckpointNotFound(_)
            | CoreError::RepositoryNotFound(_) => Self::NotFound(message),
            CoreError::NotResumable { .. }
            | CoreError::InvalidTransition { .. }
            | CoreError::RestoreNotAllowed(_) => Self::Conflict(message),
            CoreError::Worker(_) | CoreError::Persistence(_) => Self::Internal(message),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(%status, "Request failed: {self:?}");
        } else {
            tracing::debug!(%status, "Request rejected: {self:?}");
        }
        let body = ErrorEnvelope {
            error: ErrorBody {
                code: self.code(),
                message: self.into_message(),
            },
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fg_protocol::process_models::ProcessStatus;
    use uuid::Uuid;

    #[test]
    fn test_core_errors_map_to_status_codes() {
        let id = Uuid::new_v4();
        let cases = [
            (CoreError::Validation("archive: ../x".to_string()), StatusCode::BAD_REQUEST),
            (CoreError::InvalidSignature("mismatch".to_string()), StatusCode::UNAUTHORIZED),
            (CoreError::ProcessNotFound(id), StatusCode::NOT_FOUND),
            (CoreError::CheckpointNotFound(id), StatusCode::NOT_FOUND),
            (
                CoreError::RestoreNotAllowed(ProcessStatus::Running),
                StatusCode::CONFLICT,
            ),
            (
                CoreError::NotResumable {
                    id,
                    reason: "not suspended".to_string(),
                },
                StatusCode::CONFLICT,
            ),
            (CoreError::Persistence("disk full".to_string()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status(), expected);
        }
    }

    #[test]
    fn test_validation_message_is_kept() {
        let err = ApiError::from(CoreError::Validation("resources: /etc/passwd".to_string()));
        match err {
            ApiError::BadRequest(message) => assert!(message.contains("/etc/passwd")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
