use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use fleet_common::codes;
use fleet_common::protocol::ErrorBody;

use crate::error::{DispatchError, LedgerError};

/// Non-2xx response with an [`ErrorBody`].
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: codes::NOT_FOUND,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: codes::VALIDATION_FAILED,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal",
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            code: self.code.to_string(),
            message: self.message,
        });
        (self.status, body).into_response()
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        let status = match &err {
            DispatchError::AgentNotFound(_) | DispatchError::TaskNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            DispatchError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            DispatchError::TaskNotOwned { .. } => StatusCode::CONFLICT,
            DispatchError::ValidationFailed(_) => StatusCode::BAD_REQUEST,
        };
        Self {
            status,
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        if err.is_persistence() {
            tracing::error!(error = %err, "admin write not persisted");
            Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                code: codes::PERSISTENCE_FAILED,
                message: err.to_string(),
            }
        } else {
            Self {
                status: StatusCode::CONFLICT,
                code: codes::VALIDATION_FAILED,
                message: err.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_errors_map_to_distinct_statuses() {
        let cases = [
            (DispatchError::AgentNotFound("a".into()), StatusCode::NOT_FOUND),
            (DispatchError::Unauthenticated("a".into()), StatusCode::UNAUTHORIZED),
            (
                DispatchError::ValidationFailed("x".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                DispatchError::TaskNotOwned {
                    task_id: "t".into(),
                    agent_id: "a".into(),
                },
                StatusCode::CONFLICT,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }
    }

    #[test]
    fn persistence_failure_is_internal_error() {
        let err = LedgerError::Write {
            path: "/nope/tasks.json".into(),
            source: std::io::Error::other("disk full"),
        };
        let api = ApiError::from(err);
        assert_eq!(api.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(api.code, codes::PERSISTENCE_FAILED);
    }
}
