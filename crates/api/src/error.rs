//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use orchestrator::OrchestrationError;
use thiserror::Error;

/// Message returned for failures the caller cannot act on.
pub const INTERNAL_ERROR_MESSAGE: &str = "An internal error occurred.";

/// API-level error type that maps to HTTP responses.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found.
    #[error("{0}")]
    NotFound(String),
    /// Bad request from the client.
    #[error("{0}")]
    BadRequest(String),
    /// The request conflicts with the resource's current state.
    #[error("{0}")]
    Conflict(String),
    /// Orchestration error.
    #[error(transparent)]
    Orchestration(#[from] OrchestrationError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Orchestration(err) => orchestration_error_to_response(err),
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn orchestration_error_to_response(err: OrchestrationError) -> (StatusCode, String) {
    match &err {
        OrchestrationError::InstanceNotFound(_) => (StatusCode::NOT_FOUND, err.to_string()),
        _ => {
            tracing::error!(error = %err, "internal server error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                INTERNAL_ERROR_MESSAGE.to_string(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::InstanceId;

    #[test]
    fn test_status_codes() {
        let cases = [
            (ApiError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (ApiError::BadRequest("x".into()), StatusCode::BAD_REQUEST),
            (ApiError::Conflict("x".into()), StatusCode::CONFLICT),
            (
                ApiError::Orchestration(OrchestrationError::InstanceNotFound(InstanceId::new())),
                StatusCode::NOT_FOUND,
            ),
            (
                ApiError::Orchestration(OrchestrationError::WorkerPoolClosed),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(error.into_response().status(), expected);
        }
    }
}
