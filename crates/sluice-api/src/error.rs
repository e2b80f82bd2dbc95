//! Mapping of domain errors onto HTTP responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use sluice_core::Error;
use tracing::error;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: &'static str,
}

/// An error returned from a handler.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request",
            message: message.into(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let (status, code) = match &err {
            Error::InvalidGraph(_) => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_graph"),
            Error::InvalidTrigger { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_trigger"),
            Error::PipelineNotFound(_) | Error::RunNotFound(_) => {
                (StatusCode::NOT_FOUND, "not_found")
            }
            Error::RunRejected { .. } => (StatusCode::CONFLICT, "run_rejected"),
            Error::RunAlreadyCompleted(_) => (StatusCode::CONFLICT, "run_already_completed"),
            Error::Persistence(_) => (StatusCode::SERVICE_UNAVAILABLE, "persistence_error"),
            Error::Serialization(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        if status.is_server_error() {
            error!(error = %err, "Request failed");
        }
        Self {
            status,
            code,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.message,
            code: self.code,
        };
        (self.status, Json(body)).into_response()
    }
}
