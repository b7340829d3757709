//! API error types with HTTP status mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use leasepool_protocol::OpResult;

use crate::error::Error;

/// API error type with HTTP status code mapping.
///
/// The body is always a failed [`OpResult`], so clients read `rc`, `msg`
/// and `code` the same way for every outcome.
#[derive(Debug)]
pub enum ApiError {
    /// Bad request - invalid input (400).
    BadRequest(String),
    /// Failure reported by the orchestrator.
    Pool(Error),
    /// The task running the operation panicked or was cancelled (500).
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Pool(err) => match err.code() {
                "NOT_FOUND" => StatusCode::NOT_FOUND,
                "UNAUTHORIZED" => StatusCode::FORBIDDEN,
                "PRECONDITION" => StatusCode::CONFLICT,
                "BACKEND" => StatusCode::BAD_GATEWAY,
                "TIMEOUT" => StatusCode::GATEWAY_TIMEOUT,
                "NOT_IMPLEMENTED" => StatusCode::NOT_IMPLEMENTED,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            ApiError::BadRequest(msg) => OpResult::failed(msg.clone(), "BAD_REQUEST"),
            ApiError::Internal(msg) => OpResult::failed(msg.clone(), "INTERNAL"),
            ApiError::Pool(err) => err.to_result(),
        };
        if status.is_server_error() {
            tracing::warn!(status = %status, msg = %body.msg, "request failed");
        } else {
            tracing::debug!(status = %status, msg = %body.msg, "request rejected");
        }
        (status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError::Pool(err)
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        ApiError::Internal(format!("operation task failed: {}", err))
    }
}

/// Reject a request whose required string field is blank.
pub(crate) fn require(field: &str, value: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::BadRequest(format!("{} cannot be empty", field)));
    }
    Ok(())
}
