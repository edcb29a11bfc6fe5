use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application-wide error type.
///
/// Variants map either to an HTTP status (for the REST surface) or to a
/// WebSocket `error{code,message}` frame (for the gateway surface) via
/// [`AppError::ws_code`]. A single enum is kept for both surfaces so error
/// classification logic isn't duplicated.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Storage layer is temporarily unavailable. Always retryable by the
    /// caller — never a sign of a logic error. The in-memory store never
    /// produces this variant; it exists for a future durable backend.
    #[error("storage unavailable")]
    StorageUnavailable,

    #[error("internal error")]
    Internal,
}

impl AppError {
    /// The `code` string used in a WebSocket `error{code,message}` frame.
    pub fn ws_code(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "no_session",
            AppError::Conflict(_) => "conflict",
            AppError::Validation(_) => "invalid_input",
            AppError::Forbidden(_) => "not_participant",
            AppError::StorageUnavailable => "internal_retry",
            AppError::Internal => "internal_error",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message): (StatusCode, String) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            AppError::StorageUnavailable => {
                tracing::warn!("storage unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "storage unavailable".into(),
                )
            }
            AppError::Internal => {
                tracing::error!("internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".into(),
                )
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_no_session_ws_code() {
        assert_eq!(AppError::NotFound("x".into()).ws_code(), "no_session");
    }

    #[test]
    fn forbidden_maps_to_not_participant_ws_code() {
        assert_eq!(AppError::Forbidden("x".into()).ws_code(), "not_participant");
    }

    #[test]
    fn storage_unavailable_maps_to_internal_retry() {
        assert_eq!(AppError::StorageUnavailable.ws_code(), "internal_retry");
    }

    #[tokio::test]
    async fn validation_error_returns_400() {
        let response = AppError::Validation("bad".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn not_found_returns_404() {
        let response = AppError::NotFound("missing".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn internal_returns_500() {
        let response = AppError::Internal.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
