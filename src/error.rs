use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Errors surfaced by the execution core across Builder, Engine, Store, and Runtime.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("environment not found: {0}")]
    NotFound(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("setup failed: {0}")]
    SetupFailed(String),

    #[error("runtime error: {0}")]
    Runtime(#[from] crate::runtime::RuntimeError),

    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            CoreError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            CoreError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            CoreError::Cancelled => {
                (StatusCode::INTERNAL_SERVER_ERROR, "operation cancelled".to_string())
            }
            CoreError::SetupFailed(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            CoreError::Runtime(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            CoreError::Store(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            CoreError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = Json(json!({
            "error": true,
            "message": message,
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
