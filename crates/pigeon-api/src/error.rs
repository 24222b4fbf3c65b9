use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Error taxonomy of the engine's boundary operations. Creation races on
/// conversations are resolved internally and never reach this type.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed or policy-violating input; rejected synchronously.
    #[error("{0}")]
    InvalidArgument(String),

    /// A referenced entity does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// A uniqueness constraint was hit (e.g. username taken).
    #[error("{0}")]
    Conflict(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::InvalidArgument(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Self::NotFound(what) => (StatusCode::NOT_FOUND, format!("{} not found", what)),
            Self::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string()),
            Self::Internal(e) => {
                error!("Internal error: {:#}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
