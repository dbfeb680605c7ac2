use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// The error kinds named in the core's error-handling design. Each variant
/// maps to exactly one HTTP status when it surfaces through the sync
/// surface; peer-pull errors are recovered locally by the scheduler and
/// never reach a handler.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    #[error("storage error: {0}")]
    StorageError(#[from] sqlx::Error),

    #[error("report conflict for id {id}: peer contents differ from stored contents")]
    ReportConflict { id: String },

    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("peer protocol error: {0}")]
    PeerProtocolError(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

impl CoreError {
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::ConfigurationError(_) => "ConfigurationError",
            CoreError::StorageError(_) => "StorageError",
            CoreError::ReportConflict { .. } => "ReportConflict",
            CoreError::PeerUnreachable(_) => "PeerUnreachable",
            CoreError::PeerProtocolError(_) => "PeerProtocolError",
            CoreError::InvalidParameter(_) => "InvalidParameter",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            CoreError::InvalidParameter(_) => StatusCode::BAD_REQUEST,
            CoreError::ReportConflict { .. } => StatusCode::CONFLICT,
            CoreError::ConfigurationError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::StorageError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::PeerUnreachable(_) => StatusCode::BAD_GATEWAY,
            CoreError::PeerProtocolError(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "status": "error",
            "data": null,
            "message": self.to_string(),
            "error_kind": self.kind(),
        }));
        (status, body).into_response()
    }
}
