//! Gateway error taxonomy and its HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid project name: only letters, digits, '-' and '_' are allowed")]
    InvalidProjectRef,

    #[error("path escapes the project directory")]
    PathTraversal,

    #[error("project not found")]
    ProjectNotFound,

    #[error("not found")]
    NotFound,

    #[error("a project with this name already exists")]
    ProjectExists,

    #[error("file too large (max 10MB)")]
    FileTooLarge,

    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("execution failed: {0}")]
    ExecutionError(String),

    #[error("process timed out after {0} seconds")]
    Timeout(u64),

    #[error("failed to start terminal session: {0}")]
    SessionSpawnError(String),

    #[error("gateway is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidProjectRef
            | Self::PathTraversal
            | Self::FileTooLarge
            | Self::UnsupportedLanguage(_) => StatusCode::BAD_REQUEST,
            Self::ProjectNotFound | Self::NotFound => StatusCode::NOT_FOUND,
            Self::ProjectExists => StatusCode::CONFLICT,
            Self::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Self::ExecutionError(_) | Self::SessionSpawnError(_) | Self::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
