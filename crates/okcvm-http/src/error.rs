//! HTTP error taxonomy (§7) — maps each component's typed error into the
//! status codes the spec names, the same "typed internal error, mapped once
//! at the edge" shape the teacher reaches for `anyhow`+`bail!` to express
//! without a dedicated HTTP layer.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    PayloadTooLarge(String),
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            ApiError::PayloadTooLarge(m) => (StatusCode::PAYLOAD_TOO_LARGE, m.clone()),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m.clone()),
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %message, "request failed");
        }
        (status, axum::Json(json!({ "error": message }))).into_response()
    }
}

impl From<okcvm_session::SessionError> for ApiError {
    fn from(err: okcvm_session::SessionError) -> Self {
        use okcvm_session::SessionError;
        match err {
            SessionError::Workspace(e) => match e {
                okcvm_workspace::WorkspaceError::PathEscape(_) => ApiError::BadRequest(e.to_string()),
                okcvm_workspace::WorkspaceError::Io(_) => ApiError::Internal(e.to_string()),
            },
            SessionError::Git(e) => match e {
                okcvm_git::GitError::Disabled | okcvm_git::GitError::UnknownSnapshot(_) => ApiError::BadRequest(e.to_string()),
                okcvm_git::GitError::CommandFailed(_) | okcvm_git::GitError::Io(_) => ApiError::Internal(e.to_string()),
            },
            SessionError::Llm(e) => ApiError::Internal(e.to_string()),
            SessionError::Io(e) => ApiError::Internal(e.to_string()),
            SessionError::UploadTooLarge { .. } => ApiError::PayloadTooLarge(err.to_string()),
            SessionError::UploadLimitExceeded | SessionError::DuplicateUpload(_) => ApiError::BadRequest(err.to_string()),
        }
    }
}

impl From<okcvm_store::PersistenceError> for ApiError {
    fn from(err: okcvm_store::PersistenceError) -> Self {
        use okcvm_store::PersistenceError;
        match err {
            PersistenceError::ClientMismatch { .. } => {
                tracing::warn!(error = %err, "rejected cross-client conversation rebind");
                ApiError::Internal(err.to_string())
            }
            PersistenceError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            PersistenceError::Database(_) | PersistenceError::Serialization(_) | PersistenceError::Task(_) => {
                ApiError::Internal(err.to_string())
            }
        }
    }
}
