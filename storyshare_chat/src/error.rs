use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Failures surfaced by the messaging operations.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Authorization(String),
    #[error("{0}")]
    NotFound(String),
    #[error("upload failed ({0}); retry sending the message")]
    Upload(String),
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type ChatResult<T> = Result<T, ChatError>;

impl ChatError {
    pub fn kind(&self) -> &'static str {
        match self {
            ChatError::Validation(_) => "validation",
            ChatError::Authorization(_) => "authorization",
            ChatError::NotFound(_) => "not_found",
            ChatError::Upload(_) => "upload",
            ChatError::Unauthenticated => "unauthenticated",
            ChatError::Database(_) | ChatError::Pool(_) | ChatError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ChatError::Validation(_) => StatusCode::BAD_REQUEST,
            ChatError::Authorization(_) => StatusCode::FORBIDDEN,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::Upload(_) => StatusCode::BAD_GATEWAY,
            ChatError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ChatError::Database(_) | ChatError::Pool(_) | ChatError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<tokio::task::JoinError> for ChatError {
    fn from(e: tokio::task::JoinError) -> Self {
        ChatError::Internal(e.to_string())
    }
}

impl From<JsonRejection> for ChatError {
    fn from(rejection: JsonRejection) -> Self {
        ChatError::Validation(rejection.body_text())
    }
}

impl From<PathRejection> for ChatError {
    fn from(rejection: PathRejection) -> Self {
        ChatError::Validation(rejection.body_text())
    }
}

impl From<QueryRejection> for ChatError {
    fn from(rejection: QueryRejection) -> Self {
        ChatError::Validation(rejection.body_text())
    }
}

#[derive(Serialize)]
struct ErrorResp {
    kind: &'static str,
    error: String,
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(kind = self.kind(), "{self}");
        }
        let body = ErrorResp {
            kind: self.kind(),
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
