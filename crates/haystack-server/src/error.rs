//! Shared API error type for HTTP handlers.

use axum::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use haystack::{ErrorKind, HaystackError};

use crate::state::ErrorResponse;

/// Application error type surfaced by handlers.
#[derive(Debug)]
pub enum AppError {
    Haystack(HaystackError),
    /// Request body was well-formed JSON but not a valid request
    BadRequest(String),
    /// Blocking task failed to complete
    Internal(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Haystack(e) => match e.kind() {
                ErrorKind::InvalidArgument
                | ErrorKind::InvalidOperation
                | ErrorKind::InvalidState => StatusCode::BAD_REQUEST,
                ErrorKind::UnknownRecord | ErrorKind::UnknownWatch => StatusCode::NOT_FOUND,
                ErrorKind::NotImplemented => StatusCode::NOT_IMPLEMENTED,
            },
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Haystack(e) => e.kind().as_str(),
            Self::BadRequest(_) => "invalidArgument",
            Self::Internal(_) => "internal",
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Haystack(e) => write!(f, "{e}"),
            Self::BadRequest(msg) | Self::Internal(msg) => f.write_str(msg),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        (
            self.status(),
            Json(ErrorResponse {
                error: self.to_string(),
                kind: self.kind().to_string(),
            }),
        )
            .into_response()
    }
}

impl From<HaystackError> for AppError {
    fn from(e: HaystackError) -> Self {
        AppError::Haystack(e)
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(e: tokio::task::JoinError) -> Self {
        AppError::Internal(format!("task failed: {e}"))
    }
}
