//! Error types for the mail tracking service
//!
//! `StoreError` comes out of the persistence layer, `AppError` is what the
//! HTTP surface renders.
use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Corrupt row: {0}")]
    CorruptRow(String),
}

/// Why a webhook call was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Credentials are missing from the service configuration
    #[error("webhook credentials are not configured")]
    NotConfigured,

    /// Header missing, malformed, or not matching
    #[error("invalid webhook credentials")]
    InvalidCredentials,
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Unauthorized: {0}")]
    Unauthorized(#[from] AuthError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    status: u16,
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let (error, message) = match self {
            AppError::Unauthorized(_) => ("authentication_error", self.to_string()),
            AppError::NotFound(_) => ("not_found_error", self.to_string()),
            // Don't leak internal details
            AppError::Store(_) => ("server_error", "Internal server error".to_string()),
        };

        let mut builder = HttpResponse::build(status);
        if matches!(self, AppError::Unauthorized(_)) {
            builder.insert_header(("WWW-Authenticate", "Basic realm=\"mail-webhooks\""));
        }
        builder.json(ErrorBody {
            error,
            message,
            status: status.as_u16(),
        })
    }
}
