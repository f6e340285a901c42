use actix_identity::error::{GetIdentityError, LoginError};
use actix_session::{SessionGetError, SessionInsertError};
use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use thiserror::Error;

use crate::backend::BackendError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Backend error: {0}")]
    BackendError(#[from] BackendError),

    #[error("Template error: {0}")]
    TemplateError(#[from] tera::Error),

    #[error("Session read error: {0}")]
    SessionGetError(#[from] SessionGetError),

    #[error("Session write error: {0}")]
    SessionInsertError(#[from] SessionInsertError),

    #[error("Identity error: {0}")]
    IdentityError(#[from] GetIdentityError),

    #[error("Login error: {0}")]
    LoginError(#[from] LoginError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Protected page requested without an active session.
    #[error("Login required")]
    LoginRequired,

    #[error("Internal server error")]
    InternalServerError,
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::LoginRequired => StatusCode::SEE_OTHER,
            AppError::BackendError(BackendError::Unauthorized) => StatusCode::UNAUTHORIZED,
            AppError::BackendError(_)
            | AppError::TemplateError(_)
            | AppError::SessionGetError(_)
            | AppError::SessionInsertError(_)
            | AppError::IdentityError(_)
            | AppError::LoginError(_)
            | AppError::ConfigError(_)
            | AppError::IoError(_)
            | AppError::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        match self {
            AppError::LoginRequired => HttpResponse::SeeOther()
                .append_header(("Location", "/login"))
                .finish(),
            _ => HttpResponse::build(self.status_code()).body(self.to_string()),
        }
    }
}

impl From<AppError> for std::io::Error {
    fn from(err: AppError) -> Self {
        std::io::Error::new(std::io::ErrorKind::Other, err.to_string())
    }
}
