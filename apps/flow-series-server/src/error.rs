use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

/// Failures of a series query, from validation through data access.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SeriesError {
    /// Malformed request; nothing was fetched.
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    /// Reading store or directory failure. Safe to retry.
    #[error("data source error: {0}")]
    DataSource(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("request timed out")]
    TimedOut,
}

impl SeriesError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            SeriesError::Validation(_) => StatusCode::BAD_REQUEST,
            SeriesError::NotFound(_) => StatusCode::NOT_FOUND,
            SeriesError::DataSource(_) => StatusCode::BAD_GATEWAY,
            SeriesError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            SeriesError::TimedOut => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl From<SeriesError> for AppError {
    fn from(err: SeriesError) -> Self {
        let status = err.status();
        if status.is_server_error() {
            tracing::warn!(error = %err, status = %status, "series query failed");
        }
        AppError::new(status, err.to_string())
    }
}

/// Errors raised by the device directory and reading store adapters.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for SeriesError {
    fn from(err: StoreError) -> Self {
        SeriesError::DataSource(err.to_string())
    }
}
