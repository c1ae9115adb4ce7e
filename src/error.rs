use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::fmt::Display;

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

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    /// The control surface's one bespoke rejection: a mutating call from a
    /// session that isn't the current controller.
    pub fn control_locked() -> Self {
        Self::new(StatusCode::FORBIDDEN, "control locked")
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, axum::Json(json!({ "error": self.message }))).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

pub fn internal_error(err: impl Display) -> (StatusCode, String) {
    tracing::error!(error = %err, "internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "Internal server error".to_string(),
    )
}

pub fn map_db_error(err: sqlx::Error) -> (StatusCode, String) {
    let status = match &err {
        sqlx::Error::RowNotFound => StatusCode::NOT_FOUND,
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("23505") => StatusCode::CONFLICT,    // unique_violation
            Some("23503") => StatusCode::BAD_REQUEST, // foreign_key_violation
            Some("23502") => StatusCode::BAD_REQUEST, // not_null_violation
            Some("22P02") => StatusCode::BAD_REQUEST, // invalid_text_representation
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    tracing::error!(error = %err, status = %status, "database error");

    let message = match status {
        StatusCode::NOT_FOUND => "Resource not found",
        StatusCode::CONFLICT => "Resource already exists",
        StatusCode::BAD_REQUEST => "Invalid request",
        _ => "Database error",
    };

    (status, message.to_string())
}

/// Errors crossing the storage port. Adapters (postgres/sqlite/clickhouse/memory)
/// wrap their own driver errors into this small, stable set so the engine
/// never has to match on a driver type.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("empty sensor set")]
    EmptySensorSet,
    #[error("storage transport error: {0}")]
    Transport(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::Transport(err.to_string())
    }
}

impl From<clickhouse::error::Error> for StorageError {
    fn from(err: clickhouse::error::Error) -> Self {
        StorageError::Transport(err.to_string())
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::EmptySensorSet => AppError::bad_request("empty sensor set"),
            StorageError::Transport(msg) => {
                tracing::error!(error = %msg, "storage transport error");
                AppError::internal("storage error")
            }
        }
    }
}

/// Errors crossing the output port. The engine treats any of these as fatal
/// for the job in progress; see the job failure semantics.
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("output transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for OutputError {
    fn from(err: reqwest::Error) -> Self {
        OutputError::Transport(err.to_string())
    }
}
