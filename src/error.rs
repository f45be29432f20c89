use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sqlx::migrate::MigrateError;
use thiserror::Error;
use tracing::{error, warn};
use uuid::Uuid;

use crate::api::models::OperationOutcome;

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] MigrateError),

    #[error("{0}")]
    Settlement(#[from] SettlementError),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Reconciliation errors surfaced to callers as human-readable messages
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettlementError {
    #[error("{0}")]
    Validation(String),

    #[error("{entity} {id} was not found.")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("Settlement is {current}; only {expected} settlements can be {action}.")]
    InvalidState {
        current: String,
        expected: String,
        action: &'static str,
    },

    #[error("Expense '{name}' is already settled.")]
    AlreadySettled { expense_id: Uuid, name: String },

    #[error("Expense '{name}' is already included in draft settlement {settlement_id}.")]
    AlreadyClaimed {
        expense_id: Uuid,
        name: String,
        settlement_id: Uuid,
    },

    #[error("Concurrent modification detected: {0}")]
    Conflict(String),
}

impl SettlementError {
    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        SettlementError::NotFound { entity, id }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        SettlementError::Validation(message.into())
    }

    /// Stable machine-readable code for the error kind
    pub fn code(&self) -> &'static str {
        match self {
            SettlementError::Validation(_) => "VALIDATION_ERROR",
            SettlementError::NotFound { .. } => "NOT_FOUND",
            SettlementError::InvalidState { .. } => "INVALID_STATE",
            SettlementError::AlreadySettled { .. } => "ALREADY_SETTLED",
            SettlementError::AlreadyClaimed { .. } => "ALREADY_CLAIMED",
            SettlementError::Conflict(_) => "CONFLICT",
        }
    }
}

impl AppError {
    /// Whether the failed storage write may succeed if attempted again
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Settlement(SettlementError::Conflict(_)) => true,
            AppError::Database(err) => matches!(
                err,
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }

    /// Domain error kind, if this is one
    pub fn as_settlement(&self) -> Option<&SettlementError> {
        match self {
            AppError::Settlement(err) => Some(err),
            _ => None,
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Settlement(err) => {
                let status = match err {
                    SettlementError::Validation(_) => StatusCode::BAD_REQUEST,
                    SettlementError::NotFound { .. } => StatusCode::NOT_FOUND,
                    SettlementError::InvalidState { .. }
                    | SettlementError::AlreadySettled { .. }
                    | SettlementError::AlreadyClaimed { .. }
                    | SettlementError::Conflict(_) => StatusCode::CONFLICT,
                };
                warn!(code = err.code(), "Request rejected: {}", err);
                (status, err.to_string())
            }
            AppError::Database(err) => {
                error!("Database failure: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "A database error occurred".to_string(),
                )
            }
            other => {
                error!("Internal failure: {:?}", other);
                (StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
            }
        };

        let body = Json(OperationOutcome::<()>::failure(vec![message]));
        (status, body).into_response()
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_settled_message() {
        let err = SettlementError::AlreadySettled {
            expense_id: Uuid::nil(),
            name: "Taxi fare".to_string(),
        };
        assert_eq!(err.to_string(), "Expense 'Taxi fare' is already settled.");
        assert_eq!(err.code(), "ALREADY_SETTLED");
    }

    #[test]
    fn test_retryable_errors() {
        assert!(AppError::from(SettlementError::Conflict("x".into())).is_retryable());
        assert!(AppError::from(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!AppError::from(SettlementError::validation("bad")).is_retryable());
        assert!(!AppError::from(sqlx::Error::RowNotFound).is_retryable());
    }

    #[test]
    fn test_status_codes() {
        let response = AppError::from(SettlementError::not_found("Expense", Uuid::nil())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = AppError::from(SettlementError::InvalidState {
            current: "Completed".into(),
            expected: "Draft".into(),
            action: "completed",
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = AppError::Config("DATABASE_URL is not set".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let response = AppError::from(sqlx::Error::PoolClosed).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
