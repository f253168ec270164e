//! Error types for the processing engine.

use thiserror::Error;
use uuid::Uuid;

use crate::config::ConfigurationError;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProcessingError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Store error: {0}")]
    StoreError(String),
    #[error("Invalid status model: {0}")]
    InvalidStatusModel(String),
    #[error("Unknown status: {0}")]
    UnknownStatus(String),
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Timeout error: {0}")]
    Timeout(String),
    #[error("Processable object {0} not found")]
    ObjectNotFound(Uuid),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for ProcessingError {
    fn from(err: sqlx::Error) -> Self {
        ProcessingError::DatabaseError(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for ProcessingError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        ProcessingError::DatabaseError(format!("Migration failed: {err}"))
    }
}

impl From<ConfigurationError> for ProcessingError {
    fn from(err: ConfigurationError) -> Self {
        ProcessingError::ConfigurationError(err.to_string())
    }
}

impl From<serde_json::Error> for ProcessingError {
    fn from(err: serde_json::Error) -> Self {
        ProcessingError::StoreError(format!("JSON serialization error: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, ProcessingError>;
