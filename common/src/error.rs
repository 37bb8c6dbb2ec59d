use std::time::Duration;

use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Lease conflict: {0}")]
    LeaseConflict(String),
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
    #[error("Handler error: {0}")]
    Handler(String),
    #[error("Task timed out after {0:?}")]
    Timeout(Duration),
    #[error("Pipeline stage '{stage}' failed: {message}")]
    PipelineStage { stage: &'static str, message: String },
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Config source error: {0}")]
    ConfigSource(#[from] config::ConfigError),
    #[error("OpenAI error: {0}")]
    OpenAI(#[from] OpenAIError),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

impl AppError {
    pub fn stage(stage: &'static str, err: impl std::fmt::Display) -> Self {
        Self::PipelineStage {
            stage,
            message: err.to_string(),
        }
    }

    /// Errors that must not be retried: the same input will fail the same way.
    pub fn is_permanent(&self) -> bool {
        matches!(self, AppError::Validation(_) | AppError::Config(_))
    }

    /// Store-level write-write collisions between concurrent transactions.
    pub fn is_conflict(&self) -> bool {
        match self {
            AppError::LeaseConflict(_) => true,
            AppError::Database(err) => is_transaction_conflict(err),
            _ => false,
        }
    }
}

pub fn is_transaction_conflict(error: &surrealdb::Error) -> bool {
    let message = error.to_string();
    message.contains("read or write conflict") || message.contains("can be retried")
}
