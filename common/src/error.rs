use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("Embedding provider error: {0}")]
    OpenAI(#[from] OpenAIError),
    #[error("Messaging error: {0}")]
    Messaging(#[from] lapin::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Business logic error: {0}")]
    BusinessLogic(String),
    #[error("Operation not allowed: {0}")]
    OperationNotAllowed(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

impl AppError {
    /// Whether the failure is worth retrying: infrastructure hiccups are,
    /// domain errors are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::Database(_)
                | AppError::OpenAI(_)
                | AppError::Messaging(_)
                | AppError::Io(_)
        )
    }
}
