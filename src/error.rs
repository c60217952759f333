use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Job [{name}] exists with args {args}")]
    JobExists { name: String, args: String },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Usage error: {0}")]
    Usage(String),

    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Task error: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl QueueError {
    pub fn validation(message: impl Into<String>) -> Self {
        QueueError::Validation(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        QueueError::Conflict(message.into())
    }

    /// Whether the error only reports a lost race against another daemon.
    pub fn is_contention(&self) -> bool {
        matches!(self, QueueError::Conflict(_) | QueueError::JobNotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
