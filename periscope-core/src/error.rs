// Error types for the Periscope receiver
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReceiverError {
    #[error("apm upstream error: {0}")]
    ApmUpstream(String),

    #[error("{0}")]
    SemanticDrop(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("storage error: {0}")]
    Storage(#[from] clickhouse::error::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("other error: {0}")]
    Other(String),
}

impl From<&str> for ReceiverError {
    fn from(err: &str) -> Self {
        ReceiverError::Other(err.to_string())
    }
}

/// Outcome of a failed report task: transient upstream failures re-enter the
/// retry queue, everything else becomes a drop-report immediately.
#[derive(Debug)]
pub enum TaskError {
    Retry(ReceiverError),
    Drop(ReceiverError),
}

impl TaskError {
    pub fn message(&self) -> String {
        match self {
            TaskError::Retry(err) => err.to_string(),
            TaskError::Drop(err) => err.to_string(),
        }
    }

    pub fn should_retry(&self) -> bool {
        matches!(self, TaskError::Retry(_))
    }
}
