use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("SQLite operation failed: {0}")]
    SQLite(#[from] rusqlite::Error),

    #[error("Remote store operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArg(String),

    #[error("Remote store unavailable: {0}")]
    Unavailable(String),

    #[error("Relay closed: {0}")]
    RelayClosed(String),

    #[error("Interrupted: {0}")]
    Interrupted(String),

    #[error("Background task failed: {0}")]
    TaskFailed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CacheError {
    /// Whether retrying the same remote operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            CacheError::Unavailable(_) => true,
            CacheError::Redis(err) => {
                err.is_timeout()
                    || err.is_connection_dropped()
                    || err.is_connection_refusal()
                    || err.is_io_error()
                    || matches!(
                        err.kind(),
                        redis::ErrorKind::TryAgain | redis::ErrorKind::BusyLoadingError
                    )
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
