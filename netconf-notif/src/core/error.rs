use thiserror::Error;

/// Main error type for notification subsystem operations
#[derive(Debug, Error)]
pub enum NtfError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("stream not found: {0}")]
    NotFound(String),

    #[error("stream already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("storage I/O error: {0}")]
    StorageIo(String),

    #[error("event bus error: {0}")]
    BusIo(String),

    #[error("corrupted stream data: {0}")]
    Corrupt(String),

    #[error("no capacity left in allow-rule store for event '{0}'")]
    Exhausted(String),
}

impl From<std::io::Error> for NtfError {
    fn from(e: std::io::Error) -> Self {
        NtfError::StorageIo(e.to_string())
    }
}

/// Result type alias for notification subsystem operations
pub type Result<T> = std::result::Result<T, NtfError>;
