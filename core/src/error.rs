use thiserror::Error;

#[derive(Debug, Error)]
pub enum StrataError {
    #[error("No space left on device: {0}")]
    NoSpace(String),

    #[error("Corrupt or unreadable metadata: {0}")]
    Io(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Directory not empty: {0}")]
    NotEmpty(String),

    #[error("Name too long: {0} bytes")]
    NameTooLong(usize),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl StrataError {
    /// True for both device failures and detected on-disk corruption
    pub fn is_io(&self) -> bool {
        matches!(self, StrataError::Io(_) | StrataError::IoError(_))
    }
}
