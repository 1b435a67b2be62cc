use thiserror::Error;

/// Main error type for suffix array operations
#[derive(Error, Debug)]
pub enum SaptError {
    #[error("Index error: {0}")]
    Index(String),

    #[error("Index corruption: {0}")]
    Corruption(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

/// Result type alias for suffix array operations
pub type Result<T> = std::result::Result<T, SaptError>;

impl From<fjall::Error> for SaptError {
    fn from(err: fjall::Error) -> Self {
        SaptError::Index(err.to_string())
    }
}

impl SaptError {
    pub(crate) fn corruption(msg: impl Into<String>) -> Self {
        SaptError::Corruption(msg.into())
    }

    /// Key-value engine failures and detected corruption are both index errors
    pub fn is_index_error(&self) -> bool {
        matches!(self, SaptError::Index(_) | SaptError::Corruption(_))
    }

    pub fn is_storage_error(&self) -> bool {
        matches!(self, SaptError::Storage(_))
    }

    /// Corruption can't be recovered by retrying; the owning task must stop
    pub fn is_fatal(&self) -> bool {
        matches!(self, SaptError::Corruption(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SaptError::InvalidArgument("Invalid model path: /nope".to_string());
        assert_eq!(err.to_string(), "Invalid argument: Invalid model path: /nope");
    }

    #[test]
    fn test_error_classes() {
        assert!(SaptError::Index("x".into()).is_index_error());
        assert!(SaptError::Corruption("x".into()).is_index_error());
        assert!(SaptError::Corruption("x".into()).is_fatal());
        assert!(!SaptError::Index("x".into()).is_fatal());
        assert!(SaptError::Storage("x".into()).is_storage_error());
        assert!(!SaptError::Storage("x".into()).is_index_error());
    }
}
