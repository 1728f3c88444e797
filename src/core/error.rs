use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Unreadable history: a record or state value that cannot be decoded.
    #[error("Corrupted data: {0}")]
    Corruption(String),

    /// A processing or migration bug left the state inconsistent.
    #[error("Consistency violation: {0}")]
    Consistency(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Backup error: {0}")]
    Backup(String),

    #[error("Partition {0} is unavailable")]
    PartitionUnavailable(u32),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("I/O error: {0}")]
    IoError(String),
}

impl EngineError {
    /// Corruption and consistency violations halt the partition; nothing else does.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Corruption(_) | EngineError::Consistency(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl<T> From<std::sync::PoisonError<T>> for EngineError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(EngineError::Corruption("bad frame".into()).is_fatal());
        assert!(EngineError::Consistency("dangling key".into()).is_fatal());
        assert!(!EngineError::IoError("disk full".into()).is_fatal());
        assert!(!EngineError::PartitionUnavailable(2).is_fatal());
    }
}
