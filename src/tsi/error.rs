//! Index error types
//!
//! Defines all errors that can occur while reading, merging or compacting
//! index files.

use thiserror::Error;

/// Errors that can occur in the index layer
#[derive(Error, Debug)]
pub enum IndexError {
    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Data corruption detected (checksum mismatch, truncated entry, etc.)
    #[error("Corrupt data: {0}")]
    Corruption(String),

    /// File is not a valid index file (bad magic, version, trailer)
    #[error("Invalid index file: {0}")]
    InvalidFile(String),

    /// An encoder was fed keys or ids that are not strictly increasing
    #[error("Out of order: {0}")]
    OutOfOrder(String),

    /// A series referenced by a later pass was never written to the series block
    #[error("Series id not found: {name} {tags}")]
    SeriesIdNotFound { name: String, tags: String },

    /// A measurement reached the measurement block without a written tagset
    #[error("Tagset not found for measurement: {0}")]
    TagSetNotFound(String),
}

impl IndexError {
    /// Whether this error signals a broken internal contract rather than bad
    /// input or a failing device. Such errors must never be retried.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            IndexError::SeriesIdNotFound { .. } | IndexError::TagSetNotFound(_)
        )
    }
}

impl From<bincode::Error> for IndexError {
    fn from(err: bincode::Error) -> Self {
        IndexError::Serialization(err.to_string())
    }
}

/// Result type alias for index operations
pub type IndexResult<T> = Result<T, IndexError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = IndexError::SeriesIdNotFound {
            name: "cpu".to_string(),
            tags: "host=a".to_string(),
        };
        assert_eq!(err.to_string(), "Series id not found: cpu host=a");

        let err = IndexError::InvalidFile("bad magic".to_string());
        assert_eq!(err.to_string(), "Invalid index file: bad magic");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let index_err: IndexError = io_err.into();
        assert!(matches!(index_err, IndexError::Io(_)));
        assert!(!index_err.is_invariant_violation());
    }

    #[test]
    fn test_invariant_violation_classification() {
        let err = IndexError::SeriesIdNotFound {
            name: "mem".to_string(),
            tags: String::new(),
        };
        assert!(err.is_invariant_violation());
        assert!(!IndexError::Corruption("x".into()).is_invariant_violation());
    }
}
