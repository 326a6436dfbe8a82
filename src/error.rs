//! Error types for the Anchorage library.
//!
//! All fallible operations return [`Result`], whose error side is the
//! [`AnchorageError`] enum.
//!
//! # Examples
//!
//! ```
//! use anchorage::error::{AnchorageError, Result};
//!
//! fn example_operation() -> Result<()> {
//!     Err(AnchorageError::invalid_argument("Invalid input"))
//! }
//!
//! match example_operation() {
//!     Ok(_) => println!("Success"),
//!     Err(e) => eprintln!("Error: {}", e),
//! }
//! ```

use std::io;

use thiserror::Error;

/// The main error type for Anchorage operations.
#[derive(Error, Debug)]
pub enum AnchorageError {
    /// I/O errors (file operations, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Two vectors (or a vector and a structure) disagree on dimension.
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// A coordinate was projected against an anchor set that is no longer current.
    #[error("Stale coordinate: projected against anchor version {actual}, index is at {expected}")]
    StaleCoordinate { expected: u64, actual: u64 },

    /// Index-related errors
    #[error("Index error: {0}")]
    Index(String),

    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid argument passed to an operation
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Requested entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error for other cases
    #[error("Error: {0}")]
    Other(String),

    /// Generic anyhow error
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Result type alias for operations that may fail with AnchorageError.
pub type Result<T> = std::result::Result<T, AnchorageError>;

impl AnchorageError {
    /// Create a new dimension mismatch error.
    pub fn dimension_mismatch(expected: usize, actual: usize) -> Self {
        AnchorageError::DimensionMismatch { expected, actual }
    }

    /// Create a new index error.
    pub fn index<S: Into<String>>(msg: S) -> Self {
        AnchorageError::Index(msg.into())
    }

    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        AnchorageError::Storage(msg.into())
    }

    /// Create a new invalid argument error.
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        AnchorageError::InvalidArgument(msg.into())
    }

    /// Create a new invalid config error.
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        AnchorageError::InvalidConfig(msg.into())
    }

    /// Create a new not found error.
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        AnchorageError::NotFound(msg.into())
    }

    /// Create a new serialization error.
    pub fn serialization<S: Into<String>>(msg: S) -> Self {
        AnchorageError::Serialization(msg.into())
    }

    /// Create a new generic error.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        AnchorageError::Other(msg.into())
    }
}

impl From<bincode::Error> for AnchorageError {
    fn from(err: bincode::Error) -> Self {
        AnchorageError::Serialization(err.to_string())
    }
}

/// Fail with [`AnchorageError::DimensionMismatch`] unless `actual == expected`.
pub fn ensure_dimension(expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(AnchorageError::dimension_mismatch(expected, actual));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_construction() {
        let error = AnchorageError::index("Test index error");
        assert_eq!(error.to_string(), "Index error: Test index error");

        let error = AnchorageError::dimension_mismatch(3, 4);
        assert_eq!(error.to_string(), "Dimension mismatch: expected 3, got 4");

        let error = AnchorageError::StaleCoordinate {
            expected: 2,
            actual: 1,
        };
        assert!(error.to_string().contains("anchor version 1"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let error = AnchorageError::from(io_error);

        match error {
            AnchorageError::Io(_) => {}
            _ => panic!("Expected IO error variant"),
        }
    }

    #[test]
    fn test_ensure_dimension() {
        assert!(ensure_dimension(4, 4).is_ok());
        assert!(matches!(
            ensure_dimension(4, 5),
            Err(AnchorageError::DimensionMismatch {
                expected: 4,
                actual: 5
            })
        ));
    }
}
