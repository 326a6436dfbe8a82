//! Blob storage used to persist collections.
//!
//! A [`Storage`] is a flat namespace of named byte streams. Collections write
//! their manifest and item log through it and never touch the filesystem
//! directly, so the in-memory and file backends are interchangeable.
//!
//! # Module Structure
//!
//! - `memory`: in-process backend for tests and ephemeral collections
//! - `file`: directory-backed backend

pub mod file;
pub mod memory;

use std::io::{Read, Write};

use thiserror::Error;

use crate::error::{AnchorageError, Result};

pub use self::file::{FileInput, FileOutput, FileStorage};
pub use self::memory::{MemoryInput, MemoryOutput, MemoryStorage};

/// Storage backend settings.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Buffer size for file I/O.
    pub buffer_size: usize,
    /// `fsync` on every close.
    pub sync_writes: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            buffer_size: 64 * 1024,
            sync_writes: true,
        }
    }
}

/// Flat namespace of named byte streams.
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Open a stream for reading.
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>>;

    /// Create (or truncate) a stream for writing. Content becomes visible
    /// once the output is closed.
    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>>;

    fn file_exists(&self, name: &str) -> bool;

    /// Delete a stream; deleting a missing one is not an error.
    fn delete_file(&self, name: &str) -> Result<()>;

    /// Names of all streams, sorted.
    fn list_files(&self) -> Result<Vec<String>>;

    fn file_size(&self, name: &str) -> Result<u64>;

    /// Replace `new_name` with `old_name`.
    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()>;
}

pub trait StorageInput: Read + Send + std::fmt::Debug {
    fn size(&self) -> u64;
}

pub trait StorageOutput: Write + Send + std::fmt::Debug {
    /// Bytes written so far.
    fn position(&self) -> u64;

    /// Flush, sync and publish the stream.
    fn close(&mut self) -> Result<()>;
}

/// Errors raised by storage backends.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Invalid file name: {0}")]
    InvalidName(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Output already closed: {0}")]
    Closed(String),
}

impl From<StorageError> for AnchorageError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::FileNotFound(name) => AnchorageError::not_found(name),
            other => AnchorageError::storage(other.to_string()),
        }
    }
}

/// Reject names that could escape a flat namespace.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
    {
        return Err(StorageError::InvalidName(name.to_string()).into());
    }
    Ok(())
}

/// Read a whole stream.
pub fn read_all(storage: &dyn Storage, name: &str) -> Result<Vec<u8>> {
    let mut input = storage.open_input(name)?;
    let mut bytes = Vec::with_capacity(input.size() as usize);
    input.read_to_end(&mut bytes)?;
    Ok(bytes)
}

/// Write `bytes` to a temporary stream and rename it over `name`.
pub fn write_atomic(storage: &dyn Storage, name: &str, bytes: &[u8]) -> Result<()> {
    let temp = format!("{name}.tmp");
    let mut output = storage.create_output(&temp)?;
    output.write_all(bytes)?;
    output.close()?;
    storage.rename_file(&temp, name)
}
