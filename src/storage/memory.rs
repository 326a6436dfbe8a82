//! In-memory storage backend.

use std::io::{Cursor, Read, Write};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::error::Result;
use crate::storage::{Storage, StorageError, StorageInput, StorageOutput, validate_name};

type Files = Arc<RwLock<AHashMap<String, Arc<[u8]>>>>;

/// Storage that keeps every stream in process memory.
///
/// Clones share the same namespace.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    files: Files,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file_count(&self) -> usize {
        self.files.read().len()
    }

    pub fn total_size(&self) -> u64 {
        self.files.read().values().map(|data| data.len() as u64).sum()
    }

    pub fn clear(&self) {
        self.files.write().clear();
    }
}

impl Storage for MemoryStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        let data = self
            .files
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;
        Ok(Box::new(MemoryInput {
            cursor: Cursor::new(data),
        }))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        validate_name(name)?;
        Ok(Box::new(MemoryOutput {
            name: name.to_string(),
            buffer: Vec::new(),
            files: Arc::clone(&self.files),
            closed: false,
        }))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.files.read().contains_key(name)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.files.write().remove(name);
        Ok(())
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.files.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        self.files
            .read()
            .get(name)
            .map(|data| data.len() as u64)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()).into())
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        validate_name(new_name)?;
        let mut files = self.files.write();
        let data = files
            .remove(old_name)
            .ok_or_else(|| StorageError::FileNotFound(old_name.to_string()))?;
        files.insert(new_name.to_string(), data);
        Ok(())
    }
}

#[derive(Debug)]
pub struct MemoryInput {
    cursor: Cursor<Arc<[u8]>>,
}

impl Read for MemoryInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl StorageInput for MemoryInput {
    fn size(&self) -> u64 {
        self.cursor.get_ref().len() as u64
    }
}

/// Buffers writes and publishes them to the shared namespace on close.
#[derive(Debug)]
pub struct MemoryOutput {
    name: String,
    buffer: Vec<u8>,
    files: Files,
    closed: bool,
}

impl Write for MemoryOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.closed {
            return Err(std::io::Error::other(StorageError::Closed(self.name.clone())));
        }
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl StorageOutput for MemoryOutput {
    fn position(&self) -> u64 {
        self.buffer.len() as u64
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let data: Arc<[u8]> = std::mem::take(&mut self.buffer).into();
        self.files.write().insert(self.name.clone(), data);
        self.closed = true;
        Ok(())
    }
}

impl Drop for MemoryOutput {
    fn drop(&mut self) {
        // Publishing cannot fail for the memory backend.
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_is_visible_after_close() {
        let storage = MemoryStorage::new();
        let mut output = storage.create_output("a").unwrap();
        output.write_all(b"abc").unwrap();
        assert_eq!(output.position(), 3);
        assert!(!storage.file_exists("a"));
        output.close().unwrap();
        assert!(storage.file_exists("a"));
        assert_eq!(storage.file_size("a").unwrap(), 3);
        assert!(output.write_all(b"more").is_err());

        let mut input = storage.open_input("a").unwrap();
        assert_eq!(input.size(), 3);
        let mut bytes = Vec::new();
        input.read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes, b"abc");
    }

    #[test]
    fn test_rename_delete_and_list() {
        let storage = MemoryStorage::new();
        for name in ["b", "a"] {
            let mut output = storage.create_output(name).unwrap();
            output.write_all(name.as_bytes()).unwrap();
            output.close().unwrap();
        }
        assert_eq!(storage.list_files().unwrap(), vec!["a", "b"]);

        storage.rename_file("a", "c").unwrap();
        assert!(!storage.file_exists("a"));
        assert!(storage.rename_file("a", "d").is_err());

        storage.delete_file("b").unwrap();
        storage.delete_file("b").unwrap();
        assert_eq!(storage.list_files().unwrap(), vec!["c"]);
        assert_eq!(storage.total_size(), 1);

        let shared = storage.clone();
        shared.clear();
        assert_eq!(storage.file_count(), 0);
    }

    #[test]
    fn test_missing_file() {
        let storage = MemoryStorage::new();
        assert!(storage.open_input("missing").is_err());
        assert!(storage.file_size("missing").is_err());
        assert!(storage.create_output("../x").is_err());
    }
}
