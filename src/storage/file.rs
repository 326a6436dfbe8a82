//! Directory-backed storage.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{AnchorageError, Result};
use crate::storage::{
    Storage, StorageConfig, StorageError, StorageInput, StorageOutput, validate_name,
};

/// Storage that maps each stream to one file in a directory.
#[derive(Debug)]
pub struct FileStorage {
    directory: PathBuf,
    config: StorageConfig,
}

impl FileStorage {
    /// Open `directory`, creating it if needed.
    pub fn new<P: AsRef<Path>>(directory: P, config: StorageConfig) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();
        if !directory.exists() {
            std::fs::create_dir_all(&directory).map_err(|e| {
                AnchorageError::storage(format!(
                    "Failed to create directory {}: {e}",
                    directory.display()
                ))
            })?;
        }
        if !directory.is_dir() {
            return Err(AnchorageError::storage(format!(
                "Path is not a directory: {}",
                directory.display()
            )));
        }
        debug!("opened file storage at {}", directory.display());
        Ok(FileStorage { directory, config })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn file_path(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.directory.join(name))
    }
}

fn io_error(name: &str, e: std::io::Error) -> StorageError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StorageError::FileNotFound(name.to_string())
    } else {
        StorageError::IoError(format!("{name}: {e}"))
    }
}

impl Storage for FileStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        let path = self.file_path(name)?;
        let file = File::open(&path).map_err(|e| io_error(name, e))?;
        let size = file.metadata().map_err(|e| io_error(name, e))?.len();
        Ok(Box::new(FileInput {
            reader: BufReader::with_capacity(self.config.buffer_size, file),
            size,
        }))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        let path = self.file_path(name)?;
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| io_error(name, e))?;
        Ok(Box::new(FileOutput {
            name: name.to_string(),
            writer: Some(BufWriter::with_capacity(self.config.buffer_size, file)),
            sync_writes: self.config.sync_writes,
            position: 0,
        }))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.file_path(name).is_ok_and(|path| path.is_file())
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        let path = self.file_path(name)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(name, e).into()),
        }
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let mut files = Vec::new();
        let entries = std::fs::read_dir(&self.directory)
            .map_err(|e| StorageError::IoError(e.to_string()))?;
        for entry in entries {
            let path = entry.map_err(|e| StorageError::IoError(e.to_string()))?.path();
            if path.is_file()
                && let Some(name) = path.file_name().and_then(|n| n.to_str())
            {
                files.push(name.to_string());
            }
        }
        files.sort();
        Ok(files)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        let path = self.file_path(name)?;
        Ok(path.metadata().map_err(|e| io_error(name, e))?.len())
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        let old_path = self.file_path(old_name)?;
        let new_path = self.file_path(new_name)?;
        std::fs::rename(&old_path, &new_path).map_err(|e| io_error(old_name, e))?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct FileInput {
    reader: BufReader<File>,
    size: u64,
}

impl Read for FileInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

impl StorageInput for FileInput {
    fn size(&self) -> u64 {
        self.size
    }
}

#[derive(Debug)]
pub struct FileOutput {
    name: String,
    writer: Option<BufWriter<File>>,
    sync_writes: bool,
    position: u64,
}

impl Write for FileOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| std::io::Error::other(StorageError::Closed(self.name.clone())))?;
        let written = writer.write(buf)?;
        self.position += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl StorageOutput for FileOutput {
    fn position(&self) -> u64 {
        self.position
    }

    fn close(&mut self) -> Result<()> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };
        writer
            .flush()
            .map_err(|e| AnchorageError::storage(format!("Failed to flush {}: {e}", self.name)))?;
        if self.sync_writes {
            writer
                .get_ref()
                .sync_all()
                .map_err(|e| AnchorageError::storage(format!("Failed to sync {}: {e}", self.name)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::storage::{read_all, write_atomic};

    fn storage() -> (TempDir, FileStorage) {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path(), StorageConfig::default()).unwrap();
        (dir, storage)
    }

    #[test]
    fn test_write_and_read() {
        let (_dir, storage) = storage();
        let mut output = storage.create_output("items.bin").unwrap();
        output.write_all(b"0123456789").unwrap();
        assert_eq!(output.position(), 10);
        output.close().unwrap();
        output.close().unwrap();

        assert!(storage.file_exists("items.bin"));
        assert_eq!(storage.file_size("items.bin").unwrap(), 10);
        assert_eq!(read_all(&storage, "items.bin").unwrap(), b"0123456789");
    }

    #[test]
    fn test_atomic_replace_and_listing() {
        let (_dir, storage) = storage();
        write_atomic(&storage, "manifest.json", b"{}").unwrap();
        write_atomic(&storage, "manifest.json", b"{\"v\":2}").unwrap();
        assert_eq!(storage.list_files().unwrap(), vec!["manifest.json"]);
        assert_eq!(read_all(&storage, "manifest.json").unwrap(), b"{\"v\":2}");

        storage.delete_file("manifest.json").unwrap();
        storage.delete_file("manifest.json").unwrap();
        assert!(storage.list_files().unwrap().is_empty());
    }

    #[test]
    fn test_missing_and_invalid_names() {
        let (_dir, storage) = storage();
        assert!(matches!(
            storage.open_input("nope"),
            Err(AnchorageError::NotFound(_))
        ));
        assert!(storage.create_output("../escape").is_err());
        assert!(!storage.file_exists("../escape"));
    }

    #[test]
    fn test_creates_nested_directory() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b");
        let storage = FileStorage::new(&nested, StorageConfig::default()).unwrap();
        assert_eq!(storage.directory(), nested.as_path());
        assert!(nested.is_dir());
    }
}
