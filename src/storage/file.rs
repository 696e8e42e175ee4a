//! File-system backed directory, used as the local segment cache.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StratusError};
use crate::storage::lock::{LocalLock, LockRegistry};
use crate::storage::{Directory, IndexInput, IndexOutput, Lock, to_millis};

/// Configuration for [`FsDirectory`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsDirectoryConfig {
    /// Root path of the directory.
    pub path: PathBuf,

    /// Buffer size for I/O operations.
    pub buffer_size: usize,

    /// Whether to sync every write immediately.
    pub sync_writes: bool,
}

impl FsDirectoryConfig {
    /// Create a configuration rooted at `path` with default settings.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        FsDirectoryConfig {
            path: path.as_ref().to_path_buf(),
            buffer_size: 65536,
            sync_writes: false,
        }
    }
}

/// A directory of files on the local file system.
#[derive(Debug)]
pub struct FsDirectory {
    directory: PathBuf,
    config: FsDirectoryConfig,
    registry: Arc<LockRegistry>,
}

impl FsDirectory {
    /// Open (creating if needed) a directory with its own lock registry.
    pub fn new(config: FsDirectoryConfig) -> Result<Self> {
        Self::with_registry(config, Arc::new(LockRegistry::new()))
    }

    /// Open (creating if needed) a directory whose locks live in `registry`.
    pub fn with_registry(config: FsDirectoryConfig, registry: Arc<LockRegistry>) -> Result<Self> {
        let directory = config.path.clone();

        if !directory.exists() {
            std::fs::create_dir_all(&directory).map_err(|e| {
                StratusError::storage(format!(
                    "Failed to create directory {}: {e}",
                    directory.display()
                ))
            })?;
        }

        if !directory.is_dir() {
            return Err(StratusError::invalid_argument(format!(
                "Path is not a directory: {}",
                directory.display()
            )));
        }

        Ok(FsDirectory {
            directory,
            config,
            registry,
        })
    }

    /// Open a directory at `path` with default settings.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::new(FsDirectoryConfig::new(path))
    }

    /// Root path of this directory.
    pub fn path(&self) -> &Path {
        &self.directory
    }

    /// Get the full path for a file name.
    pub fn file_path(&self, name: &str) -> PathBuf {
        self.directory.join(name)
    }
}

/// Map an I/O error on `name` to the crate error taxonomy.
pub(crate) fn map_io_error(name: &str, e: std::io::Error) -> StratusError {
    match e.kind() {
        ErrorKind::NotFound => StratusError::not_found(name),
        ErrorKind::StorageFull => StratusError::storage(format!("{name}: {e}")),
        _ => StratusError::Io(e),
    }
}

impl Directory for FsDirectory {
    fn list_all(&self) -> Result<Vec<String>> {
        let mut files = Vec::new();

        for entry in std::fs::read_dir(&self.directory)? {
            let entry = entry?;
            let path = entry.path();

            if path.is_file() {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    files.push(name.to_string());
                }
            }
        }

        files.sort();
        Ok(files)
    }

    fn file_exists(&self, name: &str) -> Result<bool> {
        Ok(self.file_path(name).is_file())
    }

    fn file_length(&self, name: &str) -> Result<u64> {
        let metadata = self
            .file_path(name)
            .metadata()
            .map_err(|e| map_io_error(name, e))?;
        Ok(metadata.len())
    }

    fn file_modified(&self, name: &str) -> Result<u64> {
        let metadata = self
            .file_path(name)
            .metadata()
            .map_err(|e| map_io_error(name, e))?;
        Ok(to_millis(metadata.modified()?))
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        match std::fs::remove_file(self.file_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                // Platforms that refuse to unlink open files report it this way.
                Err(StratusError::file_in_use(format!("{name}: {e}")))
            }
            Err(e) => Err(map_io_error(name, e)),
        }
    }

    fn rename_file(&self, source: &str, dest: &str) -> Result<()> {
        match std::fs::rename(self.file_path(source), self.file_path(dest)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                Err(StratusError::file_in_use(format!("{dest}: {e}")))
            }
            Err(e) => Err(map_io_error(source, e)),
        }
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn IndexOutput>> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.file_path(name))
            .map_err(|e| map_io_error(name, e))?;

        Ok(Box::new(FileOutput::new(
            file,
            self.config.buffer_size,
            self.config.sync_writes,
        )))
    }

    fn open_input(&self, name: &str) -> Result<Box<dyn IndexInput>> {
        Ok(Box::new(FileInput::open(
            self.file_path(name),
            name,
            self.config.buffer_size,
        )?))
    }

    fn make_lock(&self, name: &str) -> Box<dyn Lock> {
        Box::new(LocalLock::new(self.registry.clone(), &self.lock_id(), name))
    }

    fn clear_lock(&self, name: &str) -> Result<()> {
        self.registry
            .release(&LockRegistry::key(&self.lock_id(), name));
        Ok(())
    }

    fn sync(&self, names: &[String]) -> Result<()> {
        for name in names {
            let file = File::open(self.file_path(name)).map_err(|e| map_io_error(name, e))?;
            file.sync_all()?;
        }
        Ok(())
    }

    fn lock_id(&self) -> String {
        format!("fs:{}", self.directory.display())
    }
}

/// A buffered reader over a local file.
#[derive(Debug)]
pub struct FileInput {
    path: PathBuf,
    name: String,
    buffer_size: usize,
    reader: BufReader<File>,
    length: u64,
}

impl FileInput {
    fn open(path: PathBuf, name: &str, buffer_size: usize) -> Result<Self> {
        let file = File::open(&path).map_err(|e| map_io_error(name, e))?;
        let length = file.metadata()?.len();
        let reader = BufReader::with_capacity(buffer_size, file);

        Ok(FileInput {
            path,
            name: name.to_string(),
            buffer_size,
            reader,
            length,
        })
    }
}

impl Read for FileInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Seek for FileInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.reader.seek(pos)
    }
}

impl IndexInput for FileInput {
    fn length(&self) -> u64 {
        self.length
    }

    fn clone_input(&self) -> Result<Box<dyn IndexInput>> {
        // A fresh handle keeps its own file offset.
        Ok(Box::new(FileInput::open(
            self.path.clone(),
            &self.name,
            self.buffer_size,
        )?))
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A buffered writer to a local file.
#[derive(Debug)]
pub struct FileOutput {
    writer: BufWriter<File>,
    sync_writes: bool,
    position: u64,
    closed: bool,
}

impl FileOutput {
    fn new(file: File, buffer_size: usize, sync_writes: bool) -> Self {
        FileOutput {
            writer: BufWriter::with_capacity(buffer_size, file),
            sync_writes,
            position: 0,
            closed: false,
        }
    }
}

impl Write for FileOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let bytes_written = self.writer.write(buf)?;
        self.position += bytes_written as u64;

        if self.sync_writes {
            self.writer.flush()?;
        }

        Ok(bytes_written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

impl IndexOutput for FileOutput {
    fn position(&self) -> u64 {
        self.position
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_directory() -> (TempDir, FsDirectory) {
        let temp_dir = TempDir::new().unwrap();
        let dir = FsDirectory::open(temp_dir.path()).unwrap();
        (temp_dir, dir)
    }

    #[test]
    fn test_create_and_read_file() {
        let (_temp_dir, dir) = create_test_directory();

        let mut output = dir.create_output("_0.fdt").unwrap();
        output.write_all(b"Hello, World!").unwrap();
        assert_eq!(output.position(), 13);
        output.close().unwrap();

        let mut input = dir.open_input("_0.fdt").unwrap();
        let mut buffer = Vec::new();
        input.read_to_end(&mut buffer).unwrap();

        assert_eq!(buffer, b"Hello, World!");
        assert_eq!(input.length(), 13);
    }

    #[test]
    fn test_file_operations() {
        let (_temp_dir, dir) = create_test_directory();

        assert!(!dir.file_exists("segments_1").unwrap());

        let mut output = dir.create_output("segments_1").unwrap();
        output.write_all(b"Test content").unwrap();
        output.close().unwrap();

        assert!(dir.file_exists("segments_1").unwrap());
        assert_eq!(dir.file_length("segments_1").unwrap(), 12);
        assert!(dir.file_modified("segments_1").unwrap() > 0);
        assert_eq!(dir.list_all().unwrap(), vec!["segments_1"]);

        dir.delete_file("segments_1").unwrap();
        assert!(!dir.file_exists("segments_1").unwrap());

        // Deleting a missing file is not an error.
        dir.delete_file("segments_1").unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_rename_keeps_open_inputs_on_old_content() {
        let (_temp_dir, dir) = create_test_directory();
        for (name, data) in [("_0.fdt", b"old"), ("_0.fdt.tmp", b"new")] {
            let mut output = dir.create_output(name).unwrap();
            output.write_all(data).unwrap();
            output.close().unwrap();
        }

        let mut before = dir.open_input("_0.fdt").unwrap();
        dir.rename_file("_0.fdt.tmp", "_0.fdt").unwrap();
        assert_eq!(dir.list_all().unwrap(), vec!["_0.fdt"]);

        let mut buf = Vec::new();
        before.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"old");

        buf.clear();
        dir.open_input("_0.fdt").unwrap().read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"new");
    }

    #[test]
    fn test_cloned_inputs_have_independent_positions() {
        let (_temp_dir, dir) = create_test_directory();

        let mut output = dir.create_output("_0.fdt").unwrap();
        output.write_all(b"0123456789").unwrap();
        output.close().unwrap();

        let mut input = dir.open_input("_0.fdt").unwrap();
        input.seek(SeekFrom::Start(5)).unwrap();

        let mut clone = input.clone_input().unwrap();
        let mut head = [0u8; 3];
        clone.read_exact(&mut head).unwrap();
        assert_eq!(&head, b"012");

        let mut tail = [0u8; 3];
        input.read_exact(&mut tail).unwrap();
        assert_eq!(&tail, b"567");
    }

    #[test]
    fn test_file_not_found() {
        let (_temp_dir, dir) = create_test_directory();

        assert!(dir.open_input("missing").unwrap_err().is_not_found());
        assert!(dir.file_length("missing").unwrap_err().is_not_found());
    }

    #[test]
    fn test_locks_are_scoped_to_registry() {
        let temp_dir = TempDir::new().unwrap();
        let registry = Arc::new(LockRegistry::new());
        let first =
            FsDirectory::with_registry(FsDirectoryConfig::new(temp_dir.path()), registry.clone())
                .unwrap();
        let second =
            FsDirectory::with_registry(FsDirectoryConfig::new(temp_dir.path()), registry).unwrap();

        let mut a = first.make_lock("write.lock");
        let mut b = second.make_lock("write.lock");
        assert!(a.obtain().unwrap());
        assert!(!b.obtain().unwrap());

        second.clear_lock("write.lock").unwrap();
        assert!(b.obtain().unwrap());
    }
}
