//! In-memory directory for testing and scratch indexes.

use std::collections::HashMap;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::{Result, StratusError};
use crate::storage::lock::{LocalLock, LockRegistry};
use crate::storage::{Directory, IndexInput, IndexOutput, Lock, now_millis};

#[derive(Debug, Clone)]
struct MemoryFile {
    data: Arc<[u8]>,
    modified: u64,
}

/// Per-operation call counters of a [`MemoryDirectory`].
#[derive(Debug, Default)]
pub struct MemoryDirectoryStats {
    pub list_all: AtomicU64,
    pub file_exists: AtomicU64,
    pub file_length: AtomicU64,
    pub file_modified: AtomicU64,
    pub delete_file: AtomicU64,
    pub create_output: AtomicU64,
    pub open_input: AtomicU64,
}

impl MemoryDirectoryStats {
    /// Total number of metadata calls (listing, existence, length, modified).
    pub fn metadata_calls(&self) -> u64 {
        self.list_all.load(Ordering::Relaxed)
            + self.file_exists.load(Ordering::Relaxed)
            + self.file_length.load(Ordering::Relaxed)
            + self.file_modified.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct MemoryInner {
    files: RwLock<HashMap<String, MemoryFile>>,
    stats: MemoryDirectoryStats,
}

/// An in-memory directory.
///
/// Files become visible when their output is closed. A file that still has
/// an open input cannot be deleted: [`Directory::delete_file`] reports
/// [`StratusError::FileInUse`] until every input on it has been closed or
/// dropped.
#[derive(Debug, Clone)]
pub struct MemoryDirectory {
    inner: Arc<MemoryInner>,
    registry: Arc<LockRegistry>,
    id: String,
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDirectory {
    /// Create an empty directory with its own lock registry.
    pub fn new() -> Self {
        Self::with_registry(Arc::new(LockRegistry::new()))
    }

    /// Create an empty directory whose locks live in `registry`.
    pub fn with_registry(registry: Arc<LockRegistry>) -> Self {
        MemoryDirectory {
            inner: Arc::new(MemoryInner {
                files: RwLock::new(HashMap::new()),
                stats: MemoryDirectoryStats::default(),
            }),
            registry,
            id: format!("memory:{}", Uuid::new_v4()),
        }
    }

    /// Call counters.
    pub fn stats(&self) -> &MemoryDirectoryStats {
        &self.inner.stats
    }

    /// Get the number of files stored.
    pub fn file_count(&self) -> usize {
        self.inner.files.read().len()
    }

    /// Store `data` under `name` directly, bypassing an output.
    pub fn put_file(&self, name: &str, data: &[u8]) {
        self.inner.files.write().insert(
            name.to_string(),
            MemoryFile {
                data: Arc::from(data),
                modified: now_millis(),
            },
        );
    }

    /// Overwrite the modification time of a file.
    pub fn set_modified(&self, name: &str, modified: u64) -> Result<()> {
        let mut files = self.inner.files.write();
        let file = files
            .get_mut(name)
            .ok_or_else(|| StratusError::not_found(name))?;
        file.modified = modified;
        Ok(())
    }

    fn get(&self, name: &str) -> Result<MemoryFile> {
        self.inner
            .files
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StratusError::not_found(name))
    }
}

impl Directory for MemoryDirectory {
    fn list_all(&self) -> Result<Vec<String>> {
        self.inner.stats.list_all.fetch_add(1, Ordering::Relaxed);
        let mut names: Vec<String> = self.inner.files.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn file_exists(&self, name: &str) -> Result<bool> {
        self.inner.stats.file_exists.fetch_add(1, Ordering::Relaxed);
        Ok(self.inner.files.read().contains_key(name))
    }

    fn file_length(&self, name: &str) -> Result<u64> {
        self.inner.stats.file_length.fetch_add(1, Ordering::Relaxed);
        Ok(self.get(name)?.data.len() as u64)
    }

    fn file_modified(&self, name: &str) -> Result<u64> {
        self.inner.stats.file_modified.fetch_add(1, Ordering::Relaxed);
        Ok(self.get(name)?.modified)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.inner.stats.delete_file.fetch_add(1, Ordering::Relaxed);
        let mut files = self.inner.files.write();
        if let Some(file) = files.get(name) {
            // The map holds one reference; any other belongs to an open input.
            if Arc::strong_count(&file.data) > 1 {
                return Err(StratusError::file_in_use(name));
            }
            files.remove(name);
        }
        Ok(())
    }

    fn rename_file(&self, source: &str, dest: &str) -> Result<()> {
        let mut files = self.inner.files.write();
        let file = files
            .remove(source)
            .ok_or_else(|| StratusError::not_found(source))?;
        files.insert(dest.to_string(), file);
        Ok(())
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn IndexOutput>> {
        self.inner.stats.create_output.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemoryOutput {
            name: name.to_string(),
            buffer: Vec::new(),
            inner: self.inner.clone(),
            closed: false,
        }))
    }

    fn open_input(&self, name: &str) -> Result<Box<dyn IndexInput>> {
        self.inner.stats.open_input.fetch_add(1, Ordering::Relaxed);
        let file = self.get(name)?;
        Ok(Box::new(MemoryInput::new(file.data)))
    }

    fn make_lock(&self, name: &str) -> Box<dyn Lock> {
        Box::new(LocalLock::new(self.registry.clone(), &self.id, name))
    }

    fn clear_lock(&self, name: &str) -> Result<()> {
        self.registry.release(&LockRegistry::key(&self.id, name));
        Ok(())
    }

    fn sync(&self, _names: &[String]) -> Result<()> {
        Ok(())
    }

    fn lock_id(&self) -> String {
        self.id.clone()
    }
}

/// A reader over an in-memory file.
#[derive(Debug)]
pub struct MemoryInput {
    cursor: Option<Cursor<Arc<[u8]>>>,
    length: u64,
}

impl MemoryInput {
    /// Create a reader over `data`.
    pub fn new(data: Arc<[u8]>) -> Self {
        let length = data.len() as u64;
        MemoryInput {
            cursor: Some(Cursor::new(data)),
            length,
        }
    }

    fn cursor(&mut self) -> std::io::Result<&mut Cursor<Arc<[u8]>>> {
        self.cursor
            .as_mut()
            .ok_or_else(|| std::io::Error::other("Input is closed"))
    }
}

impl Read for MemoryInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.cursor()?.read(buf)
    }
}

impl Seek for MemoryInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.cursor()?.seek(pos)
    }
}

impl IndexInput for MemoryInput {
    fn length(&self) -> u64 {
        self.length
    }

    fn clone_input(&self) -> Result<Box<dyn IndexInput>> {
        let cursor = self
            .cursor
            .as_ref()
            .ok_or_else(|| StratusError::already_closed("memory input"))?;
        Ok(Box::new(MemoryInput::new(cursor.get_ref().clone())))
    }

    fn close(&mut self) -> Result<()> {
        self.cursor = None;
        Ok(())
    }
}

/// A writer that publishes its buffer to the directory on close.
#[derive(Debug)]
pub struct MemoryOutput {
    name: String,
    buffer: Vec<u8>,
    inner: Arc<MemoryInner>,
    closed: bool,
}

impl Write for MemoryOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.closed {
            return Err(std::io::Error::other("Output is closed"));
        }
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl IndexOutput for MemoryOutput {
    fn position(&self) -> u64 {
        self.buffer.len() as u64
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            let data: Arc<[u8]> = Arc::from(std::mem::take(&mut self.buffer));
            self.inner.files.write().insert(
                self.name.clone(),
                MemoryFile {
                    data,
                    modified: now_millis(),
                },
            );
            self.closed = true;
        }
        Ok(())
    }
}

impl Drop for MemoryOutput {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
