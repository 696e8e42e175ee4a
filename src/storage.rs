//! Directory abstraction shared by the index engine and the sync layer.
//!
//! The index engine opens, creates, deletes and lists its segment files
//! through the narrow [`Directory`] capability interface. Three
//! implementations exist:
//!
//! - [`file::FsDirectory`]: the local, file-system backed segment store that
//!   serves as the fast cache.
//! - [`memory::MemoryDirectory`]: an in-memory directory for tests and
//!   scratch indexes.
//! - [`crate::sync::SyncDirectory`]: the cache-coherent facade that keeps a
//!   local directory in step with a remote object store.
//!
//! # Example
//!
//! ```
//! use stratus::storage::Directory;
//! use stratus::storage::memory::MemoryDirectory;
//! use std::io::{Read, Write};
//!
//! # fn main() -> stratus::error::Result<()> {
//! let dir = MemoryDirectory::new();
//!
//! let mut output = dir.create_output("_0.fdt")?;
//! output.write_all(b"stored fields")?;
//! output.close()?;
//!
//! let mut input = dir.open_input("_0.fdt")?;
//! let mut buffer = Vec::new();
//! input.read_to_end(&mut buffer)?;
//! assert_eq!(buffer, b"stored fields");
//! # Ok(())
//! # }
//! ```

use std::io::{Read, Seek, Write};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::error::{Result, StratusError};

pub mod file;
pub mod lock;
pub mod memory;

pub use lock::{LocalLock, LockRegistry};

/// Polling interval used by [`Lock::obtain_timeout`].
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A directory of named, write-once segment files.
///
/// Modification times are expressed in milliseconds since the Unix epoch.
pub trait Directory: Send + Sync + std::fmt::Debug {
    /// List the names of all files in the directory, sorted.
    fn list_all(&self) -> Result<Vec<String>>;

    /// Check whether a file exists.
    fn file_exists(&self, name: &str) -> Result<bool>;

    /// Get the length of a file in bytes.
    fn file_length(&self, name: &str) -> Result<u64>;

    /// Get the last modification time of a file.
    fn file_modified(&self, name: &str) -> Result<u64>;

    /// Delete a file.
    ///
    /// Fails with [`StratusError::FileInUse`] when the implementation cannot
    /// delete a file that is still open; callers are expected to retry later.
    fn delete_file(&self, name: &str) -> Result<()>;

    /// Rename `source` to `dest`, replacing any existing `dest`.
    ///
    /// Inputs already open on the replaced file keep reading its old
    /// content. Directories that cannot rename report
    /// [`StratusError::InvalidArgument`].
    fn rename_file(&self, source: &str, dest: &str) -> Result<()> {
        Err(StratusError::invalid_argument(format!(
            "{} cannot rename {source} to {dest}",
            self.lock_id()
        )))
    }

    /// Create a new file, replacing any existing file of the same name.
    fn create_output(&self, name: &str) -> Result<Box<dyn IndexOutput>>;

    /// Open an existing file for reading.
    fn open_input(&self, name: &str) -> Result<Box<dyn IndexInput>>;

    /// Create a lock object for the given lock name. The lock is not obtained.
    fn make_lock(&self, name: &str) -> Box<dyn Lock>;

    /// Forcefully remove a lock, whoever holds it.
    fn clear_lock(&self, name: &str) -> Result<()>;

    /// Make the named files durable.
    fn sync(&self, names: &[String]) -> Result<()>;

    /// Identity of this directory, used to key in-process lock claims.
    fn lock_id(&self) -> String;
}

/// A trait for reading a file.
pub trait IndexInput: Read + Seek + Send + std::fmt::Debug {
    /// Length of the file in bytes.
    fn length(&self) -> u64;

    /// Create an independent reader on the same file, positioned at the start.
    fn clone_input(&self) -> Result<Box<dyn IndexInput>>;

    /// Close the input.
    fn close(&mut self) -> Result<()>;
}

/// A trait for writing a new file.
pub trait IndexOutput: Write + Send + std::fmt::Debug {
    /// Number of bytes written so far.
    fn position(&self) -> u64;

    /// Flush and close the output. Closing twice is a no-op.
    fn close(&mut self) -> Result<()>;
}

impl IndexInput for Box<dyn IndexInput> {
    fn length(&self) -> u64 {
        self.as_ref().length()
    }

    fn clone_input(&self) -> Result<Box<dyn IndexInput>> {
        self.as_ref().clone_input()
    }

    fn close(&mut self) -> Result<()> {
        self.as_mut().close()
    }
}

impl IndexOutput for Box<dyn IndexOutput> {
    fn position(&self) -> u64 {
        self.as_ref().position()
    }

    fn close(&mut self) -> Result<()> {
        self.as_mut().close()
    }
}

/// A named mutual-exclusion lock on a directory.
pub trait Lock: Send + std::fmt::Debug {
    /// Name of the lock.
    fn name(&self) -> &str;

    /// Try once to obtain the lock. Returns `false` when it is held elsewhere.
    fn obtain(&mut self) -> Result<bool>;

    /// Release the lock. Releasing a lock that is not held is a no-op.
    fn release(&mut self) -> Result<()>;

    /// Whether anyone currently holds the lock.
    fn is_locked(&mut self) -> Result<bool>;

    /// Forcefully remove the lock, whoever holds it.
    fn break_lock(&mut self) -> Result<()>;

    /// Poll [`Lock::obtain`] until it succeeds or `timeout` elapses.
    fn obtain_timeout(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.obtain()? {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(StratusError::LockObtainFailed(format!(
                    "timed out after {timeout:?} waiting for {}",
                    self.name()
                )));
            }
            thread::sleep(LOCK_POLL_INTERVAL.min(deadline - now));
        }
    }
}

/// Milliseconds since the Unix epoch for a system time.
pub fn to_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Current time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    to_millis(SystemTime::now())
}
