//! Error types for the Stratus library.
//!
//! All fallible operations return [`Result`], whose error type is the
//! [`StratusError`] enum. The variants keep the conditions that callers must
//! be able to tell apart (a file still held open, a remote store that cannot
//! be reached, a lease owned by someone else) as distinct cases rather than
//! folding them into a message string.
//!
//! # Examples
//!
//! ```
//! use stratus::error::{Result, StratusError};
//!
//! fn example_operation() -> Result<()> {
//!     Err(StratusError::invalid_argument("target generation is in the future"))
//! }
//!
//! match example_operation() {
//!     Ok(_) => println!("Success"),
//!     Err(e) => eprintln!("Error: {}", e),
//! }
//! ```

use std::io;

use thiserror::Error;

/// The main error type for Stratus operations.
#[derive(Error, Debug)]
pub enum StratusError {
    /// I/O errors raised by the local file system.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The backing store (remote or local) cannot serve requests at all.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A file does not exist in the directory.
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// A file cannot be deleted because it is still open.
    #[error("File in use: {0}")]
    FileInUse(String),

    /// A remote object or its container does not exist.
    #[error("Remote object not found: {0}")]
    RemoteNotFound(String),

    /// A lease on a remote object is held by another owner.
    #[error("Lease conflict: {0}")]
    LeaseConflict(String),

    /// A lock could not be obtained within the allotted time.
    #[error("Lock obtain failed: {0}")]
    LockObtainFailed(String),

    /// The component has been closed.
    #[error("Already closed: {0}")]
    AlreadyClosed(String),

    /// An argument was rejected.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Index engine errors.
    #[error("Index error: {0}")]
    Index(String),

    /// Binary serialization errors.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// JSON serialization/deserialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Thread spawn/join errors.
    #[error("Thread join error: {0}")]
    ThreadJoin(String),

    /// Generic error for other cases.
    #[error("Error: {0}")]
    Other(String),
}

/// Result type alias for operations that may fail with StratusError.
pub type Result<T> = std::result::Result<T, StratusError>;

impl StratusError {
    /// Create a new storage unavailable error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        StratusError::StorageUnavailable(msg.into())
    }

    /// Create a new file not found error.
    pub fn not_found<S: Into<String>>(name: S) -> Self {
        StratusError::FileNotFound(name.into())
    }

    /// Create a new file in use error.
    pub fn file_in_use<S: Into<String>>(name: S) -> Self {
        StratusError::FileInUse(name.into())
    }

    /// Create a new remote not found error.
    pub fn remote_not_found<S: Into<String>>(name: S) -> Self {
        StratusError::RemoteNotFound(name.into())
    }

    /// Create a new lease conflict error.
    pub fn lease_conflict<S: Into<String>>(name: S) -> Self {
        StratusError::LeaseConflict(name.into())
    }

    /// Create a new already closed error.
    pub fn already_closed<S: Into<String>>(what: S) -> Self {
        StratusError::AlreadyClosed(what.into())
    }

    /// Create a new invalid argument error.
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        StratusError::InvalidArgument(msg.into())
    }

    /// Create a new invalid config error.
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        StratusError::InvalidArgument(format!("Invalid configuration: {}", msg.into()))
    }

    /// Create a new index error.
    pub fn index<S: Into<String>>(msg: S) -> Self {
        StratusError::Index(msg.into())
    }

    /// Create a new generic error.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        StratusError::Other(msg.into())
    }

    /// Whether this error means the file or object does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            StratusError::FileNotFound(_) | StratusError::RemoteNotFound(_) => true,
            StratusError::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Whether this error means the backing store cannot be reached.
    pub fn is_storage_unavailable(&self) -> bool {
        matches!(self, StratusError::StorageUnavailable(_))
    }

    /// Whether this error means the file is still held open.
    pub fn is_file_in_use(&self) -> bool {
        matches!(self, StratusError::FileInUse(_))
    }
}

impl From<bincode::Error> for StratusError {
    fn from(err: bincode::Error) -> Self {
        StratusError::Serialization(err.to_string())
    }
}
