//! Remote-backed directories with a local cache.
//!
//! - [`coherence`]: dirty flag and generation fingerprint deciding when the
//!   cache can answer metadata calls.
//! - [`transfer`]: copy-on-read and copy-on-write of segment files, with
//!   optional zstd compression.
//! - [`lock`]: locks on the remote store, composed with in-process locks.
//! - [`directory`]: [`SyncDirectory`], the facade handed to the index engine.
//!
//! # Example
//!
//! ```
//! use std::io::Write;
//! use std::sync::Arc;
//!
//! use stratus::config::{LockConfig, SyncDirectoryConfig};
//! use stratus::remote::memory::MemoryObjectStore;
//! use stratus::storage::Directory;
//! use stratus::storage::memory::MemoryDirectory;
//! use stratus::sync::SyncDirectory;
//!
//! # fn main() -> stratus::error::Result<()> {
//! let remote = MemoryObjectStore::new("catalog");
//! let dir = SyncDirectory::new(
//!     Arc::new(remote.clone()),
//!     Arc::new(MemoryDirectory::new()),
//!     SyncDirectoryConfig::default(),
//!     LockConfig::default(),
//! )?;
//!
//! let mut output = dir.create_output("_0.fdt")?;
//! output.write_all(b"stored fields")?;
//! output.close()?;
//!
//! assert_eq!(dir.file_length("_0.fdt")?, 13);
//! # Ok(())
//! # }
//! ```

pub mod coherence;
pub mod directory;
pub mod lock;
pub mod transfer;

pub use directory::SyncDirectory;
pub use lock::DistributedLock;
pub use transfer::SegmentFileTransfer;
