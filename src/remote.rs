//! Remote object store interface.
//!
//! The remote store is the durable, authoritative home of every segment
//! file. A [`RemoteObjectStore`] is bound to a single container and offers
//! whole-object get/put/delete/list, per-object metadata written atomically
//! with the object bytes, and time-boxed exclusive leases on named objects.
//!
//! Authentication and transport belong to concrete clients. This crate ships
//! an in-process [`memory::MemoryObjectStore`] and a file-system backed
//! [`fs::FsObjectStore`] for shared mounts and local development.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub mod fs;
pub mod memory;

/// Metadata key holding the uncompressed length of a segment object.
pub const CACHED_LENGTH_KEY: &str = "CachedLength";

/// Metadata key holding the modification time of the local file the object
/// was uploaded from, in milliseconds since the Unix epoch.
pub const CACHED_LAST_MODIFIED_KEY: &str = "CachedLastModified";

/// Metadata key recording whether the stored payload is zstd-compressed.
pub const CACHED_COMPRESSED_KEY: &str = "CachedCompressed";

/// Opaque token proving ownership of a lease.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseId(pub String);

impl LeaseId {
    /// Generate a fresh random lease id.
    pub fn generate() -> Self {
        LeaseId(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Properties of a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    /// Object name within the container.
    pub name: String,

    /// Stored size in bytes (compressed size for compressed objects).
    pub size: u64,

    /// Time the object was last written, in milliseconds since the Unix epoch.
    pub last_modified: u64,

    /// User metadata attached to the object.
    pub metadata: HashMap<String, String>,
}

impl ObjectInfo {
    /// Uncompressed length stamped at upload, if present and well formed.
    pub fn cached_length(&self) -> Option<u64> {
        self.metadata
            .get(CACHED_LENGTH_KEY)
            .and_then(|v| v.parse().ok())
    }

    /// Local modification time stamped at upload, if present and well formed.
    pub fn cached_last_modified(&self) -> Option<u64> {
        self.metadata
            .get(CACHED_LAST_MODIFIED_KEY)
            .and_then(|v| v.parse().ok())
    }

    /// Whether the payload was stored compressed, if stamped.
    pub fn cached_compressed(&self) -> Option<bool> {
        self.metadata
            .get(CACHED_COMPRESSED_KEY)
            .and_then(|v| v.parse().ok())
    }

    /// Logical file length: the stamped length, else the stored size.
    pub fn logical_length(&self) -> u64 {
        self.cached_length().unwrap_or(self.size)
    }

    /// Logical modification time: the stamped time, else the store's time.
    pub fn logical_modified(&self) -> u64 {
        self.cached_last_modified().unwrap_or(self.last_modified)
    }
}

/// A container of named objects in a durable remote store.
///
/// Missing objects and missing containers are reported as
/// [`crate::error::StratusError::RemoteNotFound`]; a lease held by another
/// owner as [`crate::error::StratusError::LeaseConflict`]; an unreachable
/// store as [`crate::error::StratusError::StorageUnavailable`].
pub trait RemoteObjectStore: Send + Sync + fmt::Debug {
    /// Name of the container this client is bound to.
    fn container(&self) -> &str;

    /// Create the container if it does not exist yet.
    fn create_container_if_missing(&self) -> Result<()>;

    /// List every object whose name starts with `prefix`, sorted by name.
    fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;

    /// Properties of an object, or `None` if it does not exist.
    fn head_object(&self, name: &str) -> Result<Option<ObjectInfo>>;

    /// Download the full contents of an object.
    fn get_object(&self, name: &str) -> Result<Vec<u8>>;

    /// Upload an object, replacing any previous version, together with its metadata.
    fn put_object(&self, name: &str, data: &[u8], metadata: HashMap<String, String>) -> Result<()>;

    /// Delete an object. Returns whether it existed.
    fn delete_object(&self, name: &str) -> Result<bool>;

    /// Acquire an exclusive lease on an existing object for `duration`.
    fn acquire_lease(&self, name: &str, duration: Duration) -> Result<LeaseId>;

    /// Extend a lease held by `lease` for another full lease duration.
    fn renew_lease(&self, name: &str, lease: &LeaseId) -> Result<()>;

    /// Release a lease held by `lease`.
    fn release_lease(&self, name: &str, lease: &LeaseId) -> Result<()>;

    /// Break any lease on the object immediately, whoever holds it.
    fn break_lease(&self, name: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_info_stamped_metadata() {
        let mut metadata = HashMap::new();
        metadata.insert(CACHED_LENGTH_KEY.to_string(), "1024".to_string());
        metadata.insert(CACHED_LAST_MODIFIED_KEY.to_string(), "1700000000000".to_string());
        metadata.insert(CACHED_COMPRESSED_KEY.to_string(), "true".to_string());

        let info = ObjectInfo {
            name: "_0.fdt".to_string(),
            size: 300,
            last_modified: 1_700_000_005_000,
            metadata,
        };

        assert_eq!(info.cached_length(), Some(1024));
        assert_eq!(info.cached_compressed(), Some(true));
        assert_eq!(info.logical_length(), 1024);
        assert_eq!(info.logical_modified(), 1_700_000_000_000);
    }

    #[test]
    fn test_object_info_without_metadata() {
        let info = ObjectInfo {
            name: "segments.gen".to_string(),
            size: 20,
            last_modified: 5,
            metadata: HashMap::from([(CACHED_LENGTH_KEY.to_string(), "garbage".to_string())]),
        };

        assert_eq!(info.cached_length(), None);
        assert_eq!(info.cached_compressed(), None);
        assert_eq!(info.logical_length(), 20);
        assert_eq!(info.logical_modified(), 5);
    }

    #[test]
    fn test_lease_ids_are_unique() {
        assert_ne!(LeaseId::generate(), LeaseId::generate());
    }
}
