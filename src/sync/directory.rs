//! The cache-coherent directory facade.

use std::sync::Arc;

use log::debug;

use crate::config::{LockConfig, SyncDirectoryConfig};
use crate::engine::segment::{SEGMENTS_GEN, max_generation};
use crate::error::{Result, StratusError};
use crate::remote::{ObjectInfo, RemoteObjectStore};
use crate::storage::lock::LockRegistry;
use crate::storage::memory::MemoryInput;
use crate::storage::{Directory, IndexInput, IndexOutput, Lock};
use crate::sync::coherence::{CoherenceState, Fingerprint};
use crate::sync::lock::{DistributedLock, lock_object_name};
use crate::sync::transfer::{SegmentFileTransfer, is_fetch_temp};

/// Files that may be rewritten in place and are therefore always read from
/// the remote store.
pub const REMOTE_ONLY_FILES: &[&str] = &[SEGMENTS_GEN];

/// Whether `name` is always served from the remote store.
pub fn is_remote_only(name: &str) -> bool {
    REMOTE_ONLY_FILES.contains(&name)
}

/// A directory whose files live durably in a remote object store and are
/// served from a local cache.
///
/// Metadata calls (`list_all`, `file_exists`, `file_length`,
/// `file_modified`) are answered by the cache while the newest commit
/// generation in the cache equals the newest one in the remote store, and
/// by the remote store otherwise. The comparison is redone lazily after
/// every mutation. Inputs are always validated against the remote object's
/// stamped metadata and refreshed if stale.
#[derive(Debug)]
pub struct SyncDirectory {
    remote: Arc<dyn RemoteObjectStore>,
    cache: Arc<dyn Directory>,
    transfer: Arc<SegmentFileTransfer>,
    coherence: Arc<CoherenceState>,
    registry: Arc<LockRegistry>,
    prefix: String,
    lock_config: LockConfig,
}

impl SyncDirectory {
    /// Open a directory with its own lock registry, creating the remote
    /// container if needed.
    pub fn new(
        remote: Arc<dyn RemoteObjectStore>,
        cache: Arc<dyn Directory>,
        config: SyncDirectoryConfig,
        lock_config: LockConfig,
    ) -> Result<Self> {
        Self::with_registry(
            remote,
            cache,
            config,
            lock_config,
            Arc::new(LockRegistry::new()),
        )
    }

    /// Open a directory whose local lock claims live in `registry`.
    pub fn with_registry(
        remote: Arc<dyn RemoteObjectStore>,
        cache: Arc<dyn Directory>,
        config: SyncDirectoryConfig,
        lock_config: LockConfig,
        registry: Arc<LockRegistry>,
    ) -> Result<Self> {
        config.validate()?;
        lock_config.validate()?;
        remote.create_container_if_missing()?;

        Ok(SyncDirectory {
            transfer: Arc::new(SegmentFileTransfer::new(
                remote.clone(),
                cache.clone(),
                &config,
            )),
            prefix: config.prefix(),
            remote,
            cache,
            coherence: Arc::new(CoherenceState::new()),
            registry,
            lock_config,
        })
    }

    /// The local cache.
    pub fn cache(&self) -> &Arc<dyn Directory> {
        &self.cache
    }

    /// The remote store.
    pub fn remote(&self) -> &Arc<dyn RemoteObjectStore> {
        &self.remote
    }

    /// Coherence state, exposed for inspection.
    pub fn coherence(&self) -> &CoherenceState {
        &self.coherence
    }

    /// Whether the cache is currently trusted for metadata calls.
    pub fn is_in_sync(&self) -> Result<bool> {
        self.coherence.check(|| self.fingerprint())
    }

    fn fingerprint(&self) -> Result<Fingerprint> {
        let remote = max_generation(self.remote_listing()?.iter().map(|info| &info.name));
        let local = max_generation(self.cache.list_all()?);
        Ok(Fingerprint { local, remote })
    }

    /// Remote objects of this directory, with names relative to the root
    /// folder. Nested folders and lock objects are skipped.
    fn remote_listing(&self) -> Result<Vec<ObjectInfo>> {
        let objects = self.remote.list_objects(&self.prefix)?;
        Ok(objects
            .into_iter()
            .filter_map(|mut info| {
                let name = info.name.strip_prefix(&self.prefix)?.to_string();
                if name.is_empty() || name.contains('/') || name.ends_with(".lock") {
                    return None;
                }
                info.name = name;
                Some(info)
            })
            .collect())
    }

    fn remote_info(&self, name: &str) -> Result<Option<ObjectInfo>> {
        self.remote.head_object(&self.transfer.object_name(name))
    }

    fn serve_from_cache(&self, name: &str) -> Result<bool> {
        Ok(!is_remote_only(name) && self.is_in_sync()?)
    }

    fn make_distributed_lock(&self, name: &str) -> DistributedLock {
        DistributedLock::new(
            self.remote.clone(),
            self.registry.clone(),
            &self.lock_id(),
            name,
            lock_object_name(&self.prefix, self.lock_config.lock_prefix.as_deref(), name),
            self.lock_config.clone(),
        )
    }
}

impl Directory for SyncDirectory {
    fn list_all(&self) -> Result<Vec<String>> {
        if self.is_in_sync()? {
            let mut names = self.cache.list_all()?;
            names.retain(|name| !is_fetch_temp(name));
            return Ok(names);
        }
        debug!("Listing from the remote store");
        Ok(self
            .remote_listing()?
            .into_iter()
            .map(|info| info.name)
            .collect())
    }

    fn file_exists(&self, name: &str) -> Result<bool> {
        if self.serve_from_cache(name)? {
            return self.cache.file_exists(name);
        }
        Ok(self.remote_info(name)?.is_some())
    }

    fn file_length(&self, name: &str) -> Result<u64> {
        if self.serve_from_cache(name)? {
            return self.cache.file_length(name);
        }
        self.remote_info(name)?
            .map(|info| info.logical_length())
            .ok_or_else(|| StratusError::not_found(name))
    }

    fn file_modified(&self, name: &str) -> Result<u64> {
        if self.serve_from_cache(name)? {
            return self.cache.file_modified(name);
        }
        self.remote_info(name)?
            .map(|info| info.logical_modified())
            .ok_or_else(|| StratusError::not_found(name))
    }

    /// Delete the cached copy, then the remote object.
    ///
    /// A cached file that is still open makes the call fail with
    /// [`StratusError::FileInUse`] before the remote object is touched, so
    /// the index engine can retry the delete later.
    fn delete_file(&self, name: &str) -> Result<()> {
        self.cache.delete_file(name)?;
        self.remote.delete_object(&self.transfer.object_name(name))?;
        self.coherence.mark_dirty();
        debug!("Deleted {name}");
        Ok(())
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn IndexOutput>> {
        self.coherence.mark_dirty();
        Ok(Box::new(
            self.transfer.create_output(name, self.coherence.clone())?,
        ))
    }

    fn open_input(&self, name: &str) -> Result<Box<dyn IndexInput>> {
        if is_remote_only(name) {
            let data = self.transfer.read_remote(name)?;
            return Ok(Box::new(MemoryInput::new(Arc::from(data))));
        }
        self.transfer.open_input(name)
    }

    fn make_lock(&self, name: &str) -> Box<dyn Lock> {
        Box::new(self.make_distributed_lock(name))
    }

    fn clear_lock(&self, name: &str) -> Result<()> {
        self.make_distributed_lock(name).break_lock()
    }

    fn sync(&self, names: &[String]) -> Result<()> {
        // Remote objects are durable once uploaded; only the cache needs it.
        self.cache.sync(names)
    }

    fn lock_id(&self) -> String {
        format!("sync:{}/{}", self.remote.container(), self.prefix)
    }
}
