//! Copy-on-read and copy-on-write of segment files.
//!
//! Reads are served from the local cache once the cached copy has been
//! validated against the length and modification time stamped on the
//! remote object; a missing or stale copy is fetched first. Writes go to
//! the local cache, and closing the output uploads the finished file in a
//! single request that carries its stamped metadata.
//!
//! Whether an object was compressed is stamped on the object itself, so
//! directories with different compression settings can share a container.
//! A refreshed copy is written under a temporary name in the cache and
//! renamed over the old one, leaving inputs already open on it intact.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use log::{debug, warn};

use crate::config::SyncDirectoryConfig;
use crate::error::{Result, StratusError};
use crate::remote::{
    CACHED_COMPRESSED_KEY, CACHED_LAST_MODIFIED_KEY, CACHED_LENGTH_KEY, ObjectInfo,
    RemoteObjectStore,
};
use crate::storage::{Directory, IndexInput, IndexOutput};
use crate::sync::coherence::CoherenceState;

/// Segment file suffixes eligible for compression before upload.
pub const COMPRESSIBLE_SUFFIXES: &[&str] = &[
    "cfs", "fdt", "fdx", "frq", "prx", "tis", "tii", "nrm", "tvx", "tvd", "tvf", "del",
];

/// Suffix of the temporary cache files a fetch writes before renaming.
pub const FETCH_SUFFIX: &str = ".fetching";

/// Whether `name` is a temporary file of an in-flight fetch.
pub fn is_fetch_temp(name: &str) -> bool {
    name.ends_with(FETCH_SUFFIX)
}

/// Whether `name` has a compressible suffix.
pub fn is_compressible(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| COMPRESSIBLE_SUFFIXES.contains(&ext))
}

/// Moves segment files between the local cache and the remote store.
#[derive(Debug)]
pub struct SegmentFileTransfer {
    remote: Arc<dyn RemoteObjectStore>,
    cache: Arc<dyn Directory>,
    prefix: String,
    compress: bool,
    compression_level: i32,
    clock_skew_tolerance_ms: u64,
}

impl SegmentFileTransfer {
    pub fn new(
        remote: Arc<dyn RemoteObjectStore>,
        cache: Arc<dyn Directory>,
        config: &SyncDirectoryConfig,
    ) -> Self {
        SegmentFileTransfer {
            remote,
            cache,
            prefix: config.prefix(),
            compress: config.compress,
            compression_level: config.compression_level,
            clock_skew_tolerance_ms: config.clock_skew_tolerance_ms,
        }
    }

    /// Remote object name of a file.
    pub fn object_name(&self, name: &str) -> String {
        format!("{}{name}", self.prefix)
    }

    fn compresses(&self, name: &str) -> bool {
        self.compress && is_compressible(name)
    }

    /// Whether the cached copy of `name` must be replaced by the remote one.
    pub fn is_stale(&self, name: &str, info: &ObjectInfo) -> Result<bool> {
        if !self.cache.file_exists(name)? {
            return Ok(true);
        }
        if self.cache.file_length(name)? != info.logical_length() {
            debug!("Cached {name} has the wrong length");
            return Ok(true);
        }
        let cached = self.cache.file_modified(name)?;
        if info.logical_modified() > cached + self.clock_skew_tolerance_ms {
            debug!("Cached {name} is older than the remote copy");
            return Ok(true);
        }
        Ok(false)
    }

    /// Download `name` into the cache, decompressing if needed.
    pub fn fetch(&self, name: &str, info: &ObjectInfo) -> Result<()> {
        let stored = self.remote.get_object(&info.name)?;
        let compressed = info
            .cached_compressed()
            .unwrap_or_else(|| self.compresses(name));
        let data = if compressed {
            zstd::decode_all(stored.as_slice())
                .map_err(|e| StratusError::storage(format!("decompressing {name}: {e}")))?
        } else {
            stored
        };

        if let Some(expected) = info.cached_length() {
            if expected != data.len() as u64 {
                return Err(StratusError::storage(format!(
                    "{name}: downloaded {} bytes, expected {expected}",
                    data.len()
                )));
            }
        }

        let temp = format!("{name}.{}{FETCH_SUFFIX}", uuid::Uuid::new_v4().simple());
        let written = self.cache.create_output(&temp).and_then(|mut output| {
            output.write_all(&data)?;
            output.close()
        });
        if let Err(e) = written.and_then(|_| self.cache.rename_file(&temp, name)) {
            if let Err(cleanup) = self.cache.delete_file(&temp) {
                warn!("Failed to remove {temp}: {cleanup}");
            }
            return Err(e);
        }
        debug!("Fetched {name} ({} bytes) into the cache", data.len());
        Ok(())
    }

    /// Open `name` for reading, refreshing the cached copy if needed.
    pub fn open_input(&self, name: &str) -> Result<Box<dyn IndexInput>> {
        let object = self.object_name(name);
        let info = self
            .remote
            .head_object(&object)?
            .ok_or_else(|| StratusError::not_found(name))?;

        if self.is_stale(name, &info)? {
            self.fetch(name, &info)?;
        } else {
            debug!("Serving {name} from the cache");
        }
        self.cache.open_input(name)
    }

    /// Download `name` without touching the cache.
    pub fn read_remote(&self, name: &str) -> Result<Vec<u8>> {
        match self.remote.get_object(&self.object_name(name)) {
            Err(e) if e.is_not_found() => Err(StratusError::not_found(name)),
            other => other,
        }
    }

    /// Upload the cached file `name`, stamping its length and modification time.
    pub fn upload(&self, name: &str) -> Result<()> {
        let mut input = self.cache.open_input(name)?;
        let mut data = Vec::with_capacity(input.length() as usize);
        input.read_to_end(&mut data)?;
        input.close()?;
        drop(input);

        let modified = self.cache.file_modified(name)?;
        let mut metadata = HashMap::new();
        metadata.insert(CACHED_LENGTH_KEY.to_string(), data.len().to_string());
        metadata.insert(CACHED_LAST_MODIFIED_KEY.to_string(), modified.to_string());

        let compress = self.compresses(name);
        metadata.insert(CACHED_COMPRESSED_KEY.to_string(), compress.to_string());

        let object = self.object_name(name);
        if compress {
            let compressed = zstd::encode_all(data.as_slice(), self.compression_level)
                .map_err(|e| StratusError::storage(format!("compressing {name}: {e}")))?;
            debug!(
                "Uploading {name}: {} bytes compressed to {}",
                data.len(),
                compressed.len()
            );
            self.remote.put_object(&object, &compressed, metadata)
        } else {
            debug!("Uploading {name}: {} bytes", data.len());
            self.remote.put_object(&object, &data, metadata)
        }
    }

    /// Create an output that writes to the cache and uploads on close.
    pub fn create_output(
        self: &Arc<Self>,
        name: &str,
        coherence: Arc<CoherenceState>,
    ) -> Result<SyncOutput> {
        let local = self.cache.create_output(name)?;
        Ok(SyncOutput {
            name: name.to_string(),
            local,
            transfer: self.clone(),
            coherence,
            closed: false,
        })
    }
}

/// An output on the local cache that is uploaded when closed.
#[derive(Debug)]
pub struct SyncOutput {
    name: String,
    local: Box<dyn IndexOutput>,
    transfer: Arc<SegmentFileTransfer>,
    coherence: Arc<CoherenceState>,
    closed: bool,
}

impl Write for SyncOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.local.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.local.flush()
    }
}

impl IndexOutput for SyncOutput {
    fn position(&self) -> u64 {
        self.local.position()
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.local.close()?;
        let result = self.transfer.upload(&self.name);
        self.coherence.mark_dirty();
        result
    }
}

impl Drop for SyncOutput {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close() {
                warn!("Failed to upload {} on drop: {e}", self.name);
            }
        }
    }
}
