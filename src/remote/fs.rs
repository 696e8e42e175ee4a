//! File-system backed object store.
//!
//! Each container is a directory under the store root. An object is a single
//! file holding a one-line JSON header (modification time and metadata)
//! followed by the object bytes; uploads are written to a temporary file and
//! renamed into place, so bytes and metadata change together. Leases are
//! small JSON files created exclusively next to the object they protect.
//!
//! Object names may contain `/`; they are escaped into flat file names.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StratusError};
use crate::remote::{LeaseId, ObjectInfo, RemoteObjectStore};
use crate::storage::now_millis;

const DATA_SUFFIX: &str = ".data";
const LEASE_SUFFIX: &str = ".lease";

#[derive(Debug, Serialize, Deserialize)]
struct ObjectHeader {
    last_modified: u64,
    metadata: HashMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LeaseRecord {
    id: LeaseId,
    duration_ms: u64,
    expires_at: DateTime<Utc>,
}

impl LeaseRecord {
    fn new(id: LeaseId, duration: Duration) -> Self {
        LeaseRecord {
            id,
            duration_ms: duration.as_millis() as u64,
            expires_at: expiry_after(duration),
        }
    }

    fn is_active(&self) -> bool {
        Utc::now() < self.expires_at
    }
}

fn expiry_after(duration: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::milliseconds(duration.as_millis() as i64)
}

fn escape_name(name: &str) -> String {
    name.replace('%', "%25").replace('/', "%2F")
}

fn unescape_name(encoded: &str) -> String {
    encoded.replace("%2F", "/").replace("%25", "%")
}

fn unavailable(context: &str, e: std::io::Error) -> StratusError {
    StratusError::storage(format!("{context}: {e}"))
}

/// An object store kept in a local (or network-mounted) directory.
#[derive(Debug)]
pub struct FsObjectStore {
    container: String,
    container_dir: PathBuf,
}

impl FsObjectStore {
    /// Create a client for `container` under `root`. Nothing is created yet.
    pub fn new<P: AsRef<Path>>(root: P, container: &str) -> Self {
        FsObjectStore {
            container: container.to_string(),
            container_dir: root.as_ref().join(container),
        }
    }

    fn data_path(&self, name: &str) -> PathBuf {
        self.container_dir
            .join(format!("{}{DATA_SUFFIX}", escape_name(name)))
    }

    fn lease_path(&self, name: &str) -> PathBuf {
        self.container_dir
            .join(format!("{}{LEASE_SUFFIX}", escape_name(name)))
    }

    fn ensure_container(&self) -> Result<()> {
        if self.container_dir.is_dir() {
            Ok(())
        } else {
            Err(StratusError::remote_not_found(format!(
                "container {}",
                self.container
            )))
        }
    }

    fn ensure_object(&self, name: &str) -> Result<()> {
        self.ensure_container()?;
        if self.data_path(name).is_file() {
            Ok(())
        } else {
            Err(StratusError::remote_not_found(name))
        }
    }

    /// Open an object file and parse its header, leaving the reader at the payload.
    fn open_object(&self, name: &str) -> Result<Option<(ObjectHeader, u64, BufReader<File>)>> {
        self.ensure_container()?;
        let file = match File::open(self.data_path(name)) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(unavailable(name, e)),
        };
        let total = file.metadata().map_err(|e| unavailable(name, e))?.len();
        let mut reader = BufReader::new(file);
        let mut line = String::new();
        let header_len = reader
            .read_line(&mut line)
            .map_err(|e| unavailable(name, e))? as u64;
        let header: ObjectHeader = serde_json::from_str(line.trim_end())?;
        Ok(Some((header, total.saturating_sub(header_len), reader)))
    }

    fn read_lease(&self, name: &str) -> Result<Option<LeaseRecord>> {
        match fs::read(self.lease_path(name)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(unavailable(name, e)),
        }
    }

    fn write_atomically(&self, target: &Path, bytes: &[u8]) -> Result<()> {
        let tmp = target.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        let context = target.display().to_string();
        let mut file = File::create(&tmp).map_err(|e| unavailable(&context, e))?;
        file.write_all(bytes)
            .and_then(|_| file.sync_all())
            .map_err(|e| unavailable(&context, e))?;
        fs::rename(&tmp, target).map_err(|e| unavailable(&context, e))?;
        Ok(())
    }

    fn check_lease_owner(&self, name: &str, lease: &LeaseId) -> Result<LeaseRecord> {
        match self.read_lease(name)? {
            Some(record) if record.id == *lease => Ok(record),
            _ => Err(StratusError::lease_conflict(format!(
                "{name} is not leased by {lease}"
            ))),
        }
    }
}

impl RemoteObjectStore for FsObjectStore {
    fn container(&self) -> &str {
        &self.container
    }

    fn create_container_if_missing(&self) -> Result<()> {
        fs::create_dir_all(&self.container_dir)
            .map_err(|e| unavailable(&self.container, e))
    }

    fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        self.ensure_container()?;
        let mut objects = Vec::new();
        let entries =
            fs::read_dir(&self.container_dir).map_err(|e| unavailable(&self.container, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| unavailable(&self.container, e))?;
            let file_name = entry.file_name();
            let Some(encoded) = file_name
                .to_str()
                .and_then(|n| n.strip_suffix(DATA_SUFFIX))
            else {
                continue;
            };
            let name = unescape_name(encoded);
            if !name.starts_with(prefix) {
                continue;
            }
            if let Some(info) = self.head_object(&name)? {
                objects.push(info);
            }
        }
        objects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(objects)
    }

    fn head_object(&self, name: &str) -> Result<Option<ObjectInfo>> {
        Ok(self
            .open_object(name)?
            .map(|(header, size, _)| ObjectInfo {
                name: name.to_string(),
                size,
                last_modified: header.last_modified,
                metadata: header.metadata,
            }))
    }

    fn get_object(&self, name: &str) -> Result<Vec<u8>> {
        let (_, size, mut reader) = self
            .open_object(name)?
            .ok_or_else(|| StratusError::remote_not_found(name))?;
        let mut data = Vec::with_capacity(size as usize);
        reader
            .read_to_end(&mut data)
            .map_err(|e| unavailable(name, e))?;
        Ok(data)
    }

    fn put_object(&self, name: &str, data: &[u8], metadata: HashMap<String, String>) -> Result<()> {
        self.ensure_container()?;
        let header = ObjectHeader {
            last_modified: now_millis(),
            metadata,
        };
        let mut bytes = serde_json::to_vec(&header)?;
        bytes.push(b'\n');
        bytes.extend_from_slice(data);
        self.write_atomically(&self.data_path(name), &bytes)
    }

    fn delete_object(&self, name: &str) -> Result<bool> {
        self.ensure_container()?;
        if self.read_lease(name)?.is_some_and(|l| l.is_active()) {
            return Err(StratusError::lease_conflict(format!(
                "{name} is leased and cannot be deleted"
            )));
        }
        if let Err(e) = fs::remove_file(self.lease_path(name)) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Failed to remove lease file of {name}: {e}");
            }
        }
        match fs::remove_file(self.data_path(name)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(unavailable(name, e)),
        }
    }

    fn acquire_lease(&self, name: &str, duration: Duration) -> Result<LeaseId> {
        self.ensure_object(name)?;
        let path = self.lease_path(name);

        // One retry covers clearing an expired lease left by a dead holder.
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let record = LeaseRecord::new(LeaseId::generate(), duration);
                    file.write_all(&serde_json::to_vec(&record)?)
                        .and_then(|_| file.sync_all())
                        .map_err(|e| unavailable(name, e))?;
                    return Ok(record.id);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => match self.read_lease(name)? {
                    Some(record) if record.is_active() => break,
                    _ => {
                        if let Err(e) = fs::remove_file(&path) {
                            if e.kind() != ErrorKind::NotFound {
                                warn!("Failed to clear expired lease on {name}: {e}");
                            }
                        }
                    }
                },
                Err(e) => return Err(unavailable(name, e)),
            }
        }
        Err(StratusError::lease_conflict(name))
    }

    fn renew_lease(&self, name: &str, lease: &LeaseId) -> Result<()> {
        self.ensure_object(name)?;
        let mut record = self.check_lease_owner(name, lease)?;
        record.expires_at = expiry_after(Duration::from_millis(record.duration_ms));
        self.write_atomically(&self.lease_path(name), &serde_json::to_vec(&record)?)
    }

    fn release_lease(&self, name: &str, lease: &LeaseId) -> Result<()> {
        self.ensure_object(name)?;
        self.check_lease_owner(name, lease)?;
        fs::remove_file(self.lease_path(name)).map_err(|e| unavailable(name, e))
    }

    fn break_lease(&self, name: &str) -> Result<()> {
        self.ensure_object(name)?;
        match fs::remove_file(self.lease_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(unavailable(name, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, FsObjectStore) {
        let temp_dir = TempDir::new().unwrap();
        let store = FsObjectStore::new(temp_dir.path(), "index");
        store.create_container_if_missing().unwrap();
        (temp_dir, store)
    }

    #[test]
    fn test_put_head_get_with_nested_names() {
        let (_temp_dir, store) = store();
        let metadata = HashMap::from([("CachedLength".to_string(), "11".to_string())]);
        store
            .put_object("root/_0.fdt", b"hello world", metadata)
            .unwrap();

        let info = store.head_object("root/_0.fdt").unwrap().unwrap();
        assert_eq!(info.size, 11);
        assert_eq!(info.cached_length(), Some(11));
        assert_eq!(store.get_object("root/_0.fdt").unwrap(), b"hello world");

        let listed = store.list_objects("root/").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "root/_0.fdt");
        assert!(store.list_objects("other/").unwrap().is_empty());
    }

    #[test]
    fn test_payload_may_contain_newlines() {
        let (_temp_dir, store) = store();
        store
            .put_object("bin", b"\n\nline\n", HashMap::new())
            .unwrap();
        assert_eq!(store.get_object("bin").unwrap(), b"\n\nline\n");
        assert!(store.delete_object("bin").unwrap());
        assert!(!store.delete_object("bin").unwrap());
    }

    #[test]
    fn test_missing_container_and_object() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsObjectStore::new(temp_dir.path(), "absent");
        assert!(store.head_object("x").unwrap_err().is_not_found());

        store.create_container_if_missing().unwrap();
        assert!(store.head_object("x").unwrap().is_none());
        assert!(
            store
                .acquire_lease("x", Duration::from_secs(1))
                .unwrap_err()
                .is_not_found()
        );
    }

    #[test]
    fn test_lease_exclusivity_and_break() {
        let (temp_dir, store) = store();
        let other = FsObjectStore::new(temp_dir.path(), "index");
        store
            .put_object("write.lock", b"write.lock", HashMap::new())
            .unwrap();

        let lease = store
            .acquire_lease("write.lock", Duration::from_secs(60))
            .unwrap();
        assert!(matches!(
            other.acquire_lease("write.lock", Duration::from_secs(60)),
            Err(StratusError::LeaseConflict(_))
        ));
        store.renew_lease("write.lock", &lease).unwrap();
        assert!(other.release_lease("write.lock", &LeaseId::generate()).is_err());

        other.break_lease("write.lock").unwrap();
        let taken = other
            .acquire_lease("write.lock", Duration::from_secs(60))
            .unwrap();
        assert!(store.renew_lease("write.lock", &lease).is_err());
        other.release_lease("write.lock", &taken).unwrap();
    }

    #[test]
    fn test_expired_lease_is_replaced() {
        let (_temp_dir, store) = store();
        store.put_object("write.lock", b"", HashMap::new()).unwrap();
        store
            .acquire_lease("write.lock", Duration::from_millis(10))
            .unwrap();
        std::thread::sleep(Duration::from_millis(40));
        store
            .acquire_lease("write.lock", Duration::from_secs(60))
            .unwrap();
    }
}
