//! In-process remote object store.
//!
//! Cloning a [`MemoryObjectStore`] yields another client on the same
//! container, which is how tests simulate several processes sharing one
//! remote index.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{Result, StratusError};
use crate::remote::{LeaseId, ObjectInfo, RemoteObjectStore};
use crate::storage::now_millis;

#[derive(Debug)]
struct Lease {
    id: LeaseId,
    duration: Duration,
    expires_at: Instant,
}

impl Lease {
    fn is_active(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

#[derive(Debug)]
struct StoredObject {
    data: Arc<[u8]>,
    last_modified: u64,
    metadata: HashMap<String, String>,
    lease: Option<Lease>,
}

impl StoredObject {
    fn info(&self, name: &str) -> ObjectInfo {
        ObjectInfo {
            name: name.to_string(),
            size: self.data.len() as u64,
            last_modified: self.last_modified,
            metadata: self.metadata.clone(),
        }
    }

    fn active_lease(&self) -> Option<&Lease> {
        self.lease.as_ref().filter(|lease| lease.is_active())
    }
}

#[derive(Debug, Default)]
struct Container {
    exists: bool,
    objects: BTreeMap<String, StoredObject>,
}

/// Per-operation call counters of a [`MemoryObjectStore`].
#[derive(Debug, Default)]
pub struct RemoteStats {
    pub list_objects: AtomicU64,
    pub head_object: AtomicU64,
    pub get_object: AtomicU64,
    pub put_object: AtomicU64,
    pub delete_object: AtomicU64,
    pub acquire_lease: AtomicU64,
    pub renew_lease: AtomicU64,
    pub release_lease: AtomicU64,
    pub break_lease: AtomicU64,
}

impl RemoteStats {
    /// Total number of metadata calls (listing and head requests).
    pub fn metadata_calls(&self) -> u64 {
        self.list_objects.load(Ordering::Relaxed) + self.head_object.load(Ordering::Relaxed)
    }

    /// Reset every counter to zero.
    pub fn reset(&self) {
        for counter in [
            &self.list_objects,
            &self.head_object,
            &self.get_object,
            &self.put_object,
            &self.delete_object,
            &self.acquire_lease,
            &self.renew_lease,
            &self.release_lease,
            &self.break_lease,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[derive(Debug)]
struct Shared {
    container: Mutex<Container>,
    available: AtomicBool,
    stats: RemoteStats,
}

/// An in-memory object store with lease semantics.
#[derive(Debug, Clone)]
pub struct MemoryObjectStore {
    name: String,
    shared: Arc<Shared>,
}

impl MemoryObjectStore {
    /// Create a client bound to a container that does not exist yet.
    pub fn new(container: &str) -> Self {
        MemoryObjectStore {
            name: container.to_string(),
            shared: Arc::new(Shared {
                container: Mutex::new(Container::default()),
                available: AtomicBool::new(true),
                stats: RemoteStats::default(),
            }),
        }
    }

    /// Call counters shared by every clone of this store.
    pub fn stats(&self) -> &RemoteStats {
        &self.shared.stats
    }

    /// Simulate an outage: while unavailable every call fails.
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::SeqCst);
    }

    /// Delete the container and everything in it.
    pub fn drop_container(&self) {
        let mut container = self.shared.container.lock();
        container.exists = false;
        container.objects.clear();
    }

    /// Number of stored objects.
    pub fn object_count(&self) -> usize {
        self.shared.container.lock().objects.len()
    }

    /// Whether the object currently carries an unexpired lease.
    pub fn is_leased(&self, name: &str) -> bool {
        self.shared
            .container
            .lock()
            .objects
            .get(name)
            .is_some_and(|o| o.active_lease().is_some())
    }

    fn with_container<T>(&self, f: impl FnOnce(&mut Container) -> Result<T>) -> Result<T> {
        if !self.shared.available.load(Ordering::SeqCst) {
            return Err(StratusError::storage(format!(
                "container {} is unreachable",
                self.name
            )));
        }
        let mut container = self.shared.container.lock();
        if !container.exists {
            return Err(StratusError::remote_not_found(format!(
                "container {}",
                self.name
            )));
        }
        f(&mut container)
    }
}

fn object_mut<'a>(container: &'a mut Container, name: &str) -> Result<&'a mut StoredObject> {
    container
        .objects
        .get_mut(name)
        .ok_or_else(|| StratusError::remote_not_found(name))
}

impl RemoteObjectStore for MemoryObjectStore {
    fn container(&self) -> &str {
        &self.name
    }

    fn create_container_if_missing(&self) -> Result<()> {
        if !self.shared.available.load(Ordering::SeqCst) {
            return Err(StratusError::storage(format!(
                "container {} is unreachable",
                self.name
            )));
        }
        self.shared.container.lock().exists = true;
        Ok(())
    }

    fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        self.shared.stats.list_objects.fetch_add(1, Ordering::Relaxed);
        self.with_container(|container| {
            Ok(container
                .objects
                .iter()
                .filter(|(name, _)| name.starts_with(prefix))
                .map(|(name, object)| object.info(name))
                .collect())
        })
    }

    fn head_object(&self, name: &str) -> Result<Option<ObjectInfo>> {
        self.shared.stats.head_object.fetch_add(1, Ordering::Relaxed);
        self.with_container(|container| Ok(container.objects.get(name).map(|o| o.info(name))))
    }

    fn get_object(&self, name: &str) -> Result<Vec<u8>> {
        self.shared.stats.get_object.fetch_add(1, Ordering::Relaxed);
        self.with_container(|container| {
            container
                .objects
                .get(name)
                .map(|o| o.data.to_vec())
                .ok_or_else(|| StratusError::remote_not_found(name))
        })
    }

    fn put_object(&self, name: &str, data: &[u8], metadata: HashMap<String, String>) -> Result<()> {
        self.shared.stats.put_object.fetch_add(1, Ordering::Relaxed);
        self.with_container(|container| {
            // A rewrite keeps the lease of the object it replaces.
            let lease = container.objects.remove(name).and_then(|o| o.lease);
            container.objects.insert(
                name.to_string(),
                StoredObject {
                    data: Arc::from(data),
                    last_modified: now_millis(),
                    metadata,
                    lease,
                },
            );
            Ok(())
        })
    }

    fn delete_object(&self, name: &str) -> Result<bool> {
        self.shared.stats.delete_object.fetch_add(1, Ordering::Relaxed);
        self.with_container(|container| {
            if let Some(object) = container.objects.get(name) {
                if object.active_lease().is_some() {
                    return Err(StratusError::lease_conflict(format!(
                        "{name} is leased and cannot be deleted"
                    )));
                }
            }
            Ok(container.objects.remove(name).is_some())
        })
    }

    fn acquire_lease(&self, name: &str, duration: Duration) -> Result<LeaseId> {
        self.shared.stats.acquire_lease.fetch_add(1, Ordering::Relaxed);
        self.with_container(|container| {
            let object = object_mut(container, name)?;
            if object.active_lease().is_some() {
                return Err(StratusError::lease_conflict(name));
            }
            let id = LeaseId::generate();
            object.lease = Some(Lease {
                id: id.clone(),
                duration,
                expires_at: Instant::now() + duration,
            });
            Ok(id)
        })
    }

    fn renew_lease(&self, name: &str, lease: &LeaseId) -> Result<()> {
        self.shared.stats.renew_lease.fetch_add(1, Ordering::Relaxed);
        self.with_container(|container| {
            let object = object_mut(container, name)?;
            match object.lease.as_mut() {
                Some(current) if current.id == *lease => {
                    current.expires_at = Instant::now() + current.duration;
                    Ok(())
                }
                _ => Err(StratusError::lease_conflict(format!(
                    "{name} is not leased by {lease}"
                ))),
            }
        })
    }

    fn release_lease(&self, name: &str, lease: &LeaseId) -> Result<()> {
        self.shared.stats.release_lease.fetch_add(1, Ordering::Relaxed);
        self.with_container(|container| {
            let object = object_mut(container, name)?;
            match object.lease.as_ref() {
                Some(current) if current.id == *lease => {
                    object.lease = None;
                    Ok(())
                }
                _ => Err(StratusError::lease_conflict(format!(
                    "{name} is not leased by {lease}"
                ))),
            }
        })
    }

    fn break_lease(&self, name: &str) -> Result<()> {
        self.shared.stats.break_lease.fetch_add(1, Ordering::Relaxed);
        self.with_container(|container| {
            object_mut(container, name)?.lease = None;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryObjectStore {
        let store = MemoryObjectStore::new("index");
        store.create_container_if_missing().unwrap();
        store
    }

    #[test]
    fn test_put_get_list() {
        let store = store();
        let metadata = HashMap::from([("CachedLength".to_string(), "3".to_string())]);
        store.put_object("a/_0.fdt", b"abc", metadata).unwrap();
        store.put_object("b/_0.fdt", b"xyz", HashMap::new()).unwrap();

        assert_eq!(store.get_object("a/_0.fdt").unwrap(), b"abc");
        let listed = store.list_objects("a/").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].cached_length(), Some(3));
        assert!(store.head_object("missing").unwrap().is_none());
        assert!(store.get_object("missing").unwrap_err().is_not_found());
    }

    #[test]
    fn test_missing_container() {
        let store = MemoryObjectStore::new("index");
        assert!(store.list_objects("").unwrap_err().is_not_found());

        store.create_container_if_missing().unwrap();
        store.put_object("x", b"1", HashMap::new()).unwrap();
        store.drop_container();
        assert!(store.head_object("x").unwrap_err().is_not_found());
    }

    #[test]
    fn test_lease_lifecycle() {
        let store = store();
        store.put_object("write.lock", b"write.lock", HashMap::new()).unwrap();

        let lease = store
            .acquire_lease("write.lock", Duration::from_secs(60))
            .unwrap();
        let conflict = store
            .acquire_lease("write.lock", Duration::from_secs(60))
            .unwrap_err();
        assert!(matches!(conflict, StratusError::LeaseConflict(_)));
        assert!(store.delete_object("write.lock").is_err());

        store.renew_lease("write.lock", &lease).unwrap();
        assert!(store.renew_lease("write.lock", &LeaseId::generate()).is_err());

        store.release_lease("write.lock", &lease).unwrap();
        assert!(!store.is_leased("write.lock"));

        store
            .acquire_lease("write.lock", Duration::from_secs(60))
            .unwrap();
        store.break_lease("write.lock").unwrap();
        assert!(!store.is_leased("write.lock"));
    }

    #[test]
    fn test_expired_lease_can_be_taken() {
        let store = store();
        store.put_object("write.lock", b"", HashMap::new()).unwrap();
        store
            .acquire_lease("write.lock", Duration::from_millis(20))
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        store
            .acquire_lease("write.lock", Duration::from_secs(60))
            .unwrap();
    }

    #[test]
    fn test_unavailable_store() {
        let store = store();
        store.set_available(false);
        assert!(store.list_objects("").unwrap_err().is_storage_unavailable());
        store.set_available(true);
        assert!(store.list_objects("").is_ok());
    }
}
