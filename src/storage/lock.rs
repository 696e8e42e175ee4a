//! In-process lock claims.
//!
//! A [`LockRegistry`] records which `(directory, lock name)` pairs are claimed
//! by some lock object in this process. It is passed explicitly to whoever
//! needs it, so two independent directories (or two tests) never share
//! state unless they were given the same registry.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::storage::Lock;

/// Registry of purely local lock claims.
#[derive(Debug, Default)]
pub struct LockRegistry {
    claims: Mutex<HashSet<String>>,
}

impl LockRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Key under which a lock of `directory_id` named `name` is claimed.
    pub fn key(directory_id: &str, name: &str) -> String {
        format!("{directory_id}/{name}")
    }

    /// Claim `key`. Returns `false` if it is already claimed.
    pub fn try_claim(&self, key: &str) -> bool {
        self.claims.lock().insert(key.to_string())
    }

    /// Drop the claim on `key`. Returns whether a claim existed.
    pub fn release(&self, key: &str) -> bool {
        self.claims.lock().remove(key)
    }

    /// Whether `key` is currently claimed.
    pub fn is_claimed(&self, key: &str) -> bool {
        self.claims.lock().contains(key)
    }

    /// Number of live claims.
    pub fn len(&self) -> usize {
        self.claims.lock().len()
    }

    /// Whether there are no live claims.
    pub fn is_empty(&self) -> bool {
        self.claims.lock().is_empty()
    }
}

/// A lock that only excludes other lock objects sharing the same registry.
#[derive(Debug)]
pub struct LocalLock {
    registry: Arc<LockRegistry>,
    key: String,
    name: String,
    held: bool,
}

impl LocalLock {
    /// Create a lock for `name` within the directory identified by `directory_id`.
    pub fn new(registry: Arc<LockRegistry>, directory_id: &str, name: &str) -> Self {
        LocalLock {
            key: LockRegistry::key(directory_id, name),
            registry,
            name: name.to_string(),
            held: false,
        }
    }

    /// Whether this particular lock object holds the claim.
    pub fn is_held(&self) -> bool {
        self.held
    }
}

impl Lock for LocalLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn obtain(&mut self) -> Result<bool> {
        if self.held {
            return Ok(true);
        }
        self.held = self.registry.try_claim(&self.key);
        Ok(self.held)
    }

    fn release(&mut self) -> Result<()> {
        if self.held {
            self.registry.release(&self.key);
            self.held = false;
        }
        Ok(())
    }

    fn is_locked(&mut self) -> Result<bool> {
        Ok(self.registry.is_claimed(&self.key))
    }

    fn break_lock(&mut self) -> Result<()> {
        self.registry.release(&self.key);
        self.held = false;
        Ok(())
    }
}

impl Drop for LocalLock {
    fn drop(&mut self) {
        if self.held {
            self.registry.release(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claims_are_exclusive_per_key() {
        let registry = Arc::new(LockRegistry::new());
        let mut a = LocalLock::new(registry.clone(), "dir-a", "write.lock");
        let mut b = LocalLock::new(registry.clone(), "dir-a", "write.lock");
        let mut other_dir = LocalLock::new(registry.clone(), "dir-b", "write.lock");

        assert!(a.obtain().unwrap());
        assert!(!b.obtain().unwrap());
        assert!(other_dir.obtain().unwrap());
        assert_eq!(registry.len(), 2);

        a.release().unwrap();
        a.release().unwrap();
        assert!(b.obtain().unwrap());
    }

    #[test]
    fn test_drop_releases_claim() {
        let registry = Arc::new(LockRegistry::new());
        {
            let mut lock = LocalLock::new(registry.clone(), "dir", "write.lock");
            assert!(lock.obtain().unwrap());
            assert!(!registry.is_empty());
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_break_lock_clears_foreign_claim() {
        let registry = Arc::new(LockRegistry::new());
        let mut holder = LocalLock::new(registry.clone(), "dir", "write.lock");
        let mut breaker = LocalLock::new(registry.clone(), "dir", "write.lock");

        assert!(holder.obtain().unwrap());
        breaker.break_lock().unwrap();
        assert!(!breaker.is_locked().unwrap());
        assert!(breaker.obtain().unwrap());
    }
}
