//! Dirty-bit and generation-fingerprint tracking for a synced directory.
//!
//! Mutations set the dirty flag without locking. Read paths call
//! [`CoherenceState::check`], which recomputes the fingerprint under the
//! coherence lock only when the flag is set, and otherwise returns the
//! cached verdict.

use std::sync::atomic::{AtomicBool, Ordering};

use log::debug;
use parking_lot::Mutex;

use crate::engine::segment::NO_GENERATION;
use crate::error::Result;

/// Highest commit generation seen locally and remotely at the last check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub local: i64,
    pub remote: i64,
}

impl Fingerprint {
    /// Both sides agree on a real generation.
    pub fn in_sync(&self) -> bool {
        self.local != NO_GENERATION && self.local == self.remote
    }
}

impl Default for Fingerprint {
    fn default() -> Self {
        Fingerprint {
            local: NO_GENERATION,
            remote: NO_GENERATION,
        }
    }
}

/// Coherence state of a local cache against its remote store.
#[derive(Debug)]
pub struct CoherenceState {
    dirty: AtomicBool,
    in_sync: AtomicBool,
    last: Mutex<Fingerprint>,
}

impl Default for CoherenceState {
    fn default() -> Self {
        Self::new()
    }
}

impl CoherenceState {
    /// A dirty state, so the first check computes a fingerprint.
    pub fn new() -> Self {
        CoherenceState {
            dirty: AtomicBool::new(true),
            in_sync: AtomicBool::new(false),
            last: Mutex::new(Fingerprint::default()),
        }
    }

    /// Record that the directory changed.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Fingerprint computed by the last recompute.
    pub fn last_fingerprint(&self) -> Fingerprint {
        *self.last.lock()
    }

    /// Whether the local cache may be trusted, recomputing with `compute`
    /// if the state is dirty.
    ///
    /// The flag is cleared before `compute` runs, so a mutation racing with
    /// the recompute leaves the state dirty for the next caller. A failed
    /// compute restores the flag and propagates the error.
    pub fn check<F>(&self, compute: F) -> Result<bool>
    where
        F: FnOnce() -> Result<Fingerprint>,
    {
        if self.dirty.load(Ordering::Acquire) {
            let mut last = self.last.lock();
            if self.dirty.swap(false, Ordering::AcqRel) {
                match compute() {
                    Ok(fingerprint) => {
                        debug!(
                            "Coherence recomputed: local generation {}, remote generation {}",
                            fingerprint.local, fingerprint.remote
                        );
                        self.in_sync.store(fingerprint.in_sync(), Ordering::Release);
                        *last = fingerprint;
                    }
                    Err(e) => {
                        self.dirty.store(true, Ordering::Release);
                        return Err(e);
                    }
                }
            }
        }
        Ok(self.in_sync.load(Ordering::Acquire))
    }
}
