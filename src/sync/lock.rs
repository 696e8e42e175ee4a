//! Locks shared by every process using the same remote container.
//!
//! A [`DistributedLock`] first claims a purely local lock, so two lock
//! objects in one process settle contention without a network round trip,
//! and only then contends on the remote store. The local claim is never
//! held by a mutex across remote calls.
//!
//! With [`LockStrategy::Lease`] the lock is a lease on a marker object,
//! renewed by a background thread at the configured interval. With
//! [`LockStrategy::MarkerFile`] the lock is the existence of the marker
//! object itself; a holder that crashes leaves the marker behind until
//! [`Lock::break_lock`] deletes it.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Sender, bounded};
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::config::{LockConfig, LockStrategy};
use crate::error::{Result, StratusError};
use crate::remote::{LeaseId, RemoteObjectStore};
use crate::storage::lock::{LocalLock, LockRegistry};
use crate::storage::Lock;

/// Remote object name of a lock: root folder, optional prefix joined with
/// `-`, then the lock name.
pub fn lock_object_name(root_prefix: &str, lock_prefix: Option<&str>, name: &str) -> String {
    match lock_prefix {
        Some(prefix) if !prefix.is_empty() => format!("{root_prefix}{prefix}-{name}"),
        _ => format!("{root_prefix}{name}"),
    }
}

/// Background renewal of a held lease.
///
/// `released` is checked under its mutex by the renewal thread before each
/// renewal and set under the same mutex by [`LeaseRenewer::stop`], so no
/// renewal can start after `stop` returns.
#[derive(Debug)]
struct LeaseRenewer {
    released: Arc<Mutex<bool>>,
    stop: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl LeaseRenewer {
    fn spawn(
        remote: Arc<dyn RemoteObjectStore>,
        object: String,
        lease: LeaseId,
        interval: Duration,
    ) -> Result<Self> {
        let released = Arc::new(Mutex::new(false));
        let (stop, stop_rx) = bounded::<()>(1);
        let flag = released.clone();

        let handle = thread::Builder::new()
            .name(format!("stratus-lease-{object}"))
            .spawn(move || {
                while let Err(crossbeam_channel::RecvTimeoutError::Timeout) =
                    stop_rx.recv_timeout(interval)
                {
                    let released = flag.lock();
                    if *released {
                        break;
                    }
                    match remote.renew_lease(&object, &lease) {
                        Ok(()) => debug!("Renewed lease on {object}"),
                        Err(e) => warn!("Failed to renew lease on {object}: {e}"),
                    }
                }
            })
            .map_err(|e| StratusError::other(format!("Failed to spawn lease renewer: {e}")))?;

        Ok(LeaseRenewer {
            released,
            stop,
            handle: Some(handle),
        })
    }

    /// Stop renewing and wait for the thread. Safe to call more than once.
    fn stop(&mut self) {
        *self.released.lock() = true;
        let _ = self.stop.try_send(());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Lease renewal thread panicked");
            }
        }
    }
}

impl Drop for LeaseRenewer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug)]
struct HeldLease {
    id: LeaseId,
    acquired_at: DateTime<Utc>,
    renewer: LeaseRenewer,
}

/// A lock realized on a remote object store.
#[derive(Debug)]
pub struct DistributedLock {
    name: String,
    object: String,
    remote: Arc<dyn RemoteObjectStore>,
    local: LocalLock,
    config: LockConfig,
    lease: Option<HeldLease>,
    marker_held: bool,
}

impl DistributedLock {
    /// Create a lock named `name` stored as `object` in `remote`, with its
    /// local claim keyed by `directory_id` in `registry`.
    pub fn new(
        remote: Arc<dyn RemoteObjectStore>,
        registry: Arc<LockRegistry>,
        directory_id: &str,
        name: &str,
        object: String,
        config: LockConfig,
    ) -> Self {
        DistributedLock {
            name: name.to_string(),
            object,
            local: LocalLock::new(registry, directory_id, name),
            remote,
            config,
            lease: None,
            marker_held: false,
        }
    }

    /// Remote object backing the lock.
    pub fn object_name(&self) -> &str {
        &self.object
    }

    /// Whether this lock object currently holds the lock.
    pub fn is_held(&self) -> bool {
        self.lease.is_some() || self.marker_held
    }

    /// When the current lease was acquired.
    pub fn acquired_at(&self) -> Option<DateTime<Utc>> {
        self.lease.as_ref().map(|lease| lease.acquired_at)
    }

    fn create_marker(&self) -> Result<()> {
        self.remote.create_container_if_missing()?;
        if self.remote.head_object(&self.object)?.is_none() {
            self.remote
                .put_object(&self.object, self.name.as_bytes(), HashMap::new())?;
        }
        Ok(())
    }

    fn acquire_lease(&self) -> Result<Option<LeaseId>> {
        let duration = self.config.lease_duration;
        let first = self.remote.acquire_lease(&self.object, duration);
        let attempt = match first {
            Err(e) if e.is_not_found() => {
                warn!(
                    "Lock object {} is missing, recreating it and retrying",
                    self.object
                );
                self.create_marker()?;
                self.remote.acquire_lease(&self.object, duration)
            }
            other => other,
        };
        match attempt {
            Ok(id) => Ok(Some(id)),
            Err(StratusError::LeaseConflict(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn obtain_lease(&mut self) -> Result<bool> {
        let Some(id) = self.acquire_lease()? else {
            return Ok(false);
        };
        let renewer = match LeaseRenewer::spawn(
            self.remote.clone(),
            self.object.clone(),
            id.clone(),
            self.config.renew_interval,
        ) {
            Ok(renewer) => renewer,
            Err(e) => {
                let _ = self.remote.release_lease(&self.object, &id);
                return Err(e);
            }
        };
        self.lease = Some(HeldLease {
            id,
            acquired_at: Utc::now(),
            renewer,
        });
        Ok(true)
    }

    fn obtain_marker(&mut self) -> Result<bool> {
        let exists = match self.remote.head_object(&self.object) {
            Err(e) if e.is_not_found() => {
                warn!("Container for lock {} is missing, recreating it", self.object);
                self.remote.create_container_if_missing()?;
                self.remote.head_object(&self.object)?
            }
            other => other?,
        };
        if exists.is_some() {
            return Ok(false);
        }
        self.remote
            .put_object(&self.object, self.name.as_bytes(), HashMap::new())?;
        self.marker_held = true;
        Ok(true)
    }

    fn release_remote(&mut self) -> Result<()> {
        if let Some(mut held) = self.lease.take() {
            held.renewer.stop();
            match self.remote.release_lease(&self.object, &held.id) {
                Ok(()) => {}
                Err(e @ StratusError::LeaseConflict(_)) | Err(e @ StratusError::RemoteNotFound(_)) => {
                    warn!("Lease on {} was already lost: {e}", self.object);
                }
                Err(e) => return Err(e),
            }
        }
        if self.marker_held {
            self.marker_held = false;
            self.remote.delete_object(&self.object)?;
        }
        Ok(())
    }
}

impl Lock for DistributedLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn obtain(&mut self) -> Result<bool> {
        if self.is_held() {
            return Ok(true);
        }
        if !self.local.obtain()? {
            debug!("Lock {} is held within this process", self.name);
            return Ok(false);
        }

        let obtained = match self.config.strategy {
            LockStrategy::Lease => self.obtain_lease(),
            LockStrategy::MarkerFile => self.obtain_marker(),
        };
        match obtained {
            Ok(true) => {
                info!("Obtained lock {}", self.object);
                Ok(true)
            }
            Ok(false) => {
                self.local.release()?;
                debug!("Lock {} is held by another process", self.object);
                Ok(false)
            }
            Err(e) => {
                self.local.release()?;
                Err(e)
            }
        }
    }

    fn release(&mut self) -> Result<()> {
        if !self.is_held() {
            return Ok(());
        }
        let result = self.release_remote();
        self.local.release()?;
        info!("Released lock {}", self.object);
        result
    }

    fn is_locked(&mut self) -> Result<bool> {
        if self.is_held() || self.local.is_locked()? {
            return Ok(true);
        }
        match self.config.strategy {
            LockStrategy::MarkerFile => match self.remote.head_object(&self.object) {
                Ok(info) => Ok(info.is_some()),
                Err(e) if e.is_not_found() => Ok(false),
                Err(e) => Err(e),
            },
            LockStrategy::Lease => {
                match self
                    .remote
                    .acquire_lease(&self.object, self.config.lease_duration)
                {
                    Ok(lease) => {
                        self.remote.release_lease(&self.object, &lease)?;
                        Ok(false)
                    }
                    Err(StratusError::LeaseConflict(_)) => Ok(true),
                    Err(e) if e.is_not_found() => Ok(false),
                    Err(e) => Err(e),
                }
            }
        }
    }

    fn break_lock(&mut self) -> Result<()> {
        if let Some(mut held) = self.lease.take() {
            held.renewer.stop();
        }
        self.marker_held = false;

        let result = match self.config.strategy {
            LockStrategy::Lease => self.remote.break_lease(&self.object),
            LockStrategy::MarkerFile => self.remote.delete_object(&self.object).map(|_| ()),
        };
        self.local.break_lock()?;
        match result {
            Err(e) if e.is_not_found() => {}
            other => other?,
        }
        info!("Broke lock {}", self.object);
        Ok(())
    }
}

impl Drop for DistributedLock {
    fn drop(&mut self) {
        if self.is_held() {
            if let Err(e) = self.release() {
                warn!("Failed to release lock {} on drop: {e}", self.object);
            }
        }
    }
}
