//! Reference-counted read snapshots.
//!
//! The manager owns one reference to the current [`SearcherSnapshot`];
//! every [`SearcherHandle`] owns another. Publishing a new snapshot drops
//! the manager's reference to the old one, and whichever party drops the
//! last reference closes the reader, so a reader is never closed while a
//! handle to it is alive.

use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::engine::{IndexReader, IndexWriter};
use crate::error::{Result, StratusError};

/// Callback run on a new reader before it is published.
pub type Warmer = Box<dyn Fn(&dyn IndexReader) -> Result<()> + Send + Sync>;

/// A published reader together with its generation stamp.
#[derive(Debug)]
pub struct SearcherSnapshot {
    reader: Arc<dyn IndexReader>,
    generation: AtomicU64,
    refs: AtomicUsize,
}

impl SearcherSnapshot {
    fn new(reader: Arc<dyn IndexReader>, generation: u64) -> Self {
        SearcherSnapshot {
            reader,
            generation: AtomicU64::new(generation),
            refs: AtomicUsize::new(1),
        }
    }

    pub fn reader(&self) -> &Arc<dyn IndexReader> {
        &self.reader
    }

    /// Highest generation this snapshot is known to reflect.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    fn raise_generation(&self, generation: u64) {
        self.generation.fetch_max(generation, Ordering::AcqRel);
    }

    /// Take a reference unless the count already reached zero.
    fn try_inc_ref(&self) -> bool {
        let mut count = self.refs.load(Ordering::Acquire);
        loop {
            if count == 0 {
                return false;
            }
            match self.refs.compare_exchange_weak(
                count,
                count + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => count = actual,
            }
        }
    }

    fn dec_ref(&self) -> Result<()> {
        let previous = self.refs.fetch_sub(1, Ordering::AcqRel);
        match previous {
            0 => {
                self.refs.store(0, Ordering::Release);
                Err(StratusError::other("snapshot released more often than acquired"))
            }
            1 => {
                debug!("Closing reader of generation {}", self.generation());
                self.reader.close()
            }
            _ => Ok(()),
        }
    }
}

/// A reference to a snapshot, released on [`SearcherHandle::release`] or drop.
#[derive(Debug)]
pub struct SearcherHandle {
    snapshot: Option<Arc<SearcherSnapshot>>,
}

impl SearcherHandle {
    fn new(snapshot: Arc<SearcherSnapshot>) -> Self {
        SearcherHandle {
            snapshot: Some(snapshot),
        }
    }

    /// Release the reference now and report any error closing the reader.
    pub fn release(mut self) -> Result<()> {
        match self.snapshot.take() {
            Some(snapshot) => snapshot.dec_ref(),
            None => Ok(()),
        }
    }
}

impl Deref for SearcherHandle {
    type Target = SearcherSnapshot;

    fn deref(&self) -> &SearcherSnapshot {
        // Only `release` and `drop` take the snapshot, and both consume the handle.
        match &self.snapshot {
            Some(snapshot) => snapshot,
            None => unreachable!("searcher handle used after release"),
        }
    }
}

impl Drop for SearcherHandle {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            if let Err(e) = snapshot.dec_ref() {
                warn!("Failed to release searcher snapshot: {e}");
            }
        }
    }
}

/// Result of a refresh attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A new snapshot was published.
    Refreshed,

    /// The current snapshot already reflects the writer.
    Current,

    /// Another refresh is in progress.
    Busy,
}

impl RefreshOutcome {
    /// Whether the writer state at the start of the refresh is now visible.
    pub fn is_visible(self) -> bool {
        matches!(self, RefreshOutcome::Refreshed | RefreshOutcome::Current)
    }
}

/// Holds and swaps the current snapshot of one writer.
pub struct SearcherManager {
    writer: Arc<dyn IndexWriter>,
    apply_all_deletes: bool,
    current: RwLock<Option<Arc<SearcherSnapshot>>>,
    refresh_lock: Mutex<()>,
    warmer: Option<Warmer>,
}

impl std::fmt::Debug for SearcherManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearcherManager")
            .field("apply_all_deletes", &self.apply_all_deletes)
            .field("current", &self.current)
            .field("warmer", &self.warmer.is_some())
            .finish()
    }
}

impl SearcherManager {
    /// Open the first snapshot of `writer`, at generation 0.
    pub fn new(
        writer: Arc<dyn IndexWriter>,
        apply_all_deletes: bool,
        warmer: Option<Warmer>,
    ) -> Result<Self> {
        let reader = writer.open_reader(apply_all_deletes)?;
        if let Some(warm) = &warmer {
            warm(reader.as_ref())?;
        }
        Ok(SearcherManager {
            writer,
            apply_all_deletes,
            current: RwLock::new(Some(Arc::new(SearcherSnapshot::new(reader, 0)))),
            refresh_lock: Mutex::new(()),
            warmer,
        })
    }

    /// Whether snapshots of this manager have buffered deletes applied.
    pub fn applies_deletes(&self) -> bool {
        self.apply_all_deletes
    }

    /// Take a reference to the current snapshot.
    pub fn acquire(&self) -> Result<SearcherHandle> {
        loop {
            let snapshot = self
                .current
                .read()
                .clone()
                .ok_or_else(|| StratusError::already_closed("searcher manager"))?;
            if snapshot.try_inc_ref() {
                return Ok(SearcherHandle::new(snapshot));
            }
            // Lost a race with a swap that released this snapshot; retry.
        }
    }

    /// Generation of the current snapshot.
    pub fn current_generation(&self) -> Result<u64> {
        self.current
            .read()
            .as_ref()
            .map(|snapshot| snapshot.generation())
            .ok_or_else(|| StratusError::already_closed("searcher manager"))
    }

    /// Refresh if the writer changed, stamping a new snapshot one past the
    /// current generation.
    pub fn maybe_refresh(&self) -> Result<RefreshOutcome> {
        self.refresh(None)
    }

    /// Refresh, stamping the result with `generation`. If the current
    /// snapshot already reflects the writer, its stamp is raised instead.
    pub fn maybe_refresh_to(&self, generation: u64) -> Result<RefreshOutcome> {
        self.refresh(Some(generation))
    }

    fn refresh(&self, stamp: Option<u64>) -> Result<RefreshOutcome> {
        let Some(_guard) = self.refresh_lock.try_lock() else {
            return Ok(RefreshOutcome::Busy);
        };
        let current = self.acquire()?;

        let Some(reader) = self
            .writer
            .open_reader_if_changed(current.reader().as_ref(), self.apply_all_deletes)?
        else {
            if let Some(generation) = stamp {
                current.raise_generation(generation);
            }
            return Ok(RefreshOutcome::Current);
        };

        if let Some(warm) = &self.warmer {
            if let Err(e) = warm(reader.as_ref()) {
                let _ = reader.close();
                return Err(e);
            }
        }

        let generation = stamp.unwrap_or(current.generation() + 1);
        let snapshot = Arc::new(SearcherSnapshot::new(reader, generation));
        let previous = {
            let mut slot = self.current.write();
            if slot.is_none() {
                drop(slot);
                snapshot.dec_ref()?;
                return Err(StratusError::already_closed("searcher manager"));
            }
            slot.replace(snapshot)
        };
        if let Some(previous) = previous {
            previous.dec_ref()?;
        }
        current.release()?;

        info!(
            "Published snapshot at generation {generation} (deletes applied: {})",
            self.apply_all_deletes
        );
        Ok(RefreshOutcome::Refreshed)
    }

    /// Drop the current snapshot. Later acquires fail; open handles stay valid.
    pub fn close(&self) -> Result<()> {
        let previous = self.current.write().take();
        match previous {
            Some(snapshot) => snapshot.dec_ref(),
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.current.read().is_none()
    }
}

impl Drop for SearcherManager {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close searcher manager: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Document;
    use crate::engine::writer::SegmentedIndexWriter;
    use crate::storage::memory::MemoryDirectory;
    use std::sync::atomic::AtomicUsize;

    fn writer() -> Arc<dyn IndexWriter> {
        Arc::new(SegmentedIndexWriter::open(Arc::new(MemoryDirectory::new())).unwrap())
    }

    fn doc(id: usize) -> Document {
        Document::new().with_field("id", id.to_string())
    }

    #[test]
    fn test_refresh_publishes_new_snapshot() {
        let writer = writer();
        let manager = SearcherManager::new(writer.clone(), true, None).unwrap();
        assert_eq!(manager.maybe_refresh().unwrap(), RefreshOutcome::Current);

        writer.add_document(doc(1)).unwrap();
        let old = manager.acquire().unwrap();
        assert_eq!(manager.maybe_refresh().unwrap(), RefreshOutcome::Refreshed);

        let new = manager.acquire().unwrap();
        assert_eq!(old.reader().num_docs(), 0);
        assert_eq!(new.reader().num_docs(), 1);
        assert!(new.generation() > old.generation());
        assert!(!old.reader().is_closed());

        let old_reader = old.reader().clone();
        old.release().unwrap();
        assert!(old_reader.is_closed());
        new.release().unwrap();
    }

    #[test]
    fn test_stamped_refresh_raises_current_generation() {
        let writer = writer();
        let manager = SearcherManager::new(writer.clone(), true, None).unwrap();
        assert_eq!(
            manager.maybe_refresh_to(5).unwrap(),
            RefreshOutcome::Current
        );
        assert_eq!(manager.current_generation().unwrap(), 5);
        assert_eq!(manager.maybe_refresh_to(3).unwrap(), RefreshOutcome::Current);
        assert_eq!(manager.current_generation().unwrap(), 5);
    }

    #[test]
    fn test_warmer_runs_before_publication() {
        let writer = writer();
        let warmed = Arc::new(AtomicUsize::new(0));
        let counter = warmed.clone();
        let warmer: Warmer = Box::new(move |reader| {
            counter.fetch_add(reader.num_docs() + 1, Ordering::SeqCst);
            Ok(())
        });
        let manager = SearcherManager::new(writer.clone(), true, Some(warmer)).unwrap();
        assert_eq!(warmed.load(Ordering::SeqCst), 1);

        writer.add_document(doc(1)).unwrap();
        manager.maybe_refresh().unwrap();
        assert_eq!(warmed.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_failed_warmup_keeps_old_snapshot() {
        let writer = writer();
        let warmer: Warmer = Box::new(|reader| {
            if reader.num_docs() > 0 {
                Err(StratusError::other("warm-up failed"))
            } else {
                Ok(())
            }
        });
        let manager = SearcherManager::new(writer.clone(), true, Some(warmer)).unwrap();
        writer.add_document(doc(1)).unwrap();

        assert!(manager.maybe_refresh().is_err());
        assert_eq!(manager.acquire().unwrap().reader().num_docs(), 0);
    }

    #[test]
    fn test_close_keeps_handles_valid() {
        let writer = writer();
        let manager = SearcherManager::new(writer, true, None).unwrap();
        let handle = manager.acquire().unwrap();

        manager.close().unwrap();
        manager.close().unwrap();
        assert!(manager.is_closed());
        assert!(matches!(
            manager.acquire(),
            Err(StratusError::AlreadyClosed(_))
        ));

        assert!(!handle.reader().is_closed());
        assert_eq!(handle.ref_count(), 1);
        let reader = handle.reader().clone();
        drop(handle);
        assert!(reader.is_closed());
    }
}
