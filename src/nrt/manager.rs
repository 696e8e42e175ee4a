//! Generation tracking over an index writer.
//!
//! Every mutation returns the indexing generation it belongs to. A reopen
//! captures the indexing generation, bumps it, refreshes the snapshot, and
//! publishes the captured value as the searching generation of its track,
//! so a caller holding generation `g` knows its write is visible once the
//! searching generation reaches `g`.
//!
//! Two tracks are kept: one whose snapshots have every buffered delete
//! applied and one that skips buffered deletes. Readers that can tolerate
//! deleted documents for a while can wait on the cheaper track.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::{debug, info};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::engine::{Document, IndexWriter, Term};
use crate::error::{Result, StratusError};
use crate::nrt::searcher::{SearcherHandle, SearcherManager, Warmer};

/// Notified when a caller starts waiting for a generation that is not
/// visible yet.
pub trait WaitingListener: Send + Sync {
    fn waiting(&self, require_deletes: bool, target_generation: u64);
}

#[derive(Debug)]
struct Track {
    searcher: SearcherManager,
    reopen_lock: Mutex<()>,
    searching_gen: AtomicU64,
}

impl Track {
    fn new(searcher: SearcherManager) -> Self {
        Track {
            searcher,
            reopen_lock: Mutex::new(()),
            searching_gen: AtomicU64::new(0),
        }
    }

    fn searching_gen(&self) -> u64 {
        self.searching_gen.load(Ordering::Acquire)
    }
}

/// Near-real-time manager of one index writer.
pub struct NrtManager {
    writer: Arc<dyn IndexWriter>,
    indexing_gen: AtomicU64,
    with_deletes: Track,
    without_deletes: Track,
    wait_lock: Mutex<()>,
    new_generation: Condvar,
    listeners: RwLock<Vec<Arc<dyn WaitingListener>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for NrtManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NrtManager")
            .field("indexing_gen", &self.indexing_gen)
            .field("with_deletes", &self.with_deletes)
            .field("without_deletes", &self.without_deletes)
            .field("closed", &self.closed)
            .finish()
    }
}

impl NrtManager {
    /// Create a manager with no warm-up.
    pub fn new(writer: Arc<dyn IndexWriter>) -> Result<Self> {
        Self::with_warmers(writer, None, None)
    }

    /// Create a manager; each track gets its own optional warmer.
    pub fn with_warmers(
        writer: Arc<dyn IndexWriter>,
        with_deletes_warmer: Option<Warmer>,
        without_deletes_warmer: Option<Warmer>,
    ) -> Result<Self> {
        let with_deletes = SearcherManager::new(writer.clone(), true, with_deletes_warmer)?;
        let without_deletes = SearcherManager::new(writer.clone(), false, without_deletes_warmer)?;
        Ok(NrtManager {
            writer,
            indexing_gen: AtomicU64::new(1),
            with_deletes: Track::new(with_deletes),
            without_deletes: Track::new(without_deletes),
            wait_lock: Mutex::new(()),
            new_generation: Condvar::new(),
            listeners: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn writer(&self) -> &Arc<dyn IndexWriter> {
        &self.writer
    }

    fn track(&self, require_deletes: bool) -> &Track {
        if require_deletes {
            &self.with_deletes
        } else {
            &self.without_deletes
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StratusError::already_closed("NRT manager"))
        } else {
            Ok(())
        }
    }

    fn stamp(&self) -> u64 {
        self.indexing_gen.load(Ordering::Acquire)
    }

    pub fn add_document(&self, doc: Document) -> Result<u64> {
        self.ensure_open()?;
        self.writer.add_document(doc)?;
        Ok(self.stamp())
    }

    pub fn add_documents<I: IntoIterator<Item = Document>>(&self, docs: I) -> Result<u64> {
        self.ensure_open()?;
        for doc in docs {
            self.writer.add_document(doc)?;
        }
        Ok(self.stamp())
    }

    pub fn update_document(&self, term: Term, doc: Document) -> Result<u64> {
        self.ensure_open()?;
        self.writer.update_document(term, doc)?;
        Ok(self.stamp())
    }

    pub fn delete_documents(&self, term: Term) -> Result<u64> {
        self.ensure_open()?;
        self.writer.delete_documents(term)?;
        Ok(self.stamp())
    }

    pub fn delete_all(&self) -> Result<u64> {
        self.ensure_open()?;
        self.writer.delete_all()?;
        Ok(self.stamp())
    }

    /// Generation the next mutation will be stamped with.
    pub fn current_indexing_generation(&self) -> u64 {
        self.stamp()
    }

    /// Newest generation visible on a track.
    pub fn current_searching_generation(&self, require_deletes: bool) -> u64 {
        self.track(require_deletes).searching_gen()
    }

    /// Whether `target` is visible to a reader with the given requirement.
    /// A reader that tolerates unapplied deletes is also served by the
    /// with-deletes track.
    pub fn is_visible(&self, target: u64, require_deletes: bool) -> bool {
        if self.with_deletes.searching_gen() >= target {
            return true;
        }
        !require_deletes && self.without_deletes.searching_gen() >= target
    }

    pub fn add_waiting_listener(&self, listener: Arc<dyn WaitingListener>) {
        self.listeners.write().push(listener);
    }

    pub fn remove_waiting_listener(&self, listener: &Arc<dyn WaitingListener>) {
        self.listeners
            .write()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Acquire the newest snapshot of a track.
    ///
    /// Without the delete requirement, the with-deletes snapshot is returned
    /// when it is at least as new.
    pub fn acquire(&self, require_deletes: bool) -> Result<SearcherHandle> {
        self.ensure_open()?;
        if !require_deletes
            && self.with_deletes.searching_gen() >= self.without_deletes.searching_gen()
        {
            return self.with_deletes.searcher.acquire();
        }
        self.track(require_deletes).searcher.acquire()
    }

    /// Block until `target` is visible, then acquire a snapshot.
    ///
    /// With a timeout (a zero duration means none), the best snapshot
    /// available when the timeout elapses is returned instead. Fails with
    /// [`StratusError::InvalidArgument`] for a generation that was never
    /// handed out and [`StratusError::AlreadyClosed`] once the manager is
    /// closed.
    pub fn wait_for_generation(
        &self,
        target: u64,
        require_deletes: bool,
        timeout: Option<Duration>,
    ) -> Result<SearcherHandle> {
        self.ensure_open()?;
        let current = self.stamp();
        if target > current {
            return Err(StratusError::invalid_argument(format!(
                "target generation {target} is beyond the indexing generation {current}"
            )));
        }

        if !self.is_visible(target, require_deletes) {
            for listener in self.listeners.read().iter() {
                listener.waiting(require_deletes, target);
            }

            let deadline = timeout
                .filter(|t| !t.is_zero())
                .map(|t| Instant::now() + t);
            let mut guard = self.wait_lock.lock();
            while !self.is_visible(target, require_deletes) {
                match deadline {
                    Some(deadline) => {
                        if self.new_generation.wait_until(&mut guard, deadline).timed_out() {
                            debug!("Timed out waiting for generation {target}");
                            break;
                        }
                    }
                    None => self.new_generation.wait(&mut guard),
                }
            }
        }

        self.acquire(require_deletes)
    }

    /// Reopen one track if no other reopen of it is running.
    ///
    /// Returns `true` when the generation captured at the start is now
    /// visible on the track and `false` when another reopen was in progress.
    pub fn maybe_reopen(&self, apply_all_deletes: bool) -> Result<bool> {
        self.ensure_open()?;
        let track = self.track(apply_all_deletes);
        let Some(_guard) = track.reopen_lock.try_lock() else {
            return Ok(false);
        };

        let new_gen = self.indexing_gen.fetch_add(1, Ordering::AcqRel);
        let outcome = track.searcher.maybe_refresh_to(new_gen)?;
        if !outcome.is_visible() {
            return Ok(false);
        }

        track.searching_gen.fetch_max(new_gen, Ordering::AcqRel);
        let _wait = self.wait_lock.lock();
        self.new_generation.notify_all();
        debug!(
            "Generation {new_gen} visible (deletes applied: {apply_all_deletes}, {outcome:?})"
        );
        Ok(true)
    }

    /// Close both tracks and wake every waiter. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.with_deletes
            .searching_gen
            .store(u64::MAX, Ordering::Release);
        self.without_deletes
            .searching_gen
            .store(u64::MAX, Ordering::Release);
        {
            let _wait = self.wait_lock.lock();
            self.new_generation.notify_all();
        }

        let with_result = self.with_deletes.searcher.close();
        let without_result = self.without_deletes.searcher.close();
        info!("Closed NRT manager");
        with_result.and(without_result)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for NrtManager {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::writer::SegmentedIndexWriter;
    use crate::storage::memory::MemoryDirectory;
    use std::thread;

    fn manager() -> Arc<NrtManager> {
        let writer = SegmentedIndexWriter::open(Arc::new(MemoryDirectory::new())).unwrap();
        Arc::new(NrtManager::new(Arc::new(writer)).unwrap())
    }

    fn doc(id: usize) -> Document {
        Document::new().with_field("id", id.to_string())
    }

    #[test]
    fn test_mutations_return_generation_without_blocking() {
        let manager = manager();
        let g1 = manager.add_document(doc(1)).unwrap();
        let g2 = manager.add_document(doc(2)).unwrap();
        assert_eq!(g1, g2);

        assert!(manager.maybe_reopen(true).unwrap());
        let g3 = manager.delete_documents(Term::new("id", "1")).unwrap();
        assert!(g3 > g2);
        assert_eq!(manager.current_searching_generation(true), g2);
    }

    #[test]
    fn test_wait_for_visible_generation_returns_immediately() {
        let manager = manager();
        let generation = manager.add_document(doc(1)).unwrap();
        manager.maybe_reopen(true).unwrap();

        let handle = manager.wait_for_generation(generation, true, None).unwrap();
        assert_eq!(handle.reader().num_docs(), 1);
        assert!(handle.generation() >= generation);
    }

    #[test]
    fn test_wait_is_released_by_reopen() {
        let manager = manager();
        let generation = manager.add_document(doc(1)).unwrap();

        let waiter = {
            let manager = manager.clone();
            thread::spawn(move || {
                let handle = manager.wait_for_generation(generation, true, None).unwrap();
                handle.reader().num_docs()
            })
        };
        thread::sleep(Duration::from_millis(50));
        manager.maybe_reopen(true).unwrap();
        assert_eq!(waiter.join().unwrap(), 1);
    }

    #[test]
    fn test_wait_timeout_returns_best_snapshot() {
        let manager = manager();
        let generation = manager.add_document(doc(1)).unwrap();

        let started = Instant::now();
        let handle = manager
            .wait_for_generation(generation, true, Some(Duration::from_millis(100)))
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(handle.reader().num_docs(), 0);
    }

    #[test]
    fn test_future_generation_is_rejected() {
        let manager = manager();
        let current = manager.current_indexing_generation();
        assert!(matches!(
            manager.wait_for_generation(current + 1, true, None),
            Err(StratusError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_without_deletes_track_is_served_by_with_deletes() {
        let manager = manager();
        let generation = manager.add_document(doc(1)).unwrap();
        manager.maybe_reopen(true).unwrap();

        assert_eq!(manager.current_searching_generation(false), 0);
        let handle = manager
            .wait_for_generation(generation, false, Some(Duration::from_millis(10)))
            .unwrap();
        assert_eq!(handle.reader().num_docs(), 1);
    }

    #[test]
    fn test_reopen_in_progress_is_skipped() {
        use std::sync::Barrier;

        let entered = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));
        let warmer: Warmer = {
            let entered = entered.clone();
            let release = release.clone();
            Box::new(move |reader| {
                if reader.num_docs() > 0 {
                    entered.wait();
                    release.wait();
                }
                Ok(())
            })
        };
        let writer = SegmentedIndexWriter::open(Arc::new(MemoryDirectory::new())).unwrap();
        let manager = Arc::new(NrtManager::with_warmers(Arc::new(writer), Some(warmer), None).unwrap());
        let generation = manager.add_document(doc(1)).unwrap();

        let slow = {
            let manager = manager.clone();
            thread::spawn(move || manager.maybe_reopen(true))
        };
        entered.wait();

        let indexing_before = manager.current_indexing_generation();
        let concurrent = {
            let manager = manager.clone();
            thread::spawn(move || {
                let started = Instant::now();
                let reopened = manager.maybe_reopen(true).unwrap();
                (reopened, started.elapsed())
            })
        };
        let (reopened, elapsed) = concurrent.join().unwrap();
        assert!(!reopened);
        assert!(elapsed < Duration::from_secs(1));
        assert_eq!(manager.current_searching_generation(true), 0);
        assert_eq!(manager.current_indexing_generation(), indexing_before);

        release.wait();
        assert!(slow.join().unwrap().unwrap());
        assert!(manager.current_searching_generation(true) >= generation);
    }

    #[test]
    fn test_listener_is_notified() {
        struct Recorder(Mutex<Vec<(bool, u64)>>);
        impl WaitingListener for Recorder {
            fn waiting(&self, require_deletes: bool, target: u64) {
                self.0.lock().push((require_deletes, target));
            }
        }

        let manager = manager();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let listener: Arc<dyn WaitingListener> = recorder.clone();
        manager.add_waiting_listener(listener.clone());

        let generation = manager.add_document(doc(1)).unwrap();
        manager
            .wait_for_generation(generation, false, Some(Duration::from_millis(10)))
            .unwrap();
        assert_eq!(recorder.0.lock().as_slice(), &[(false, generation)]);

        manager.remove_waiting_listener(&listener);
        manager
            .wait_for_generation(generation, true, Some(Duration::from_millis(10)))
            .unwrap();
        assert_eq!(recorder.0.lock().len(), 1);
    }

    #[test]
    fn test_close_wakes_waiters() {
        let manager = manager();
        let generation = manager.add_document(doc(1)).unwrap();

        let waiter = {
            let manager = manager.clone();
            thread::spawn(move || manager.wait_for_generation(generation, true, None))
        };
        thread::sleep(Duration::from_millis(50));
        manager.close().unwrap();
        manager.close().unwrap();

        assert!(matches!(
            waiter.join().unwrap(),
            Err(StratusError::AlreadyClosed(_))
        ));
        assert!(manager.add_document(doc(2)).is_err());
    }
}
