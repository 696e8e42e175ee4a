//! Background reopening between staleness bounds.
//!
//! The reopener sleeps up to the maximum staleness between reopens while
//! nobody is waiting. A caller blocking in
//! [`NrtManager::wait_for_generation`] wakes it, and it then reopens as soon
//! as the minimum staleness since the previous reopen has passed.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::config::NrtConfig;
use crate::error::{Result, StratusError};
use crate::nrt::manager::{NrtManager, WaitingListener};

#[derive(Debug, Default)]
struct ReopenState {
    finish: bool,
    waiting_gen: u64,
    waiting_needs_deletes: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<ReopenState>,
    wake: Condvar,
}

impl WaitingListener for Shared {
    fn waiting(&self, require_deletes: bool, target_generation: u64) {
        let mut state = self.state.lock();
        state.waiting_gen = state.waiting_gen.max(target_generation);
        state.waiting_needs_deletes |= require_deletes;
        self.wake.notify_all();
    }
}

/// A background thread reopening an [`NrtManager`].
#[derive(Debug)]
pub struct Reopener {
    manager: Arc<NrtManager>,
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Reopener {
    /// Start reopening `manager` within the bounds of `config`.
    pub fn start(manager: Arc<NrtManager>, config: &NrtConfig) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(Shared::default());
        let listener: Arc<dyn WaitingListener> = shared.clone();
        manager.add_waiting_listener(listener);

        let handle = {
            let manager = manager.clone();
            let shared = shared.clone();
            let config = config.clone();
            thread::Builder::new()
                .name("stratus-nrt-reopen".to_string())
                .spawn(move || run(&manager, &shared, &config))
                .map_err(|e| StratusError::other(format!("Failed to spawn reopener: {e}")))?
        };

        Ok(Reopener {
            manager,
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Stop the thread and wait for it. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let Some(handle) = self.handle.lock().take() else {
            return Ok(());
        };
        {
            let mut state = self.shared.state.lock();
            state.finish = true;
            self.shared.wake.notify_all();
        }
        let listener: Arc<dyn WaitingListener> = self.shared.clone();
        self.manager.remove_waiting_listener(&listener);

        handle
            .join()
            .map_err(|_| StratusError::ThreadJoin("reopen thread panicked".to_string()))
    }
}

impl Drop for Reopener {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to stop reopener: {e}");
        }
    }
}

fn run(manager: &NrtManager, shared: &Shared, config: &NrtConfig) {
    let mut last_reopen = Instant::now();

    loop {
        let apply_deletes = {
            let mut state = shared.state.lock();
            let has_waiting = loop {
                if state.finish {
                    return;
                }
                if state.waiting_gen > 0
                    && manager.is_visible(state.waiting_gen, state.waiting_needs_deletes)
                {
                    state.waiting_gen = 0;
                    state.waiting_needs_deletes = false;
                }
                let has_waiting = state.waiting_gen > 0;
                let stale = if has_waiting {
                    config.target_min_stale
                } else {
                    config.target_max_stale
                };
                let deadline = last_reopen + stale;
                if Instant::now() >= deadline {
                    break has_waiting;
                }
                shared.wake.wait_until(&mut state, deadline);
            };

            let apply = if has_waiting {
                state.waiting_needs_deletes || config.apply_all_deletes
            } else {
                config.apply_all_deletes
            };
            if !has_waiting {
                state.waiting_needs_deletes = false;
            }
            apply
        };

        last_reopen = Instant::now();
        match manager.maybe_reopen(apply_deletes) {
            Ok(reopened) => debug!("Background reopen ran (published: {reopened})"),
            Err(e) if manager.is_closed() => {
                debug!("Manager closed, stopping reopener: {e}");
                return;
            }
            Err(e) => warn!("Background reopen failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Document;
    use crate::engine::writer::SegmentedIndexWriter;
    use crate::storage::memory::MemoryDirectory;

    fn manager() -> Arc<NrtManager> {
        let writer = SegmentedIndexWriter::open(Arc::new(MemoryDirectory::new())).unwrap();
        Arc::new(NrtManager::new(Arc::new(writer)).unwrap())
    }

    #[test]
    fn test_waiter_is_served_within_min_staleness() {
        let manager = manager();
        let config = NrtConfig {
            target_min_stale: Duration::from_millis(20),
            target_max_stale: Duration::from_secs(30),
            apply_all_deletes: true,
        };
        let reopener = Reopener::start(manager.clone(), &config).unwrap();

        let generation = manager
            .add_document(Document::new().with_field("id", "1"))
            .unwrap();
        let started = Instant::now();
        let handle = manager.wait_for_generation(generation, true, None).unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(handle.reader().num_docs(), 1);
        drop(handle);

        reopener.close().unwrap();
        reopener.close().unwrap();
    }

    #[test]
    fn test_idle_reopen_after_max_staleness() {
        let manager = manager();
        let config = NrtConfig {
            target_min_stale: Duration::from_millis(10),
            target_max_stale: Duration::from_millis(50),
            apply_all_deletes: true,
        };
        let _reopener = Reopener::start(manager.clone(), &config).unwrap();

        manager
            .add_document(Document::new().with_field("id", "1"))
            .unwrap();
        thread::sleep(Duration::from_millis(300));
        assert_eq!(manager.acquire(true).unwrap().reader().num_docs(), 1);
    }

    #[test]
    fn test_reopener_goes_idle_after_tolerant_wait() {
        let manager = manager();
        let config = NrtConfig {
            target_min_stale: Duration::from_millis(10),
            target_max_stale: Duration::from_secs(30),
            apply_all_deletes: true,
        };
        let reopener = Reopener::start(manager.clone(), &config).unwrap();

        let generation = manager
            .add_document(Document::new().with_field("id", "1"))
            .unwrap();
        let handle = manager.wait_for_generation(generation, false, None).unwrap();
        assert_eq!(handle.reader().num_docs(), 1);
        drop(handle);

        // Every reopen bumps the indexing generation.
        let before = manager.current_indexing_generation();
        thread::sleep(Duration::from_millis(500));
        let reopens = manager.current_indexing_generation() - before;
        assert!(reopens <= 2, "reopener kept spinning: {reopens} reopens");

        reopener.close().unwrap();
    }

    #[test]
    fn test_close_is_prompt() {
        let manager = manager();
        let config = NrtConfig {
            target_min_stale: Duration::from_secs(30),
            target_max_stale: Duration::from_secs(60),
            apply_all_deletes: true,
        };
        let reopener = Reopener::start(manager, &config).unwrap();

        let started = Instant::now();
        reopener.close().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
