//! Background commit and optimize scheduling.
//!
//! The committer thread commits the writer every commit interval, and
//! optimizes it when asked to or when the optimize interval has passed since
//! the last optimize. A failed commit is retried with backoff according to
//! the configured [`crate::config::RetryPolicy`]; every outcome is published
//! as a [`CommitterEvent`] to subscribers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::config::CommitterConfig;
use crate::engine::IndexWriter;
use crate::error::{Result, StratusError};

/// Outcome of a background commit or optimize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitterEvent {
    /// A commit succeeded after `attempts` attempts.
    Committed { attempts: u32 },

    /// One commit attempt failed and will be retried.
    CommitFailed { attempt: u32, error: String },

    /// Every attempt failed; the next tick tries again.
    CommitAbandoned { attempts: u32, error: String },

    Optimized,

    OptimizeFailed { error: String },
}

/// Counters of a [`Committer`].
#[derive(Debug, Default)]
pub struct CommitterStats {
    pub commits: AtomicU64,
    pub commit_failures: AtomicU64,
    pub commits_abandoned: AtomicU64,
    pub optimizes: AtomicU64,
    pub optimize_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Wake,
    Stop,
}

struct Shared {
    writer: Arc<dyn IndexWriter>,
    config: CommitterConfig,
    optimize_requested: AtomicBool,
    subscribers: Mutex<Vec<Sender<CommitterEvent>>>,
    stats: CommitterStats,
}

impl Shared {
    fn publish(&self, event: CommitterEvent) {
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    /// Commit with retries. Returns `false` if a stop signal arrived while
    /// backing off.
    fn commit_with_retry(&self, signals: &Receiver<Signal>) -> bool {
        let policy = &self.config.retry;
        let mut attempt = 1;
        loop {
            match self.writer.commit() {
                Ok(()) => {
                    self.stats.commits.fetch_add(1, Ordering::Relaxed);
                    debug!("Background commit succeeded (attempt {attempt})");
                    self.publish(CommitterEvent::Committed { attempts: attempt });
                    return true;
                }
                Err(e) if attempt >= policy.max_attempts => {
                    self.stats.commits_abandoned.fetch_add(1, Ordering::Relaxed);
                    error!("Background commit abandoned after {attempt} attempts: {e}");
                    self.publish(CommitterEvent::CommitAbandoned {
                        attempts: attempt,
                        error: e.to_string(),
                    });
                    return true;
                }
                Err(e) => {
                    self.stats.commit_failures.fetch_add(1, Ordering::Relaxed);
                    let delay = policy.backoff_delay(attempt);
                    warn!("Background commit attempt {attempt} failed, retrying in {delay:?}: {e}");
                    self.publish(CommitterEvent::CommitFailed {
                        attempt,
                        error: e.to_string(),
                    });
                    match signals.recv_timeout(delay) {
                        Ok(Signal::Stop) | Err(RecvTimeoutError::Disconnected) => return false,
                        Ok(Signal::Wake) | Err(RecvTimeoutError::Timeout) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    fn optimize(&self) {
        match self.writer.optimize() {
            Ok(()) => {
                self.stats.optimizes.fetch_add(1, Ordering::Relaxed);
                info!("Background optimize finished");
                self.publish(CommitterEvent::Optimized);
            }
            Err(e) => {
                self.stats.optimize_failures.fetch_add(1, Ordering::Relaxed);
                error!("Background optimize failed: {e}");
                self.publish(CommitterEvent::OptimizeFailed {
                    error: e.to_string(),
                });
            }
        }
    }

    fn run(&self, signals: Receiver<Signal>) {
        let mut last_optimize = Instant::now();
        loop {
            match signals.recv_timeout(self.config.commit_interval) {
                Ok(Signal::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(Signal::Wake) | Err(RecvTimeoutError::Timeout) => {}
            }

            if !self.commit_with_retry(&signals) {
                return;
            }

            let due = last_optimize.elapsed() >= self.config.optimize_interval;
            if self.optimize_requested.swap(false, Ordering::AcqRel) || due {
                self.optimize();
                last_optimize = Instant::now();
            }
        }

        if self.config.commit_on_close {
            if let Err(e) = self.writer.commit() {
                error!("Final commit failed: {e}");
                self.publish(CommitterEvent::CommitAbandoned {
                    attempts: 1,
                    error: e.to_string(),
                });
            }
        }
    }
}

/// A background thread committing and optimizing one writer.
pub struct Committer {
    shared: Arc<Shared>,
    signals: Sender<Signal>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Committer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Committer")
            .field("config", &self.shared.config)
            .field("stats", &self.shared.stats)
            .finish()
    }
}

impl Committer {
    /// Start committing `writer` on the schedule in `config`.
    pub fn start(writer: Arc<dyn IndexWriter>, config: CommitterConfig) -> Result<Self> {
        config.validate()?;
        let (signals, receiver) = unbounded();
        let shared = Arc::new(Shared {
            writer,
            config,
            optimize_requested: AtomicBool::new(false),
            subscribers: Mutex::new(Vec::new()),
            stats: CommitterStats::default(),
        });

        let handle = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("stratus-committer".to_string())
                .spawn(move || shared.run(receiver))
                .map_err(|e| StratusError::other(format!("Failed to spawn committer: {e}")))?
        };

        Ok(Committer {
            shared,
            signals,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> Receiver<CommitterEvent> {
        let (sender, receiver) = unbounded();
        self.shared.subscribers.lock().push(sender);
        receiver
    }

    pub fn stats(&self) -> &CommitterStats {
        &self.shared.stats
    }

    /// Commit without waiting for the next tick.
    pub fn commit_now(&self) {
        let _ = self.signals.send(Signal::Wake);
    }

    /// Commit and optimize without waiting for the next tick.
    pub fn optimize_now(&self) {
        self.shared.optimize_requested.store(true, Ordering::Release);
        let _ = self.signals.send(Signal::Wake);
    }

    /// Stop the thread, after a final commit if configured. Closing twice
    /// is a no-op.
    pub fn close(&self) -> Result<()> {
        let Some(handle) = self.handle.lock().take() else {
            return Ok(());
        };
        let _ = self.signals.send(Signal::Stop);
        handle
            .join()
            .map_err(|_| StratusError::ThreadJoin("committer thread panicked".to_string()))?;
        info!("Committer stopped");
        Ok(())
    }
}

impl Drop for Committer {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to stop committer: {e}");
        }
    }
}

/// Wait up to `timeout` for an event matching `predicate`.
pub fn wait_for_event<F>(
    events: &Receiver<CommitterEvent>,
    timeout: Duration,
    mut predicate: F,
) -> Option<CommitterEvent>
where
    F: FnMut(&CommitterEvent) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.checked_duration_since(Instant::now())?;
        match events.recv_timeout(remaining) {
            Ok(event) if predicate(&event) => return Some(event),
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}
