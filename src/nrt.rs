//! Near-real-time search over an [`IndexWriter`](crate::engine::IndexWriter).
//!
//! - [`searcher`]: reference-counted reader snapshots and their refresh.
//! - [`manager`]: generation tracking, so a caller can wait until its own
//!   mutations are visible.
//! - [`reopener`]: background reopening between staleness bounds.
//! - [`committer`]: background commits and optimizes with retry.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use stratus::engine::{Document, Term};
//! use stratus::engine::writer::SegmentedIndexWriter;
//! use stratus::nrt::NrtManager;
//! use stratus::storage::memory::MemoryDirectory;
//!
//! # fn main() -> stratus::error::Result<()> {
//! let writer = SegmentedIndexWriter::open(Arc::new(MemoryDirectory::new()))?;
//! let manager = NrtManager::new(Arc::new(writer))?;
//!
//! manager.add_document(Document::new().with_field("id", "1"))?;
//! let generation = manager.delete_documents(Term::new("id", "1"))?;
//! manager.maybe_reopen(true)?;
//!
//! let searcher = manager.wait_for_generation(generation, true, None)?;
//! assert_eq!(searcher.reader().num_docs(), 0);
//! searcher.release()?;
//! # Ok(())
//! # }
//! ```

pub mod committer;
pub mod manager;
pub mod reopener;
pub mod searcher;

pub use committer::{Committer, CommitterEvent};
pub use manager::{NrtManager, WaitingListener};
pub use reopener::Reopener;
pub use searcher::{RefreshOutcome, SearcherHandle, SearcherManager, Warmer};
