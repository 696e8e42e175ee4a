//! Index engine interfaces and a reference segmented engine.
//!
//! The NRT layer drives any engine through the [`IndexWriter`] and
//! [`IndexReader`] traits. [`writer::SegmentedIndexWriter`] is a small
//! engine that stores documents in write-once segment files through a
//! [`crate::storage::Directory`]; it exists so the directory and NRT layers
//! can be exercised end to end.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub mod reader;
pub mod segment;
pub mod writer;

/// A document: a set of named string fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    fields: BTreeMap<String, String>,
}

impl Document {
    /// Create an empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field setter.
    pub fn with_field<K: Into<String>, V: Into<String>>(mut self, name: K, value: V) -> Self {
        self.add_field(name, value);
        self
    }

    /// Set a field, replacing any previous value.
    pub fn add_field<K: Into<String>, V: Into<String>>(&mut self, name: K, value: V) {
        self.fields.insert(name.into(), value.into());
    }

    /// Value of a field.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// All fields, ordered by name.
    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    /// Whether the document carries `term`.
    pub fn matches(&self, term: &Term) -> bool {
        self.get(&term.field) == Some(term.text.as_str())
    }
}

/// An exact field value used to select documents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Term {
    pub field: String,
    pub text: String,
}

impl Term {
    pub fn new<F: Into<String>, T: Into<String>>(field: F, text: T) -> Self {
        Term {
            field: field.into(),
            text: text.into(),
        }
    }
}

/// A point-in-time, read-only view of an index.
pub trait IndexReader: Send + Sync + std::fmt::Debug {
    /// Writer change counter this view was opened at.
    fn version(&self) -> u64;

    /// Whether buffered deletes were applied when this view was opened.
    fn deletes_applied(&self) -> bool;

    /// Number of live documents.
    fn num_docs(&self) -> usize;

    /// All live documents.
    fn documents(&self) -> Vec<Document>;

    /// Live documents carrying `term`.
    fn search(&self, term: &Term) -> Vec<Document>;

    /// Release the view. Further closes are no-ops.
    fn close(&self) -> Result<()>;

    /// Whether [`IndexReader::close`] has been called.
    fn is_closed(&self) -> bool;
}

/// A writer accepting mutations and producing readers.
pub trait IndexWriter: Send + Sync + std::fmt::Debug {
    /// Add a document.
    fn add_document(&self, doc: Document) -> Result<()>;

    /// Atomically delete every document carrying `term` and add `doc`.
    fn update_document(&self, term: Term, doc: Document) -> Result<()>;

    /// Delete every document carrying `term`.
    fn delete_documents(&self, term: Term) -> Result<()>;

    /// Delete every document.
    fn delete_all(&self) -> Result<()>;

    /// Durably persist all buffered changes.
    fn commit(&self) -> Result<()>;

    /// Merge the index down to a single segment and commit.
    fn optimize(&self) -> Result<()>;

    /// Open a near-real-time reader over the writer's current state.
    fn open_reader(&self, apply_all_deletes: bool) -> Result<Arc<dyn IndexReader>>;

    /// Open a new reader if the writer has changed since `current` was opened.
    fn open_reader_if_changed(
        &self,
        current: &dyn IndexReader,
        apply_all_deletes: bool,
    ) -> Result<Option<Arc<dyn IndexReader>>>;

    /// Whether there are changes not yet committed.
    fn has_uncommitted_changes(&self) -> bool;

    /// Commit pending changes and release the write lock.
    fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_fields() {
        let mut doc = Document::new().with_field("id", "1");
        doc.add_field("title", "hello");
        doc.add_field("id", "2");

        assert_eq!(doc.get("id"), Some("2"));
        assert_eq!(doc.fields().len(), 2);
        assert!(doc.matches(&Term::new("title", "hello")));
        assert!(!doc.matches(&Term::new("title", "world")));
        assert!(!doc.matches(&Term::new("body", "hello")));
    }
}
