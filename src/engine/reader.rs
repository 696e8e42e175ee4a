//! Point-in-time readers of the segmented engine.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::engine::{Document, IndexReader, Term};
use crate::error::Result;

/// Documents of one segment together with the ids deleted in this view.
#[derive(Debug, Clone)]
pub struct ReaderSegment {
    docs: Arc<Vec<Document>>,
    deleted: Arc<HashSet<u32>>,
}

impl ReaderSegment {
    pub fn new(docs: Arc<Vec<Document>>, deleted: Arc<HashSet<u32>>) -> Self {
        ReaderSegment { docs, deleted }
    }

    fn live(&self) -> impl Iterator<Item = &Document> {
        self.docs
            .iter()
            .enumerate()
            .filter(|(id, _)| !self.deleted.contains(&(*id as u32)))
            .map(|(_, doc)| doc)
    }

    fn live_count(&self) -> usize {
        let deleted = self
            .deleted
            .iter()
            .filter(|id| (**id as usize) < self.docs.len())
            .count();
        self.docs.len() - deleted
    }
}

/// An immutable view over a list of segments.
#[derive(Debug)]
pub struct SegmentSnapshotReader {
    version: u64,
    deletes_applied: bool,
    segments: Vec<ReaderSegment>,
    closed: AtomicBool,
}

impl SegmentSnapshotReader {
    pub fn new(version: u64, deletes_applied: bool, segments: Vec<ReaderSegment>) -> Self {
        SegmentSnapshotReader {
            version,
            deletes_applied,
            segments,
            closed: AtomicBool::new(false),
        }
    }

    /// Number of segments in the view, buffered documents included.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }
}

impl IndexReader for SegmentSnapshotReader {
    fn version(&self) -> u64 {
        self.version
    }

    fn deletes_applied(&self) -> bool {
        self.deletes_applied
    }

    fn num_docs(&self) -> usize {
        self.segments.iter().map(ReaderSegment::live_count).sum()
    }

    fn documents(&self) -> Vec<Document> {
        self.segments
            .iter()
            .flat_map(ReaderSegment::live)
            .cloned()
            .collect()
    }

    fn search(&self, term: &Term) -> Vec<Document> {
        self.segments
            .iter()
            .flat_map(ReaderSegment::live)
            .filter(|doc| doc.matches(term))
            .cloned()
            .collect()
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docs(ids: &[&str]) -> Arc<Vec<Document>> {
        Arc::new(
            ids.iter()
                .map(|id| Document::new().with_field("id", *id))
                .collect(),
        )
    }

    #[test]
    fn test_deleted_documents_are_hidden() {
        let reader = SegmentSnapshotReader::new(
            3,
            true,
            vec![
                ReaderSegment::new(docs(&["a", "b", "c"]), Arc::new(HashSet::from([1]))),
                ReaderSegment::new(docs(&["d"]), Arc::new(HashSet::new())),
            ],
        );

        assert_eq!(reader.num_docs(), 3);
        assert_eq!(reader.segment_count(), 2);
        assert!(reader.search(&Term::new("id", "b")).is_empty());
        assert_eq!(reader.search(&Term::new("id", "d")).len(), 1);

        let ids: Vec<_> = reader
            .documents()
            .iter()
            .map(|d| d.get("id").unwrap_or_default().to_string())
            .collect();
        assert_eq!(ids, vec!["a", "c", "d"]);
    }

    #[test]
    fn test_close_is_idempotent() {
        let reader = SegmentSnapshotReader::new(0, false, Vec::new());
        assert!(!reader.is_closed());
        reader.close().unwrap();
        reader.close().unwrap();
        assert!(reader.is_closed());
        assert_eq!(reader.num_docs(), 0);
    }
}
