//! Segmented index writer.
//!
//! Documents and delete terms are buffered in memory. A commit flushes the
//! buffered documents into a new write-once segment, writes deletion files
//! for segments that lost documents, writes a new `segments_<gen>` commit
//! point, rewrites `segments.gen`, and finally deletes files that no commit
//! point references any more. Deletes that fail (for example because a
//! directory refuses to delete a file that is still open) are retried on the
//! next commit.
//!
//! Near-real-time readers see buffered documents immediately; buffered
//! delete terms are only applied to a reader opened with
//! `apply_all_deletes = true`.

use std::collections::{BTreeSet, HashSet};
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::engine::reader::{ReaderSegment, SegmentSnapshotReader};
use crate::engine::segment::{
    SEGMENTS_GEN, WRITE_LOCK_NAME, decode_generation_pointer, deletes_file,
    encode_generation_pointer, generation_of, max_generation, segment_name, segments_file_name,
    stored_fields_file,
};
use crate::engine::{Document, IndexReader, IndexWriter, Term};
use crate::error::{Result, StratusError};
use crate::storage::{Directory, Lock};

/// Configuration for [`SegmentedIndexWriter`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexWriterConfig {
    /// How long to wait for the directory's write lock.
    pub write_lock_timeout: Duration,
}

impl Default for IndexWriterConfig {
    fn default() -> Self {
        IndexWriterConfig {
            write_lock_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SegmentMeta {
    name: String,
    doc_count: u32,
    del_gen: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CommitPoint {
    generation: u64,
    segment_counter: u64,
    segments: Vec<SegmentMeta>,
}

impl CommitPoint {
    /// Files this commit point needs, itself included.
    fn files(&self) -> HashSet<String> {
        let mut files = HashSet::new();
        files.insert(segments_file_name(self.generation));
        for segment in &self.segments {
            files.insert(stored_fields_file(&segment.name));
            if segment.del_gen > 0 {
                files.insert(deletes_file(&segment.name, segment.del_gen));
            }
        }
        files
    }
}

#[derive(Debug)]
struct LiveSegment {
    meta: SegmentMeta,
    docs: Arc<Vec<Document>>,
    deleted: Arc<HashSet<u32>>,
}

impl LiveSegment {
    fn live_count(&self) -> usize {
        self.docs.len() - self.deleted.len()
    }

    fn live_docs(&self) -> impl Iterator<Item = &Document> {
        self.docs
            .iter()
            .enumerate()
            .filter(|(id, _)| !self.deleted.contains(&(*id as u32)))
            .map(|(_, doc)| doc)
    }

    /// Deleted ids after also applying `deletes`.
    fn deleted_with(&self, deletes: &[BufferedDelete]) -> HashSet<u32> {
        let mut deleted = (*self.deleted).clone();
        for (id, doc) in self.docs.iter().enumerate() {
            if deletes.iter().any(|d| doc.matches(&d.term)) {
                deleted.insert(id as u32);
            }
        }
        deleted
    }
}

/// A delete term, applied to flushed segments and to the first `upto`
/// buffered documents.
#[derive(Debug)]
struct BufferedDelete {
    term: Term,
    upto: usize,
}

fn buffered_deleted(docs: &[Document], deletes: &[BufferedDelete]) -> HashSet<u32> {
    docs.iter()
        .enumerate()
        .filter(|(id, doc)| deletes.iter().any(|d| *id < d.upto && doc.matches(&d.term)))
        .map(|(id, _)| id as u32)
        .collect()
}

#[derive(Debug)]
struct WriterState {
    segments: Vec<LiveSegment>,
    buffered_docs: Vec<Document>,
    buffered_deletes: Vec<BufferedDelete>,
    generation: u64,
    segment_counter: u64,
    committed_files: HashSet<String>,
    pending_deletes: BTreeSet<String>,
    version: u64,
    uncommitted: bool,
    write_lock: Option<Box<dyn Lock>>,
    closed: bool,
}

/// An index writer storing documents in segment files of a [`Directory`].
#[derive(Debug)]
pub struct SegmentedIndexWriter {
    directory: Arc<dyn Directory>,
    state: Mutex<WriterState>,
}

impl SegmentedIndexWriter {
    /// Open a writer with default settings.
    pub fn open(directory: Arc<dyn Directory>) -> Result<Self> {
        Self::with_config(directory, IndexWriterConfig::default())
    }

    /// Open a writer, loading the latest commit point if there is one.
    pub fn with_config(directory: Arc<dyn Directory>, config: IndexWriterConfig) -> Result<Self> {
        let mut write_lock = directory.make_lock(WRITE_LOCK_NAME);
        write_lock.obtain_timeout(config.write_lock_timeout)?;

        let loaded = match read_latest_commit(directory.as_ref()) {
            Ok(loaded) => loaded,
            Err(e) => {
                let _ = write_lock.release();
                return Err(e);
            }
        };

        let mut state = WriterState {
            segments: Vec::new(),
            buffered_docs: Vec::new(),
            buffered_deletes: Vec::new(),
            generation: 0,
            segment_counter: 0,
            committed_files: HashSet::new(),
            pending_deletes: BTreeSet::new(),
            version: 0,
            uncommitted: false,
            write_lock: Some(write_lock),
            closed: false,
        };

        if let Some((commit, segments)) = loaded {
            info!(
                "Opened index at generation {} with {} segments",
                commit.generation,
                segments.len()
            );
            state.generation = commit.generation;
            state.segment_counter = commit.segment_counter;
            state.committed_files = commit.files();
            state.segments = segments;
        }

        Ok(SegmentedIndexWriter {
            directory,
            state: Mutex::new(state),
        })
    }

    /// Generation of the last commit, 0 before the first commit.
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Number of flushed segments.
    pub fn segment_count(&self) -> usize {
        self.state.lock().segments.len()
    }

    /// Files whose deletion failed and will be retried on the next commit.
    pub fn pending_deletes(&self) -> Vec<String> {
        self.state.lock().pending_deletes.iter().cloned().collect()
    }

    fn mutate<F: FnOnce(&mut WriterState)>(&self, f: F) -> Result<()> {
        let mut state = self.state.lock();
        ensure_open(&state)?;
        f(&mut state);
        state.version += 1;
        state.uncommitted = true;
        Ok(())
    }

    /// Move buffered documents and deletes into segments.
    fn flush(&self, state: &mut WriterState) -> Result<()> {
        let deletes = std::mem::take(&mut state.buffered_deletes);

        if !deletes.is_empty() {
            for segment in state.segments.iter_mut() {
                let deleted = segment.deleted_with(&deletes);
                if deleted.len() != segment.deleted.len() {
                    segment.meta.del_gen += 1;
                    write_deletes(
                        self.directory.as_ref(),
                        &segment.meta.name,
                        segment.meta.del_gen,
                        &deleted,
                    )?;
                    segment.deleted = Arc::new(deleted);
                }
            }
        }

        if !state.buffered_docs.is_empty() {
            let docs = std::mem::take(&mut state.buffered_docs);
            let deleted = buffered_deleted(&docs, &deletes);
            let name = segment_name(state.segment_counter);
            state.segment_counter += 1;

            write_file(
                self.directory.as_ref(),
                &stored_fields_file(&name),
                &bincode::serialize(&docs)?,
            )?;
            let mut meta = SegmentMeta {
                name,
                doc_count: docs.len() as u32,
                del_gen: 0,
            };
            if !deleted.is_empty() {
                meta.del_gen = 1;
                write_deletes(self.directory.as_ref(), &meta.name, 1, &deleted)?;
            }
            debug!("Flushed segment {} with {} documents", meta.name, docs.len());
            state.segments.push(LiveSegment {
                meta,
                docs: Arc::new(docs),
                deleted: Arc::new(deleted),
            });
        }

        state.segments.retain(|segment| segment.live_count() > 0);
        Ok(())
    }

    fn write_commit(&self, state: &mut WriterState) -> Result<()> {
        let commit = CommitPoint {
            generation: state.generation + 1,
            segment_counter: state.segment_counter,
            segments: state.segments.iter().map(|s| s.meta.clone()).collect(),
        };
        let files = commit.files();
        let segments_file = segments_file_name(commit.generation);

        let data_files: Vec<String> = files
            .iter()
            .filter(|name| **name != segments_file)
            .cloned()
            .collect();
        self.directory.sync(&data_files)?;

        write_file(
            self.directory.as_ref(),
            &segments_file,
            &bincode::serialize(&commit)?,
        )?;
        write_file(
            self.directory.as_ref(),
            SEGMENTS_GEN,
            &encode_generation_pointer(commit.generation),
        )?;
        self.directory
            .sync(&[segments_file.clone(), SEGMENTS_GEN.to_string()])?;

        for obsolete in state.committed_files.difference(&files) {
            state.pending_deletes.insert(obsolete.clone());
        }
        state.committed_files = files;
        state.generation = commit.generation;
        state.uncommitted = false;

        info!(
            "Committed generation {} ({} segments)",
            commit.generation,
            commit.segments.len()
        );
        Ok(())
    }

    fn delete_obsolete(&self, state: &mut WriterState) {
        let pending = std::mem::take(&mut state.pending_deletes);
        for name in pending {
            match self.directory.delete_file(&name) {
                Ok(()) => debug!("Deleted obsolete file {name}"),
                Err(e) if e.is_file_in_use() => {
                    debug!("Obsolete file {name} is still in use, retrying later");
                    state.pending_deletes.insert(name);
                }
                Err(e) => {
                    warn!("Failed to delete obsolete file {name}: {e}");
                    state.pending_deletes.insert(name);
                }
            }
        }
    }

    fn commit_locked(&self, state: &mut WriterState) -> Result<()> {
        if state.uncommitted {
            let had_deletes = !state.buffered_deletes.is_empty();
            self.flush(state)?;
            self.write_commit(state)?;
            if had_deletes {
                // Readers that skipped buffered deletes now see them on disk.
                state.version += 1;
            }
        }
        self.delete_obsolete(state);
        Ok(())
    }

    fn build_reader(&self, state: &WriterState, apply_all_deletes: bool) -> SegmentSnapshotReader {
        let apply = apply_all_deletes && !state.buffered_deletes.is_empty();
        let mut segments: Vec<ReaderSegment> = state
            .segments
            .iter()
            .map(|segment| {
                let deleted = if apply {
                    Arc::new(segment.deleted_with(&state.buffered_deletes))
                } else {
                    segment.deleted.clone()
                };
                ReaderSegment::new(segment.docs.clone(), deleted)
            })
            .collect();

        if !state.buffered_docs.is_empty() {
            let deleted = if apply {
                buffered_deleted(&state.buffered_docs, &state.buffered_deletes)
            } else {
                HashSet::new()
            };
            segments.push(ReaderSegment::new(
                Arc::new(state.buffered_docs.clone()),
                Arc::new(deleted),
            ));
        }

        SegmentSnapshotReader::new(state.version, apply_all_deletes, segments)
    }
}

impl IndexWriter for SegmentedIndexWriter {
    fn add_document(&self, doc: Document) -> Result<()> {
        self.mutate(|state| state.buffered_docs.push(doc))
    }

    fn update_document(&self, term: Term, doc: Document) -> Result<()> {
        self.mutate(|state| {
            let upto = state.buffered_docs.len();
            state.buffered_deletes.push(BufferedDelete { term, upto });
            state.buffered_docs.push(doc);
        })
    }

    fn delete_documents(&self, term: Term) -> Result<()> {
        self.mutate(|state| {
            let upto = state.buffered_docs.len();
            state.buffered_deletes.push(BufferedDelete { term, upto });
        })
    }

    fn delete_all(&self) -> Result<()> {
        self.mutate(|state| {
            state.segments.clear();
            state.buffered_docs.clear();
            state.buffered_deletes.clear();
        })
    }

    fn commit(&self) -> Result<()> {
        let mut state = self.state.lock();
        ensure_open(&state)?;
        self.commit_locked(&mut state)
    }

    fn optimize(&self) -> Result<()> {
        let mut state = self.state.lock();
        ensure_open(&state)?;
        self.flush(&mut state)?;

        let needs_merge = state.segments.len() > 1
            || state.segments.iter().any(|s| !s.deleted.is_empty());
        if needs_merge {
            let merged: Vec<Document> = state
                .segments
                .iter()
                .flat_map(LiveSegment::live_docs)
                .cloned()
                .collect();
            let name = segment_name(state.segment_counter);
            state.segment_counter += 1;
            write_file(
                self.directory.as_ref(),
                &stored_fields_file(&name),
                &bincode::serialize(&merged)?,
            )?;
            info!(
                "Merged {} segments into {name} ({} documents)",
                state.segments.len(),
                merged.len()
            );
            state.segments = vec![LiveSegment {
                meta: SegmentMeta {
                    name,
                    doc_count: merged.len() as u32,
                    del_gen: 0,
                },
                docs: Arc::new(merged),
                deleted: Arc::new(HashSet::new()),
            }];
            state.uncommitted = true;
        }
        self.commit_locked(&mut state)
    }

    fn open_reader(&self, apply_all_deletes: bool) -> Result<Arc<dyn IndexReader>> {
        let state = self.state.lock();
        ensure_open(&state)?;
        Ok(Arc::new(self.build_reader(&state, apply_all_deletes)))
    }

    fn open_reader_if_changed(
        &self,
        current: &dyn IndexReader,
        apply_all_deletes: bool,
    ) -> Result<Option<Arc<dyn IndexReader>>> {
        let state = self.state.lock();
        ensure_open(&state)?;
        if current.version() == state.version && current.deletes_applied() == apply_all_deletes {
            return Ok(None);
        }
        Ok(Some(Arc::new(self.build_reader(&state, apply_all_deletes))))
    }

    fn has_uncommitted_changes(&self) -> bool {
        self.state.lock().uncommitted
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        self.commit_locked(&mut state)?;
        if let Some(mut lock) = state.write_lock.take() {
            lock.release()?;
        }
        state.closed = true;
        info!("Closed index writer at generation {}", state.generation);
        Ok(())
    }
}

impl Drop for SegmentedIndexWriter {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if let Some(mut lock) = state.write_lock.take() {
            if let Err(e) = lock.release() {
                warn!("Failed to release write lock: {e}");
            }
        }
    }
}

fn ensure_open(state: &WriterState) -> Result<()> {
    if state.closed {
        Err(StratusError::already_closed("index writer"))
    } else {
        Ok(())
    }
}

fn read_file(directory: &dyn Directory, name: &str) -> Result<Vec<u8>> {
    let mut input = directory.open_input(name)?;
    let mut data = Vec::with_capacity(input.length() as usize);
    input.read_to_end(&mut data)?;
    input.close()?;
    Ok(data)
}

fn write_file(directory: &dyn Directory, name: &str, data: &[u8]) -> Result<()> {
    let mut output = directory.create_output(name)?;
    output.write_all(data)?;
    output.close()
}

fn write_deletes(
    directory: &dyn Directory,
    segment: &str,
    del_gen: u64,
    deleted: &HashSet<u32>,
) -> Result<()> {
    let mut ids: Vec<u32> = deleted.iter().copied().collect();
    ids.sort_unstable();
    write_file(
        directory,
        &deletes_file(segment, del_gen),
        &bincode::serialize(&ids)?,
    )
}

/// Generation of the newest commit point: the higher of the listing and
/// the `segments.gen` pointer, provided that commit point exists.
fn latest_generation(directory: &dyn Directory) -> Result<Option<u64>> {
    let files = directory.list_all()?;
    let listed = max_generation(&files);

    let pointed = if directory.file_exists(SEGMENTS_GEN)? {
        match read_file(directory, SEGMENTS_GEN).and_then(|b| decode_generation_pointer(&b)) {
            Ok(generation) => Some(generation),
            Err(e) => {
                warn!("Ignoring unreadable {SEGMENTS_GEN}: {e}");
                None
            }
        }
    } else {
        None
    };

    if let Some(generation) = pointed {
        if generation as i64 > listed
            && directory.file_exists(&segments_file_name(generation))?
        {
            return Ok(Some(generation));
        }
    }

    Ok(files
        .iter()
        .filter_map(|name| generation_of(name))
        .max())
}

fn read_latest_commit(directory: &dyn Directory) -> Result<Option<(CommitPoint, Vec<LiveSegment>)>> {
    let Some(generation) = latest_generation(directory)? else {
        return Ok(None);
    };
    let commit: CommitPoint =
        bincode::deserialize(&read_file(directory, &segments_file_name(generation))?)?;

    let mut segments = Vec::with_capacity(commit.segments.len());
    for meta in &commit.segments {
        let docs: Vec<Document> =
            bincode::deserialize(&read_file(directory, &stored_fields_file(&meta.name))?)?;
        let deleted: HashSet<u32> = if meta.del_gen > 0 {
            let ids: Vec<u32> =
                bincode::deserialize(&read_file(directory, &deletes_file(&meta.name, meta.del_gen))?)?;
            ids.into_iter().collect()
        } else {
            HashSet::new()
        };
        segments.push(LiveSegment {
            meta: meta.clone(),
            docs: Arc::new(docs),
            deleted: Arc::new(deleted),
        });
    }
    Ok(Some((commit, segments)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryDirectory;

    fn doc(id: usize) -> Document {
        Document::new()
            .with_field("id", id.to_string())
            .with_field("parity", if id % 2 == 0 { "even" } else { "odd" })
    }

    fn writer(dir: &MemoryDirectory) -> SegmentedIndexWriter {
        SegmentedIndexWriter::open(Arc::new(dir.clone())).unwrap()
    }

    #[test]
    fn test_commit_writes_segment_files() {
        let dir = MemoryDirectory::new();
        let writer = writer(&dir);
        for i in 0..10 {
            writer.add_document(doc(i)).unwrap();
        }
        assert!(writer.has_uncommitted_changes());
        writer.commit().unwrap();

        assert!(!writer.has_uncommitted_changes());
        assert_eq!(writer.generation(), 1);
        assert!(dir.file_exists("_0.fdt").unwrap());
        assert!(dir.file_exists("segments_1").unwrap());
        assert!(dir.file_exists(SEGMENTS_GEN).unwrap());
    }

    #[test]
    fn test_nrt_reader_and_buffered_deletes() {
        let dir = MemoryDirectory::new();
        let writer = writer(&dir);
        for i in 0..10 {
            writer.add_document(doc(i)).unwrap();
        }
        writer.commit().unwrap();
        writer.add_document(doc(10)).unwrap();
        writer.delete_documents(Term::new("parity", "odd")).unwrap();

        assert_eq!(writer.open_reader(false).unwrap().num_docs(), 11);
        assert_eq!(writer.open_reader(true).unwrap().num_docs(), 6);

        writer.commit().unwrap();
        assert_eq!(writer.open_reader(false).unwrap().num_docs(), 6);
        assert!(dir.file_exists("_0_1.del").unwrap());
    }

    #[test]
    fn test_update_replaces_earlier_document_only() {
        let dir = MemoryDirectory::new();
        let writer = writer(&dir);
        writer.add_document(doc(1).with_field("v", "1")).unwrap();
        writer
            .update_document(Term::new("id", "1"), doc(1).with_field("v", "2"))
            .unwrap();

        let reader = writer.open_reader(true).unwrap();
        let hits = reader.search(&Term::new("id", "1"));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].get("v"), Some("2"));
    }

    #[test]
    fn test_open_reader_if_changed() {
        let dir = MemoryDirectory::new();
        let writer = writer(&dir);
        let reader = writer.open_reader(true).unwrap();
        assert!(
            writer
                .open_reader_if_changed(reader.as_ref(), true)
                .unwrap()
                .is_none()
        );

        writer.add_document(doc(0)).unwrap();
        let newer = writer
            .open_reader_if_changed(reader.as_ref(), true)
            .unwrap()
            .unwrap();
        assert_eq!(newer.num_docs(), 1);
        assert!(newer.version() > reader.version());
    }

    #[test]
    fn test_reopen_loads_latest_commit() {
        let dir = MemoryDirectory::new();
        {
            let writer = writer(&dir);
            for i in 0..4 {
                writer.add_document(doc(i)).unwrap();
            }
            writer.commit().unwrap();
            writer.delete_documents(Term::new("id", "0")).unwrap();
            writer.close().unwrap();
        }

        let writer = writer(&dir);
        assert_eq!(writer.generation(), 2);
        assert_eq!(writer.open_reader(true).unwrap().num_docs(), 3);
    }

    #[test]
    fn test_write_lock_is_exclusive() {
        let dir = MemoryDirectory::new();
        let first = writer(&dir);
        let config = IndexWriterConfig {
            write_lock_timeout: Duration::from_millis(150),
        };
        let second = SegmentedIndexWriter::with_config(Arc::new(dir.clone()), config.clone());
        assert!(matches!(second, Err(StratusError::LockObtainFailed(_))));

        first.close().unwrap();
        assert!(matches!(
            first.add_document(doc(0)),
            Err(StratusError::AlreadyClosed(_))
        ));
        SegmentedIndexWriter::with_config(Arc::new(dir), config).unwrap();
    }

    #[test]
    fn test_optimize_merges_and_removes_obsolete_files() {
        let dir = MemoryDirectory::new();
        let writer = writer(&dir);
        for round in 0..3 {
            writer.add_document(doc(round)).unwrap();
            writer.commit().unwrap();
        }
        writer.delete_documents(Term::new("id", "0")).unwrap();
        writer.commit().unwrap();
        assert_eq!(writer.segment_count(), 2);

        writer.optimize().unwrap();
        assert_eq!(writer.segment_count(), 1);
        assert_eq!(writer.open_reader(true).unwrap().num_docs(), 2);

        let files = dir.list_all().unwrap();
        let segment_files: Vec<_> = files.iter().filter(|f| f.ends_with(".fdt")).collect();
        assert_eq!(segment_files.len(), 1);
        assert_eq!(max_generation(&files), writer.generation() as i64);
        assert_eq!(files.iter().filter_map(|f| generation_of(f)).count(), 1);
    }

    #[test]
    fn test_delete_of_open_file_is_retried() {
        let dir = MemoryDirectory::new();
        let writer = writer(&dir);
        writer.add_document(doc(0)).unwrap();
        writer.commit().unwrap();

        let held = dir.open_input("segments_1").unwrap();
        writer.add_document(doc(1)).unwrap();
        writer.commit().unwrap();
        assert_eq!(writer.pending_deletes(), vec!["segments_1".to_string()]);
        assert!(dir.file_exists("segments_1").unwrap());

        drop(held);
        writer.commit().unwrap();
        assert!(writer.pending_deletes().is_empty());
        assert!(!dir.file_exists("segments_1").unwrap());
    }

    #[test]
    fn test_delete_all() {
        let dir = MemoryDirectory::new();
        let writer = writer(&dir);
        for i in 0..5 {
            writer.add_document(doc(i)).unwrap();
        }
        writer.commit().unwrap();
        writer.delete_all().unwrap();
        assert_eq!(writer.open_reader(false).unwrap().num_docs(), 0);

        writer.commit().unwrap();
        assert!(!dir.file_exists("_0.fdt").unwrap());
    }
}
