use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use stratus::config::{LockConfig, NrtConfig, SyncDirectoryConfig};
use stratus::engine::writer::SegmentedIndexWriter;
use stratus::engine::{Document, IndexWriter, Term};
use stratus::nrt::{NrtManager, Reopener};
use stratus::remote::memory::MemoryObjectStore;
use stratus::storage::memory::MemoryDirectory;
use stratus::sync::SyncDirectory;

fn synced_manager(remote: &MemoryObjectStore) -> Arc<NrtManager> {
    let dir = SyncDirectory::new(
        Arc::new(remote.clone()),
        Arc::new(MemoryDirectory::new()),
        SyncDirectoryConfig {
            root_folder: Some("catalog".to_string()),
            compress: true,
            ..SyncDirectoryConfig::default()
        },
        LockConfig::default(),
    )
    .unwrap();
    let writer = SegmentedIndexWriter::open(Arc::new(dir)).unwrap();
    Arc::new(NrtManager::new(Arc::new(writer)).unwrap())
}

fn doc(id: usize) -> Document {
    Document::new()
        .with_field("id", id.to_string())
        .with_field("body", format!("document number {id}"))
}

#[test]
fn test_deletes_visible_at_their_generation() {
    let remote = MemoryObjectStore::new("indexes");
    let manager = synced_manager(&remote);
    let reopener = Reopener::start(
        manager.clone(),
        &NrtConfig {
            target_min_stale: Duration::from_millis(10),
            target_max_stale: Duration::from_secs(1),
            apply_all_deletes: true,
        },
    )
    .unwrap();

    // 1. Index 100 documents and commit
    let g1 = manager.add_documents((0..100).map(doc)).unwrap();
    manager.writer().commit().unwrap();
    let searcher = manager.wait_for_generation(g1, true, None).unwrap();
    assert_eq!(searcher.reader().num_docs(), 100);
    searcher.release().unwrap();

    // 2. Delete 10 of them and commit
    let mut g2 = 0;
    for id in 0..10 {
        g2 = manager
            .delete_documents(Term::new("id", id.to_string()))
            .unwrap();
    }
    manager.writer().commit().unwrap();
    assert!(g2 > g1);

    // 3. Waiting with deletes applied sees exactly the survivors
    let searcher = manager.wait_for_generation(g2, true, None).unwrap();
    assert_eq!(searcher.reader().num_docs(), 90);
    assert!(searcher.reader().search(&Term::new("id", "5")).is_empty());
    searcher.release().unwrap();

    // 4. Without the delete requirement either view is legal
    let searcher = manager.wait_for_generation(g2, false, None).unwrap();
    let visible = searcher.reader().num_docs();
    assert!(visible == 90 || visible == 100, "unexpected {visible} documents");
    searcher.release().unwrap();

    reopener.close().unwrap();
    manager.close().unwrap();
    manager.writer().close().unwrap();
}

#[test]
fn test_readers_survive_concurrent_reopen() {
    const READERS: usize = 8;
    let remote = MemoryObjectStore::new("indexes");
    let manager = synced_manager(&remote);
    manager.add_documents((0..20).map(doc)).unwrap();
    manager.maybe_reopen(true).unwrap();
    let before = manager.acquire(true).unwrap().generation();

    let acquired = Arc::new(Barrier::new(READERS + 1));
    thread::scope(|scope| {
        for _ in 0..READERS {
            let manager = manager.clone();
            let acquired = acquired.clone();
            scope.spawn(move || {
                let searcher = manager.acquire(true).unwrap();
                acquired.wait();
                thread::sleep(Duration::from_millis(50));
                assert!(!searcher.reader().is_closed());
                assert_eq!(searcher.reader().num_docs(), 20);
                searcher.release().unwrap();
            });
        }

        acquired.wait();
        manager.add_document(doc(20)).unwrap();
        assert!(manager.maybe_reopen(true).unwrap());
    });

    let after = manager.acquire(true).unwrap();
    assert!(after.generation() > before);
    assert_eq!(after.reader().num_docs(), 21);
}

#[test]
fn test_superseded_reader_closed_after_last_release() {
    let remote = MemoryObjectStore::new("indexes");
    let manager = synced_manager(&remote);
    manager.add_document(doc(0)).unwrap();
    manager.maybe_reopen(true).unwrap();

    let old = manager.acquire(true).unwrap();
    let old_reader = old.reader().clone();
    manager.add_document(doc(1)).unwrap();
    manager.maybe_reopen(true).unwrap();

    assert!(!old_reader.is_closed());
    old.release().unwrap();
    assert!(old_reader.is_closed());
}

#[test]
fn test_close_twice_and_wakes_waiters() {
    let remote = MemoryObjectStore::new("indexes");
    let manager = synced_manager(&remote);
    let generation = manager.add_document(doc(0)).unwrap();

    thread::scope(|scope| {
        let waiter = scope.spawn(|| manager.wait_for_generation(generation, true, None));
        thread::sleep(Duration::from_millis(50));
        manager.close().unwrap();
        let err = waiter.join().unwrap().unwrap_err();
        assert!(matches!(err, stratus::error::StratusError::AlreadyClosed(_)));
    });
    manager.close().unwrap();
}

#[test]
fn test_reopen_after_writer_restart_reads_remote_commit() {
    let remote = MemoryObjectStore::new("indexes");
    {
        let manager = synced_manager(&remote);
        manager.add_documents((0..5).map(doc)).unwrap();
        manager.writer().commit().unwrap();
        manager.close().unwrap();
        manager.writer().close().unwrap();
    }

    // A fresh process with a cold cache sees the committed documents.
    let manager = synced_manager(&remote);
    manager.maybe_reopen(true).unwrap();
    assert_eq!(manager.acquire(true).unwrap().reader().num_docs(), 5);
}
