//! Crash recovery: unclean-open detection, redo replay, archive and
//! promotion of the rebuilt store.

use blocktree::{BlockTree, StoreError, TreeBuilder};

fn builder(dir: &tempfile::TempDir) -> TreeBuilder {
    TreeBuilder::new(dir.path().join("t"))
        .auto_tune(false)
        .b_size(5)
        .cache_bytes(64 * 1024)
}

fn build(dir: &tempfile::TempDir) -> BlockTree<i64, i64> {
    builder(dir).build().unwrap()
}

#[test]
fn crash_recovery_restores_synced_state_plus_redo() {
    let dir = tempfile::tempdir().unwrap();

    {
        let tree = build(&dir);
        tree.create().unwrap();
        for key in 0..1000i64 {
            tree.put(&key, &(key * 2)).unwrap();
        }
        tree.sync().unwrap();
        // These live only in dirty pages and the redo log.
        for key in 1000..1100i64 {
            tree.put(&key, &(key * 2)).unwrap();
        }
        // Dropped without close: the clean flag never gets written.
    }

    let tree = build(&dir);
    let err = tree.open().unwrap_err();
    assert_eq!(StoreError::classify(&err), Some(StoreError::InvalidData));

    tree.recovery().unwrap();
    assert!(tree.open().unwrap());

    assert_eq!(tree.size().unwrap(), 1100);
    for key in 0..1100i64 {
        assert_eq!(tree.get(&key).unwrap(), Some(key * 2), "key {}", key);
    }
    tree.close().unwrap();
}

#[test]
fn recovery_replays_removes_in_order() {
    let dir = tempfile::tempdir().unwrap();

    {
        let tree = build(&dir);
        tree.create().unwrap();
        for key in 0..100i64 {
            tree.put(&key, &key).unwrap();
        }
        tree.sync().unwrap();
        for key in 0..50i64 {
            tree.remove(&key).unwrap();
        }
        tree.put(&7, &777).unwrap(); // re-insert after remove
    }

    let tree = build(&dir);
    assert!(tree.open().is_err());
    tree.recovery().unwrap();
    tree.open().unwrap();

    assert_eq!(tree.size().unwrap(), 51);
    assert_eq!(tree.get(&7).unwrap(), Some(777));
    assert_eq!(tree.get(&10).unwrap(), None);
    assert_eq!(tree.get(&50).unwrap(), Some(50));
    tree.close().unwrap();
}

#[test]
fn recovery_archives_the_broken_files() {
    let dir = tempfile::tempdir().unwrap();

    {
        let tree = build(&dir);
        tree.create().unwrap();
        tree.put(&1, &1).unwrap();
        tree.sync().unwrap();
    }

    let tree = build(&dir);
    assert!(tree.open().is_err());
    tree.recovery().unwrap();

    let names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert!(
        names.iter().any(|n| n.starts_with("t.data.broken.")),
        "missing broken data archive in {:?}",
        names
    );
    assert!(
        names.iter().any(|n| n.starts_with("t.redo.broken.")),
        "missing broken redo archive in {:?}",
        names
    );
    assert!(names.iter().any(|n| n == "t.data"));

    tree.open().unwrap();
    assert_eq!(tree.get(&1).unwrap(), Some(1));
    tree.close().unwrap();
}

#[test]
fn clean_shutdown_skips_recovery_on_reopen() {
    let dir = tempfile::tempdir().unwrap();

    {
        let tree = build(&dir);
        tree.create().unwrap();
        for key in 0..50i64 {
            tree.put(&key, &key).unwrap();
        }
        tree.close().unwrap();
    }

    let free_sidecar = dir.path().join("t.free");
    assert!(free_sidecar.exists(), "clean close must write the sidecar");

    let tree = build(&dir);
    assert!(tree.open().unwrap());
    assert_eq!(tree.size().unwrap(), 50);
    // Opening re-marks the store unclean and drops the sidecar guard.
    assert!(!free_sidecar.exists());
    tree.close().unwrap();
}

#[test]
fn redo_thread_records_survive_a_crash() {
    let dir = tempfile::tempdir().unwrap();

    {
        let tree: BlockTree<i64, i64> = builder(&dir).use_redo_thread(true).build().unwrap();
        tree.create().unwrap();
        for key in 0..200i64 {
            tree.put(&key, &(key + 5)).unwrap();
        }
        // Drop stops the writer thread, draining its queue to the file,
        // but never writes the clean flag.
    }

    let tree = build(&dir);
    assert!(tree.open().is_err());
    tree.recovery().unwrap();
    tree.open().unwrap();

    assert_eq!(tree.size().unwrap(), 200);
    for key in 0..200i64 {
        assert_eq!(tree.get(&key).unwrap(), Some(key + 5));
    }
    tree.close().unwrap();
}

#[test]
fn redo_thread_tree_closes_cleanly() {
    let dir = tempfile::tempdir().unwrap();

    let tree: BlockTree<i64, i64> = builder(&dir).use_redo_thread(true).build().unwrap();
    tree.create().unwrap();
    for key in 0..100i64 {
        tree.put(&key, &key).unwrap();
    }
    tree.close().unwrap();

    assert!(tree.open().unwrap());
    assert_eq!(tree.size().unwrap(), 100);
    tree.close().unwrap();
}

#[test]
fn recovery_from_closed_state_only() {
    let dir = tempfile::tempdir().unwrap();
    let tree = build(&dir);
    tree.create().unwrap();

    let err = tree.recovery().unwrap_err();
    assert_eq!(StoreError::classify(&err), Some(StoreError::InvalidState));
    tree.close().unwrap();
}

#[test]
fn geometry_mismatch_is_invalid_data() {
    let dir = tempfile::tempdir().unwrap();

    {
        let tree = build(&dir);
        tree.create().unwrap();
        tree.put(&1, &1).unwrap();
        tree.close().unwrap();
    }

    // Same files, different b-order: the metadata no longer matches.
    let tree: BlockTree<i64, i64> = TreeBuilder::new(dir.path().join("t"))
        .auto_tune(false)
        .b_size(9)
        .build()
        .unwrap();
    let err = tree.open().unwrap_err();
    assert_eq!(StoreError::classify(&err), Some(StoreError::InvalidData));
}
