use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use ferry_core::{EngineConfig, EngineError, ErrorKind};
use ferry_ops::{
    CancelTarget, ConflictAction, Conflict, EngineEvent, FixedResolver,
    JobOptions, JobStatus, LocalFs, MemoryFs, Operation, Resolution, ResultDescriptor,
    TransactionManager, TransactionStatus,
};
use tokio::sync::broadcast;

fn config(workers: usize) -> EngineConfig {
    EngineConfig::builder()
        .worker_threads(workers)
        .progress_interval_ms(0u64)
        .build()
        .unwrap()
}

fn manager(fs: &Arc<MemoryFs>) -> TransactionManager {
    TransactionManager::new(fs.clone(), config(4))
}

fn drain(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test(flavor = "multi_thread")]
async fn test_simple_move_and_undo() {
    let fs = Arc::new(MemoryFs::new());
    fs.add_file("/a/f.txt", 5);
    fs.add_dir("/b");
    let mut m = manager(&fs);

    let txn = m.start_transaction("Move 1 item");
    let job = m
        .add_operation(txn, Operation::move_to("/a/f.txt", "/b/f.txt"))
        .unwrap();
    m.commit(txn).unwrap();
    m.run_until_idle().await;

    assert!(!fs.exists(Path::new("/a/f.txt")));
    assert!(fs.is_file("/b/f.txt"));
    assert_eq!(m.job(job).unwrap().status(), JobStatus::Completed);
    assert_eq!(m.transaction(txn).unwrap().status(), TransactionStatus::Completed);
    assert!(m.can_undo());
    assert_eq!(m.undo_description().as_deref(), Some("Undo Move 1 item"));

    let undo = m.undo().unwrap();
    m.run_until_idle().await;

    assert!(fs.is_file("/a/f.txt"));
    assert!(!fs.exists(Path::new("/b/f.txt")));
    assert_eq!(m.transaction(undo).unwrap().status(), TransactionStatus::Completed);
    assert!(!m.can_undo());
    assert!(m.can_redo());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_simple_move_and_undo_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a");
    let b = dir.path().join("b");
    std::fs::create_dir(&a).unwrap();
    std::fs::create_dir(&b).unwrap();
    std::fs::write(a.join("f.txt"), "hello").unwrap();

    let mut m = TransactionManager::new(Arc::new(LocalFs::new()), config(2));
    let txn = m.start_transaction("Move 1 item");
    m.add_operation(txn, Operation::move_to(a.join("f.txt"), b.join("f.txt")))
        .unwrap();
    m.commit(txn).unwrap();
    m.run_until_idle().await;

    assert!(!a.join("f.txt").exists());
    assert_eq!(std::fs::read_to_string(b.join("f.txt")).unwrap(), "hello");

    m.undo().unwrap();
    m.run_until_idle().await;

    assert_eq!(std::fs::read_to_string(a.join("f.txt")).unwrap(), "hello");
    assert!(!b.join("f.txt").exists());
    assert!(!m.can_undo());
    assert!(m.can_redo());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rename_collision_resolved_by_rename() {
    let fs = Arc::new(MemoryFs::new());
    fs.add_file("/d/a.txt", 1);
    fs.add_file("/d/b.txt", 2);
    let mut m = manager(&fs);
    let mut rx = m.subscribe();

    let txn = m.start_transaction("Rename a.txt");
    let job = m
        .add_operation(txn, Operation::rename("/d/a.txt", "b.txt"))
        .unwrap();
    m.commit(txn).unwrap();

    let pending = m.pending_conflicts();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].job_id, job);
    assert_eq!(pending[0].destination, PathBuf::from("/d/b.txt"));
    assert_eq!(
        pending[0].options,
        vec![
            ConflictAction::Skip,
            ConflictAction::Overwrite,
            ConflictAction::Rename,
            ConflictAction::CancelAll
        ]
    );
    assert!(
        drain(&mut rx)
            .iter()
            .any(|e| matches!(e, EngineEvent::ConflictDetected { conflict } if conflict.job_id == job))
    );

    m.resolve_conflict(job, ConflictAction::Rename, None, false)
        .unwrap();
    m.run_until_idle().await;

    let job = m.job(job).unwrap();
    assert_eq!(job.status(), JobStatus::Completed);
    assert_eq!(job.result_path(), Some(Path::new("/d/b (2).txt")));
    assert_eq!(fs.file_len("/d/b (2).txt"), Some(1));
    assert_eq!(fs.file_len("/d/b.txt"), Some(2));
    assert!(!fs.exists(Path::new("/d/a.txt")));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_partial_failure_isolation() {
    let fs = Arc::new(MemoryFs::new());
    fs.add_dir("/dst");
    for i in 0..4 {
        fs.add_file(format!("/src/{i}.txt"), 10);
    }
    fs.fail_on("/src/2.txt", ErrorKind::PermissionDenied);
    let mut m = manager(&fs);
    let mut rx = m.subscribe();

    let txn = m.start_transaction("Move 4 items");
    let jobs: Vec<_> = (0..4)
        .map(|i| {
            m.add_operation(
                txn,
                Operation::move_to(format!("/src/{i}.txt"), format!("/dst/{i}.txt")),
            )
            .unwrap()
        })
        .collect();
    m.commit(txn).unwrap();
    m.run_until_idle().await;

    let t = m.transaction(txn).unwrap();
    assert_eq!(t.status(), TransactionStatus::Failed);
    assert!(t.is_partial());
    assert_eq!(t.summary(), "Moved 3 items, 1 failed");
    assert_eq!(m.job(jobs[2]).unwrap().status(), JobStatus::Failed);

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        EngineEvent::JobError { id, error: ErrorKind::PermissionDenied, .. } if *id == jobs[2]
    )));

    let top = m.undo_stack().pop().unwrap();
    assert_eq!(top.transaction.total_ops(), 3);
    assert!(top.transaction.job(jobs[2]).is_none());

    fs.clear_fault("/src/2.txt");
    fs.clear_touched();
    m.undo().unwrap();
    m.run_until_idle().await;

    let touched = fs.touched();
    assert!(!touched.contains(&PathBuf::from("/src/2.txt")));
    assert!(!touched.contains(&PathBuf::from("/dst/2.txt")));
    for i in [0, 1, 3] {
        assert!(fs.is_file(format!("/src/{i}.txt")));
    }
    assert!(fs.is_file("/src/2.txt"));
    assert!(!m.can_undo());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancellation_during_recursive_copy() {
    let fs = Arc::new(MemoryFs::new().with_latency(Duration::from_millis(5)));
    for i in 0..40 {
        fs.add_file(format!("/big/{i:02}.bin"), 100);
    }
    fs.add_dir("/out");
    let mut m = TransactionManager::new(fs.clone(), config(1));

    let txn = m.start_transaction("Copy big");
    let job = m
        .add_operation(txn, Operation::copy("/big", "/out/big"))
        .unwrap();
    m.commit(txn).unwrap();

    for _ in 0..1000 {
        m.poll();
        if fs.files_written() >= 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    m.cancel(CancelTarget::Job(job)).unwrap();
    m.run_until_idle().await;

    let written = fs.files_written();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fs.files_written(), written);
    assert!(written < 40);

    let job = m.job(job).unwrap();
    assert_eq!(job.status(), JobStatus::Completed);
    assert!(job.is_partial());
    let outcome = job.outcome.as_ref().unwrap();
    // One directory entry plus forty files.
    assert_eq!(outcome.files_done as usize + outcome.skipped.len(), 41);
    assert!(outcome.skipped.iter().all(|s| s.kind == ErrorKind::Cancelled));
    for skipped in &outcome.skipped {
        let copied = Path::new("/out/big").join(skipped.path.file_name().unwrap());
        assert!(!fs.exists(&copied));
    }
    assert!(matches!(
        job.result(),
        Some(ResultDescriptor::Partial { .. })
    ));
    // Copies never enter the history.
    assert!(!m.can_undo());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_apply_to_all_resolver_called_once() {
    let fs = Arc::new(MemoryFs::new());
    for name in ["x", "y", "z"] {
        fs.add_file(format!("/src/{name}"), 7);
        fs.add_file(format!("/dst/{name}"), 1);
    }
    let mut m = manager(&fs);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    m.set_conflict_resolver(move |_: &Conflict| {
        counter.fetch_add(1, Ordering::SeqCst);
        Resolution::for_all(ConflictAction::Overwrite)
    });

    let txn = m.start_transaction("Copy 3 items");
    for name in ["x", "y", "z"] {
        m.add_operation(
            txn,
            Operation::copy(format!("/src/{name}"), format!("/dst/{name}")),
        )
        .unwrap();
    }
    m.commit(txn).unwrap();
    m.run_until_idle().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for name in ["x", "y", "z"] {
        assert_eq!(fs.file_len(format!("/dst/{name}")), Some(7));
    }
    assert_eq!(
        m.transaction(txn).unwrap().status(),
        TransactionStatus::Completed
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_apply_to_all_on_held_conflicts() {
    let fs = Arc::new(MemoryFs::new());
    for name in ["x", "y", "z"] {
        fs.add_file(format!("/src/{name}"), 7);
        fs.add_file(format!("/dst/{name}"), 1);
    }
    fs.add_file("/src/free", 3);
    let mut m = manager(&fs);

    let txn = m.start_transaction("Move 4 items");
    for name in ["x", "y", "z", "free"] {
        m.add_operation(
            txn,
            Operation::move_to(format!("/src/{name}"), format!("/dst/{name}")),
        )
        .unwrap();
    }
    m.commit(txn).unwrap();
    m.run_until_idle().await;

    let held: Vec<_> = m.pending_conflicts().iter().map(|c| c.job_id).collect();
    assert_eq!(held.len(), 3);
    assert!(!m.transaction(txn).unwrap().is_terminal());

    m.resolve_conflict(held[0], ConflictAction::Skip, None, true)
        .unwrap();
    m.run_until_idle().await;

    assert!(m.pending_conflicts().is_empty());
    for id in &held {
        assert_eq!(m.job(*id).unwrap().status(), JobStatus::Cancelled);
    }
    let t = m.transaction(txn).unwrap();
    assert_eq!(t.status(), TransactionStatus::Completed);
    assert!(t.is_partial());
    assert_eq!(t.summary(), "Moved 1 item, 3 skipped");
    assert!(fs.is_file("/dst/free"));
    assert_eq!(fs.file_len("/dst/x"), Some(1));
    assert_eq!(m.undo_stack().last().unwrap().transaction.total_ops(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_all_from_conflict() {
    let fs = Arc::new(MemoryFs::new());
    fs.add_file("/src/a", 1);
    fs.add_file("/src/b", 1);
    fs.add_file("/dst/a", 1);
    let mut m = manager(&fs);
    m.set_conflict_resolver(FixedResolver(ConflictAction::CancelAll));

    let txn = m.start_transaction("Move 2 items");
    m.add_operation(txn, Operation::move_to("/src/a", "/dst/a"))
        .unwrap();
    let b = m
        .add_operation(txn, Operation::move_to("/src/b", "/dst/b"))
        .unwrap();
    m.commit(txn).unwrap();
    m.run_until_idle().await;

    let t = m.transaction(txn).unwrap();
    assert_eq!(t.status(), TransactionStatus::Cancelled);
    assert!(t.jobs().all(|j| j.is_terminal()));
    assert_ne!(m.job(b).unwrap().status(), JobStatus::Failed);
    assert!(fs.is_file("/src/a"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_redo_invalidated_by_new_work() {
    let fs = Arc::new(MemoryFs::new());
    fs.add_file("/a/f.txt", 5);
    fs.add_dir("/b");
    let mut m = manager(&fs);

    let txn = m.start_transaction("Move 1 item");
    m.add_operation(txn, Operation::move_to("/a/f.txt", "/b/f.txt"))
        .unwrap();
    m.commit(txn).unwrap();
    m.run_until_idle().await;
    m.undo().unwrap();
    m.run_until_idle().await;
    assert!(m.can_redo());

    let mut rx = m.subscribe();
    let other = m.start_transaction("Create folder");
    m.add_operation(other, Operation::create_folder("/c")).unwrap();
    m.commit(other).unwrap();
    m.run_until_idle().await;

    assert!(!m.can_redo());
    assert!(m.redo_stack().is_empty());
    assert!(
        drain(&mut rx)
            .iter()
            .any(|e| matches!(e, EngineEvent::CanRedoChanged { can_redo: false }))
    );
    assert!(matches!(m.redo(), Err(EngineError::NothingToRedo)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_undo_round_trip_restores_tree() {
    let fs = Arc::new(MemoryFs::new());
    fs.add_file("/w/a.txt", 1);
    fs.add_file("/w/b.txt", 2);
    fs.add_dir("/v");
    let before = fs.paths();
    let mut m = manager(&fs);

    let txn = m.start_transaction("Tidy up");
    m.add_operation(txn, Operation::create_folder("/w/new"))
        .unwrap();
    m.add_operation(txn, Operation::rename("/w/a.txt", "z.txt"))
        .unwrap();
    m.add_operation(txn, Operation::move_to("/w/b.txt", "/v/b.txt"))
        .unwrap();
    m.commit(txn).unwrap();
    m.run_until_idle().await;
    assert_ne!(fs.paths(), before);

    m.undo().unwrap();
    assert!(matches!(m.undo(), Err(EngineError::HistoryBusy)));
    m.run_until_idle().await;
    assert_eq!(fs.paths(), before);

    m.redo().unwrap();
    m.run_until_idle().await;
    assert!(fs.is_dir("/w/new"));
    assert!(fs.is_file("/w/z.txt"));
    assert!(fs.is_file("/v/b.txt"));
    assert!(m.can_undo());
    assert!(!m.can_redo());

    m.undo().unwrap();
    m.run_until_idle().await;
    assert_eq!(fs.paths(), before);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_trash_undo_and_empty_trash_not_recorded() {
    let fs = Arc::new(MemoryFs::new());
    fs.add_file("/docs/old.txt", 4);
    let mut m = manager(&fs);

    let txn = m.start_transaction("Trash 1 item");
    let job = m
        .add_operation(txn, Operation::trash("/docs/old.txt"))
        .unwrap();
    m.commit(txn).unwrap();
    m.run_until_idle().await;
    assert!(!fs.exists(Path::new("/docs/old.txt")));
    assert!(m.job(job).unwrap().outcome.as_ref().unwrap().trash_item.is_some());

    m.undo().unwrap();
    m.run_until_idle().await;
    assert_eq!(fs.file_len("/docs/old.txt"), Some(4));

    m.redo().unwrap();
    m.run_until_idle().await;
    assert!(!fs.exists(Path::new("/docs/old.txt")));
    assert_eq!(m.undo_stack().len(), 1);

    let empty = m.start_transaction("Empty trash");
    m.add_operation(empty, Operation::empty_trash()).unwrap();
    m.commit(empty).unwrap();
    m.run_until_idle().await;

    assert_eq!(fs.trash_len(), 0);
    assert_eq!(m.undo_stack().len(), 1);
    assert_eq!(m.undo_description().as_deref(), Some("Undo Trash 1 item"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_partial_undo_keeps_remaining_entry() {
    let fs = Arc::new(MemoryFs::new());
    fs.add_file("/a/1.txt", 1);
    fs.add_file("/a/2.txt", 2);
    fs.add_dir("/b");
    let mut m = manager(&fs);
    m.set_conflict_resolver(FixedResolver(ConflictAction::Skip));

    let txn = m.start_transaction("Move 2 items");
    m.add_operation(txn, Operation::move_to("/a/1.txt", "/b/1.txt"))
        .unwrap();
    m.add_operation(txn, Operation::move_to("/a/2.txt", "/b/2.txt"))
        .unwrap();
    m.commit(txn).unwrap();
    m.run_until_idle().await;

    // Something new now occupies one of the original locations.
    fs.add_file("/a/1.txt", 99);
    m.undo().unwrap();
    m.run_until_idle().await;

    assert!(fs.is_file("/a/2.txt"));
    assert!(fs.is_file("/b/1.txt"));
    assert_eq!(fs.file_len("/a/1.txt"), Some(99));

    assert_eq!(m.redo_stack().len(), 1);
    assert_eq!(m.redo_stack()[0].transaction.total_ops(), 1);
    assert_eq!(m.undo_stack().len(), 1);
    assert_eq!(m.undo_stack()[0].transaction.total_ops(), 1);
    assert_eq!(
        m.undo_description().as_deref(),
        Some("Undo Move 2 items (remaining)")
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_undo_with_nothing_reversed_leaves_history() {
    let fs = Arc::new(MemoryFs::new());
    fs.add_dir("/d");
    let mut m = manager(&fs);

    let txn = m.start_transaction("Create folder");
    m.add_operation(txn, Operation::create_folder("/d/x")).unwrap();
    m.commit(txn).unwrap();
    m.run_until_idle().await;

    fs.fail_on("/d/x", ErrorKind::PermissionDenied);
    let undo = m.undo().unwrap();
    m.run_until_idle().await;

    assert_eq!(m.transaction(undo).unwrap().status(), TransactionStatus::Failed);
    assert!(m.can_undo());
    assert!(!m.can_redo());
    assert_eq!(m.undo_stack()[0].transaction.id, txn);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_auto_rename_copy() {
    let fs = Arc::new(MemoryFs::new());
    fs.add_file("/a/f.txt", 3);
    let mut m = manager(&fs);

    let txn = m.start_transaction("Duplicate");
    let job = m
        .add_operation_with(
            txn,
            Operation::copy("/a/f.txt", "/a/f.txt"),
            JobOptions::auto_rename(),
        )
        .unwrap();
    m.commit(txn).unwrap();
    assert!(m.pending_conflicts().is_empty());
    m.run_until_idle().await;

    assert_eq!(
        m.job(job).unwrap().result_path(),
        Some(Path::new("/a/f (Copy).txt"))
    );
    assert_eq!(fs.file_len("/a/f (Copy).txt"), Some(3));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disallowed_action_skips() {
    let fs = Arc::new(MemoryFs::new());
    fs.add_dir("/d/existing");
    let mut m = manager(&fs);
    m.set_conflict_resolver(FixedResolver(ConflictAction::Overwrite));

    let txn = m.start_transaction("New folder");
    let job = m
        .add_operation(txn, Operation::create_folder("/d/existing"))
        .unwrap();
    m.commit(txn).unwrap();
    m.run_until_idle().await;

    assert_eq!(m.job(job).unwrap().status(), JobStatus::Cancelled);
    let t = m.transaction(txn).unwrap();
    assert_eq!(t.status(), TransactionStatus::Completed);
    assert!(!t.is_partial());
    assert!(!m.can_undo());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cross_device_move_and_undo() {
    let fs = Arc::new(MemoryFs::new());
    fs.add_device("/mnt/usb");
    fs.add_file("/home/photos/1.jpg", 100);
    fs.add_file("/home/photos/raw/2.raw", 200);
    let before = fs.paths();
    let mut m = manager(&fs);

    let txn = m.start_transaction("Move photos");
    m.add_operation(txn, Operation::move_to("/home/photos", "/mnt/usb/photos"))
        .unwrap();
    m.commit(txn).unwrap();
    m.run_until_idle().await;

    assert_eq!(fs.file_len("/mnt/usb/photos/raw/2.raw"), Some(200));
    assert!(!fs.exists(Path::new("/home/photos")));
    assert_eq!(m.transaction(txn).unwrap().bytes_done(), 300);

    m.undo().unwrap();
    m.run_until_idle().await;
    assert_eq!(fs.paths(), before);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_registration_errors() {
    let fs = Arc::new(MemoryFs::new());
    let mut m = manager(&fs);

    let txn = m.start_transaction("Bad");
    let err = m
        .add_operation(txn, Operation::rename("/d/a.txt", "x/y"))
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidOperation { .. }));

    m.commit(txn).unwrap();
    assert!(matches!(
        m.add_operation(txn, Operation::create_folder("/z")),
        Err(EngineError::AlreadyCommitted { .. }) | Err(EngineError::UnknownTransaction { .. })
    ));
    assert!(matches!(m.undo(), Err(EngineError::NothingToUndo)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_before_commit() {
    let fs = Arc::new(MemoryFs::new());
    fs.add_dir("/d");
    let mut m = manager(&fs);
    let mut rx = m.subscribe();

    let txn = m.start_transaction("Never run");
    let job = m.add_operation(txn, Operation::create_folder("/d/x")).unwrap();
    m.cancel(CancelTarget::Transaction(txn)).unwrap();

    assert_eq!(m.job(job).unwrap().status(), JobStatus::Cancelled);
    assert_eq!(
        m.transaction(txn).unwrap().status(),
        TransactionStatus::Cancelled
    );
    assert!(!fs.exists(Path::new("/d/x")));
    assert!(drain(&mut rx).iter().any(|e| matches!(
        e,
        EngineEvent::JobCompleted { result: ResultDescriptor::Cancelled, .. }
    )));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_progress_events_reach_subscribers() {
    let fs = Arc::new(MemoryFs::new());
    fs.add_file("/src/one", 10);
    fs.add_file("/src/two", 20);
    fs.add_dir("/dst");
    let mut m = manager(&fs);
    let mut rx = m.subscribe();

    let txn = m.start_transaction("Copy folder");
    m.add_operation(txn, Operation::copy("/src", "/dst/src"))
        .unwrap();
    m.commit(txn).unwrap();
    m.run_until_idle().await;

    let events = drain(&mut rx);
    assert!(matches!(
        events.first(),
        Some(EngineEvent::TransactionStarted { total_ops: 1, .. })
    ));
    assert!(events.iter().any(|e| matches!(e, EngineEvent::JobStarted { .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        EngineEvent::JobProgress { bytes_total: 30, .. }
    )));
    assert!(matches!(
        events.last(),
        Some(EngineEvent::TransactionFinished {
            status: TransactionStatus::Completed,
            partial: false,
            ..
        })
    ));
}

#[test]
fn test_event_serialization() {
    let json = serde_json::to_value(EngineEvent::CanUndoChanged { can_undo: true }).unwrap();
    assert_eq!(json["event"], "can_undo_changed");
    assert_eq!(json["can_undo"], true);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_undo_merged_move_keeps_existing_contents() {
    let fs = Arc::new(MemoryFs::new());
    fs.add_file("/a/d/new.txt", 1);
    fs.add_file("/a/d/sub/deep.txt", 4);
    fs.add_file("/b/d/old.txt", 2);
    let before = fs.paths();
    let mut m = manager(&fs);
    m.set_conflict_resolver(FixedResolver(ConflictAction::Overwrite));

    let txn = m.start_transaction("Move d");
    m.add_operation(txn, Operation::move_to("/a/d", "/b/d"))
        .unwrap();
    m.commit(txn).unwrap();
    m.run_until_idle().await;

    assert!(fs.is_file("/b/d/new.txt"));
    assert!(fs.is_file("/b/d/old.txt"));
    assert!(!fs.exists("/a/d"));

    let undo = m.undo().unwrap();
    m.run_until_idle().await;

    assert_eq!(m.transaction(undo).unwrap().status(), TransactionStatus::Completed);
    assert_eq!(fs.file_len("/b/d/old.txt"), Some(2));
    assert_eq!(fs.file_len("/a/d/sub/deep.txt"), Some(4));
    assert_eq!(fs.paths(), before);
    assert!(!m.can_undo());

    m.redo().unwrap();
    m.run_until_idle().await;
    assert!(fs.is_file("/b/d/new.txt"));
    assert!(fs.is_file("/b/d/sub/deep.txt"));
    assert!(fs.is_file("/b/d/old.txt"));
    assert!(!fs.exists("/a/d"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_partial_undo_of_move_keeps_what_was_left_behind() {
    let fs = Arc::new(MemoryFs::new());
    fs.add_device("/mnt");
    fs.add_file("/src/x.txt", 1);
    fs.add_file("/src/y.txt", 2);
    let mut m = manager(&fs);

    let txn = m.start_transaction("Move src");
    m.add_operation(txn, Operation::move_to("/src", "/mnt/src"))
        .unwrap();
    m.commit(txn).unwrap();
    m.run_until_idle().await;
    assert!(!fs.exists("/src"));

    fs.fail_on("/mnt/src/y.txt", ErrorKind::PermissionDenied);
    let undo = m.undo().unwrap();
    m.run_until_idle().await;

    let t = m.transaction(undo).unwrap();
    assert_eq!(t.status(), TransactionStatus::Completed);
    assert!(t.is_partial());
    assert!(fs.is_file("/src/x.txt"));
    assert!(fs.is_file("/mnt/src/y.txt"));
    assert!(m.can_undo());
    assert_eq!(
        m.undo_description().as_deref(),
        Some("Undo Move src (remaining)")
    );
    assert!(m.can_redo());

    fs.clear_fault("/mnt/src/y.txt");
    let retry = m.undo().unwrap();
    m.run_until_idle().await;

    let t = m.transaction(retry).unwrap();
    assert_eq!(t.status(), TransactionStatus::Completed);
    assert!(!t.is_partial());
    assert!(fs.is_file("/src/x.txt"));
    assert!(fs.is_file("/src/y.txt"));
    assert!(!fs.exists("/mnt/src"));
    assert!(!m.can_undo());
    assert_eq!(m.redo_stack().len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_destination_taken_by_sibling_job_is_resolved() {
    let fs = Arc::new(MemoryFs::new());
    fs.add_file("/x/f.txt", 1);
    fs.add_file("/y/f.txt", 2);
    fs.add_dir("/b");
    let mut m = manager(&fs);
    m.set_conflict_resolver(FixedResolver(ConflictAction::Rename));

    let txn = m.start_transaction("Gather");
    let first = m
        .add_operation(txn, Operation::copy("/x/f.txt", "/b/f.txt"))
        .unwrap();
    let second = m
        .add_operation(txn, Operation::copy("/y/f.txt", "/b/f.txt"))
        .unwrap();
    m.commit(txn).unwrap();
    m.run_until_idle().await;

    assert_eq!(m.job(first).unwrap().status(), JobStatus::Completed);
    assert_eq!(m.job(second).unwrap().status(), JobStatus::Completed);
    assert_eq!(m.transaction(txn).unwrap().status(), TransactionStatus::Completed);
    let mut lens = vec![
        fs.file_len("/b/f.txt").unwrap(),
        fs.file_len("/b/f (Copy).txt").unwrap(),
    ];
    lens.sort();
    assert_eq!(lens, vec![1, 2]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_destination_taken_by_sibling_job_is_held() {
    let fs = Arc::new(MemoryFs::new());
    fs.add_dir("/d");
    let mut m = manager(&fs);
    let mut rx = m.subscribe();

    let txn = m.start_transaction("Make folders");
    m.add_operation(txn, Operation::create_folder("/d/new"))
        .unwrap();
    m.add_operation(txn, Operation::create_folder("/d/new"))
        .unwrap();
    m.commit(txn).unwrap();
    m.run_until_idle().await;

    let held: Vec<_> = m.pending_conflicts().iter().map(|c| c.job_id).collect();
    assert_eq!(held.len(), 1);
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, EngineEvent::ConflictDetected { .. })));
    assert!(!m
        .transaction(txn)
        .unwrap()
        .jobs()
        .any(|j| j.status() == JobStatus::Failed));

    m.resolve_conflict(held[0], ConflictAction::Rename, None, false)
        .unwrap();
    m.run_until_idle().await;
    assert_eq!(m.transaction(txn).unwrap().status(), TransactionStatus::Completed);
    assert!(fs.is_dir("/d/new"));
    assert_eq!(fs.paths().iter().filter(|p| p.starts_with("/d")).count(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_trash_listing_goes_through_the_manager() {
    let fs = Arc::new(MemoryFs::new());
    fs.add_file("/d/one.txt", 1);
    fs.add_file("/d/two.txt", 1);
    let mut m = manager(&fs);

    let txn = m.start_transaction("Trash one");
    m.add_operation(txn, Operation::trash("/d/one.txt")).unwrap();
    m.commit(txn).unwrap();
    m.run_until_idle().await;
    let txn = m.start_transaction("Trash two");
    m.add_operation(txn, Operation::trash("/d/two.txt")).unwrap();
    m.commit(txn).unwrap();
    m.run_until_idle().await;

    let items = m.trash_items().unwrap();
    let paths: Vec<&Path> = items.iter().map(|i| i.original_path.as_path()).collect();
    assert_eq!(paths, vec![Path::new("/d/two.txt"), Path::new("/d/one.txt")]);
}
