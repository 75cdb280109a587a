//! Tests for cross-handle locking
//!
//! Each handle is opened through its own Context, which is how separate
//! processes see the file. On Linux the locks are per open file
//! description, so two handles in one process exclude each other exactly as
//! two processes would.

#![cfg(target_os = "linux")]

use std::thread;
use std::time::Duration;

use chainkv::{Config, Context, Database, ErrorCode, KvError, LockWait, StoreMode};
use crossbeam::channel;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn open(context: &Context, temp_dir: &TempDir, wait: LockWait) -> Database {
    let config = Config::builder().lock_wait(wait).build();
    context.open(temp_dir.path().join("locks.db"), config).unwrap()
}

// =============================================================================
// Chain Lock Tests
// =============================================================================

#[test]
fn test_chain_lock_excludes_other_handle() {
    let temp_dir = TempDir::new().unwrap();
    let (ctx_a, ctx_b) = (Context::new(), Context::new());
    let mut a = open(&ctx_a, &temp_dir, LockWait::Block);
    let mut b = open(&ctx_b, &temp_dir, LockWait::NoWait);

    {
        let mut guard = a.lock_chain_of(b"contended").unwrap();
        // The holder keeps working through the guard
        guard.store(b"contended", b"from a", StoreMode::Insert).unwrap();

        assert!(matches!(
            b.store(b"contended", b"from b", StoreMode::Upsert),
            Err(KvError::WouldBlock)
        ));
        assert_eq!(b.last_error(), Some(ErrorCode::WouldBlock));
    }

    b.store(b"contended", b"from b", StoreMode::Upsert).unwrap();
    assert_eq!(a.fetch(b"contended").unwrap(), Some(b"from b".to_vec()));
}

#[test]
fn test_try_lock_reports_contention() {
    let temp_dir = TempDir::new().unwrap();
    let (ctx_a, ctx_b) = (Context::new(), Context::new());
    let mut a = open(&ctx_a, &temp_dir, LockWait::Block);
    let mut b = open(&ctx_b, &temp_dir, LockWait::Block);

    let _guard = a.lock_chain_of(b"key").unwrap();
    assert!(matches!(b.try_lock_chain_of(b"key"), Err(KvError::WouldBlock)));
    assert!(matches!(b.try_lock_all(), Err(KvError::WouldBlock)));
}

#[test]
fn test_read_lock_all_admits_readers_only() {
    let temp_dir = TempDir::new().unwrap();
    let (ctx_a, ctx_b) = (Context::new(), Context::new());
    let mut a = open(&ctx_a, &temp_dir, LockWait::Block);
    a.store(b"key", b"value", StoreMode::Insert).unwrap();
    let mut b = open(&ctx_b, &temp_dir, LockWait::NoWait);

    let _guard = a.read_lock_all().unwrap();
    assert_eq!(b.fetch(b"key").unwrap(), Some(b"value".to_vec()));
    assert!(matches!(
        b.delete(b"key"),
        Err(KvError::WouldBlock)
    ));
}

#[test]
fn test_lock_all_blocks_readers() {
    let temp_dir = TempDir::new().unwrap();
    let (ctx_a, ctx_b) = (Context::new(), Context::new());
    let mut a = open(&ctx_a, &temp_dir, LockWait::Block);
    let mut b = open(&ctx_b, &temp_dir, LockWait::NoWait);

    {
        let mut guard = a.lock_all().unwrap();
        guard.store(b"while", b"locked", StoreMode::Insert).unwrap();
        assert!(matches!(b.fetch(b"while"), Err(KvError::WouldBlock)));
        assert!(matches!(b.check(), Err(KvError::WouldBlock)));
    }
    assert_eq!(b.fetch(b"while").unwrap(), Some(b"locked".to_vec()));
}

#[test]
fn test_blocked_store_proceeds_after_release() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("locks.db");
    let ctx_a = Context::new();
    let mut a = open(&ctx_a, &temp_dir, LockWait::Block);

    let guard = a.lock_chain_of(b"queued").unwrap();

    let (started_tx, started_rx) = channel::bounded(1);
    let (done_tx, done_rx) = channel::bounded(1);
    let writer = thread::spawn(move || {
        let context = Context::new();
        let mut b = context.open(&path, Config::default()).unwrap();
        started_tx.send(()).unwrap();
        b.store(b"queued", b"from b", StoreMode::Upsert).unwrap();
        done_tx.send(()).unwrap();
    });

    started_rx.recv().unwrap();
    thread::sleep(Duration::from_millis(100));
    assert!(done_rx.try_recv().is_err(), "store ran while the chain was locked");

    drop(guard);
    done_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    writer.join().unwrap();
    assert_eq!(a.fetch(b"queued").unwrap(), Some(b"from b".to_vec()));
}

#[test]
fn test_transactions_are_serialized() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("locks.db");
    let ctx_a = Context::new();
    let mut a = open(&ctx_a, &temp_dir, LockWait::Block);

    a.transaction_start().unwrap();
    a.store(b"first", b"a", StoreMode::Insert).unwrap();

    let (done_tx, done_rx) = channel::bounded(1);
    let second = thread::spawn(move || {
        let context = Context::new();
        let mut b = context.open(&path, Config::default()).unwrap();
        b.transaction_start().unwrap();
        // Started only after the first transaction committed
        let seen = b.fetch(b"first").unwrap();
        b.store(b"second", b"b", StoreMode::Insert).unwrap();
        b.transaction_commit().unwrap();
        done_tx.send(seen).unwrap();
    });

    thread::sleep(Duration::from_millis(100));
    assert!(done_rx.try_recv().is_err());
    a.transaction_commit().unwrap();

    let seen = done_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(seen, Some(b"a".to_vec()));
    second.join().unwrap();
    assert_eq!(a.fetch(b"second").unwrap(), Some(b"b".to_vec()));
}

// =============================================================================
// Concurrent Writers
// =============================================================================

#[test]
fn test_concurrent_writers_keep_file_consistent() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("shared.db");
    drop(Context::new().open(&path, Config::builder().hash_size(61).build()).unwrap());

    let writers: Vec<_> = (0..4u32)
        .map(|w| {
            let path = path.clone();
            thread::spawn(move || {
                let context = Context::new();
                let mut db = context.open(&path, Config::default()).unwrap();
                for i in 0..250u32 {
                    let key = format!("writer-{}-{}", w, i);
                    db.store(key.as_bytes(), &[w as u8; 90], StoreMode::Insert).unwrap();
                    if i % 10 == 0 {
                        db.delete(key.as_bytes()).unwrap();
                    }
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    let mut db = Context::new().open(&path, Config::default()).unwrap();
    db.check().unwrap();
    assert_eq!(db.record_count().unwrap(), 4 * 225);
    assert_eq!(
        db.fetch(b"writer-2-11").unwrap(),
        Some(vec![2u8; 90])
    );
}

// =============================================================================
// Clear-If-First Tests
// =============================================================================

#[test]
fn test_clear_if_first() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("scratch.db");
    let config = Config::builder().clear_if_first(true).build();

    let ctx_a = Context::new();
    let mut a = ctx_a.open(&path, config.clone()).unwrap();
    a.store(b"session", b"data", StoreMode::Insert).unwrap();

    // Not first: contents are kept
    let ctx_b = Context::new();
    let mut b = ctx_b.open(&path, config.clone()).unwrap();
    assert_eq!(b.fetch(b"session").unwrap(), Some(b"data".to_vec()));

    drop(a);
    drop(b);

    // First again: the file starts empty
    let mut c = Context::new().open(&path, config).unwrap();
    assert_eq!(c.fetch(b"session").unwrap(), None);
    c.check().unwrap();
}
