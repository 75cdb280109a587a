//! Tests for Database record operations
//!
//! These tests verify:
//! - Store modes, fetch, exists, append and delete
//! - Persistence across handles
//! - Byte order and hash function detection on open
//! - Open-time validation (read-only, write-only, already open)
//! - The process-wide context and handle formatting
//! - Wipe and repack

use chainkv::{
    AccessMode, ByteOrder, Config, Context, Database, ErrorCode, HashFunction, KvError, StoreMode,
};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_db() -> (TempDir, Context, Database) {
    let temp_dir = TempDir::new().unwrap();
    let context = Context::new();
    let db = context
        .open(temp_dir.path().join("test.db"), Config::default())
        .unwrap();
    (temp_dir, context, db)
}

// =============================================================================
// Basic Operations Tests
// =============================================================================

#[test]
fn test_single_chain_scenario() {
    let mut db = Database::open_internal(Config::builder().hash_size(1).build()).unwrap();

    db.store(b"hi", b"world", StoreMode::Insert).unwrap();
    db.check().unwrap();
    assert_eq!(db.fetch(b"hi").unwrap(), Some(b"world".to_vec()));

    let err = db.store(b"hi", b"again", StoreMode::Insert).unwrap_err();
    assert!(matches!(err, KvError::KeyExists));
    assert_eq!(db.last_error(), Some(ErrorCode::Exists));

    db.store(b"hi", b"world2", StoreMode::Replace).unwrap();
    assert_eq!(db.fetch(b"hi").unwrap(), Some(b"world2".to_vec()));
    db.check().unwrap();
}

#[test]
fn test_store_modes() {
    let (_temp, _context, mut db) = setup_temp_db();

    assert!(matches!(
        db.store(b"missing", b"v", StoreMode::Replace),
        Err(KvError::NotFound)
    ));
    db.store(b"k", b"1", StoreMode::Upsert).unwrap();
    db.store(b"k", b"2", StoreMode::Upsert).unwrap();
    assert_eq!(db.fetch(b"k").unwrap(), Some(b"2".to_vec()));
    assert_eq!(db.record_count().unwrap(), 1);
}

#[test]
fn test_fetch_missing_key() {
    let (_temp, _context, mut db) = setup_temp_db();
    assert_eq!(db.fetch(b"nothing").unwrap(), None);
    assert!(!db.exists(b"nothing").unwrap());
    assert_eq!(db.last_error(), None);
}

#[test]
fn test_delete() {
    let (_temp, _context, mut db) = setup_temp_db();
    db.store(b"gone", b"soon", StoreMode::Insert).unwrap();
    assert!(db.exists(b"gone").unwrap());

    db.delete(b"gone").unwrap();
    assert_eq!(db.fetch(b"gone").unwrap(), None);

    assert!(matches!(db.delete(b"gone"), Err(KvError::NotFound)));
    assert_eq!(db.last_error(), Some(ErrorCode::NotFound));
    db.check().unwrap();
}

#[test]
fn test_append() {
    let (_temp, _context, mut db) = setup_temp_db();
    db.append(b"log", b"one").unwrap();
    db.append(b"log", b",two").unwrap();
    db.append(b"log", &[b'x'; 500]).unwrap();

    let value = db.fetch(b"log").unwrap().unwrap();
    assert!(value.starts_with(b"one,two"));
    assert_eq!(value.len(), 7 + 500);
    db.check().unwrap();
}

#[test]
fn test_empty_key_is_invalid() {
    let (_temp, _context, mut db) = setup_temp_db();
    assert!(matches!(
        db.store(b"", b"v", StoreMode::Insert),
        Err(KvError::Invalid(_))
    ));
    assert!(matches!(db.fetch(b""), Err(KvError::Invalid(_))));
    assert_eq!(db.error_string(), "Invalid parameter");
}

#[test]
fn test_empty_value_and_binary_data() {
    let (_temp, _context, mut db) = setup_temp_db();
    db.store(b"empty", b"", StoreMode::Insert).unwrap();
    db.store(&[0, 255, 0], &[0u8; 3], StoreMode::Insert).unwrap();

    assert_eq!(db.fetch(b"empty").unwrap(), Some(Vec::new()));
    assert_eq!(db.fetch(&[0, 255, 0]).unwrap(), Some(vec![0u8; 3]));
}

#[test]
fn test_large_values() {
    let (_temp, _context, mut db) = setup_temp_db();
    let big: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    db.store(b"big", &big, StoreMode::Insert).unwrap();
    assert_eq!(db.fetch(b"big").unwrap(), Some(big));
    db.check().unwrap();
}

// =============================================================================
// Persistence Tests
// =============================================================================

#[test]
fn test_data_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("persist.db");
    let context = Context::new();

    {
        let mut db = context.open(&path, Config::default()).unwrap();
        for i in 0..500u32 {
            db.store(format!("key-{}", i).as_bytes(), &i.to_le_bytes(), StoreMode::Insert)
                .unwrap();
        }
        db.close().unwrap();
    }

    let mut db = context.open(&path, Config::default()).unwrap();
    assert_eq!(db.record_count().unwrap(), 500);
    assert_eq!(db.allocated_records().unwrap(), 500);
    assert_eq!(
        db.fetch(b"key-321").unwrap(),
        Some(321u32.to_le_bytes().to_vec())
    );
    db.check().unwrap();
}

#[test]
fn test_existing_file_keeps_its_hash_size() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("size.db");
    let context = Context::new();

    drop(context.open(&path, Config::builder().hash_size(17).build()).unwrap());
    let db = context.open(&path, Config::builder().hash_size(999).build()).unwrap();
    assert_eq!(db.hash_size(), 17);
}

#[test]
fn test_no_mmap_handle_reads_mapped_writes() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("io.db");
    let context = Context::new();

    {
        let mut db = context.open(&path, Config::default()).unwrap();
        db.store(b"via", b"mmap", StoreMode::Insert).unwrap();
    }
    let mut db = context
        .open(&path, Config::builder().no_mmap(true).build())
        .unwrap();
    assert_eq!(db.fetch(b"via").unwrap(), Some(b"mmap".to_vec()));
    db.store(b"via", b"pwrite", StoreMode::Replace).unwrap();
    db.check().unwrap();
}

#[test]
fn test_big_endian_file_is_detected() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("big.db");
    let context = Context::new();

    {
        let config = Config::builder().byte_order(ByteOrder::Big).build();
        let mut db = context.open(&path, config).unwrap();
        db.store(b"endian", b"big", StoreMode::Insert).unwrap();
    }

    // Opened with the default (little-endian) config
    let mut db = context.open(&path, Config::default()).unwrap();
    assert_eq!(db.byte_order(), ByteOrder::Big);
    assert_eq!(db.fetch(b"endian").unwrap(), Some(b"big".to_vec()));
    db.store(b"more", b"data", StoreMode::Insert).unwrap();
    db.check().unwrap();
}

#[test]
fn test_other_builtin_hash_is_detected() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("xxh3.db");
    let context = Context::new();

    {
        let config = Config::builder().hash(HashFunction::Xxh3).build();
        let mut db = context.open(&path, config).unwrap();
        db.store(b"hashed", b"xxh3", StoreMode::Insert).unwrap();
    }

    let mut db = context.open(&path, Config::default()).unwrap();
    assert_eq!(db.hash_function().name(), "xxh3");
    assert_eq!(db.fetch(b"hashed").unwrap(), Some(b"xxh3".to_vec()));
}

#[test]
fn test_custom_hash_mismatch_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("custom.db");
    let context = Context::new();

    drop(context.open(&path, Config::default()).unwrap());

    let config = Config::builder()
        .hash(HashFunction::custom(|key| key.len() as u32 * 7 + 1))
        .build();
    let err = context.open(&path, config).unwrap_err();
    assert!(matches!(err, KvError::HashMismatch(_)));
    assert_eq!(err.code(), ErrorCode::Corrupt);
}

#[test]
fn test_custom_hash_round_trip() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("custom-ok.db");
    let context = Context::new();
    let hash = HashFunction::custom(|key| key.iter().map(|&b| b as u32).sum::<u32>() + 1);

    {
        let mut db = context
            .open(&path, Config::builder().hash(hash.clone()).build())
            .unwrap();
        db.store(b"abc", b"sum", StoreMode::Insert).unwrap();
    }
    let mut db = context.open(&path, Config::builder().hash(hash).build()).unwrap();
    assert_eq!(db.fetch(b"abc").unwrap(), Some(b"sum".to_vec()));
    db.check().unwrap();
}

// =============================================================================
// Open Validation Tests
// =============================================================================

#[test]
fn test_read_only_handle_rejects_writes() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("ro.db");
    let context = Context::new();

    {
        let mut db = context.open(&path, Config::default()).unwrap();
        db.store(b"fixed", b"value", StoreMode::Insert).unwrap();
    }

    let mut db = context
        .open(&path, Config::builder().read_only().build())
        .unwrap();
    assert!(db.is_read_only());
    assert_eq!(db.fetch(b"fixed").unwrap(), Some(b"value".to_vec()));
    assert!(matches!(
        db.store(b"new", b"value", StoreMode::Insert),
        Err(KvError::ReadOnly)
    ));
    assert!(matches!(db.delete(b"fixed"), Err(KvError::ReadOnly)));
    assert!(matches!(db.transaction_start(), Err(KvError::ReadOnly)));
    assert_eq!(db.last_error(), Some(ErrorCode::ReadOnly));
    db.check().unwrap();
}

#[test]
fn test_write_only_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder().access(AccessMode::WriteOnly).build();
    let err = Context::new()
        .open(temp_dir.path().join("wo.db"), config)
        .unwrap_err();
    assert!(matches!(err, KvError::Invalid(_)));
}

#[test]
fn test_missing_file_without_create() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder().create(false).build();
    let err = Context::new()
        .open(temp_dir.path().join("absent.db"), config)
        .unwrap_err();
    assert!(matches!(err, KvError::Io(_)));
}

#[test]
fn test_foreign_file_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("foreign.db");
    std::fs::write(&path, vec![b'z'; 4096]).unwrap();

    let config = Config::builder().create(false).build();
    let err = Context::new().open(&path, config).unwrap_err();
    assert!(err.is_corruption());
}

#[test]
fn test_same_file_twice_in_one_context() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("twice.db");
    let context = Context::new();

    let first = context.open(&path, Config::default()).unwrap();
    let err = context.open(&path, Config::default()).unwrap_err();
    assert!(matches!(err, KvError::AlreadyOpen(_)));
    assert_eq!(context.open_count(), 1);

    // Closing releases the registration
    first.close().unwrap();
    assert_eq!(context.open_count(), 0);
    let _again = context.open(&path, Config::default()).unwrap();
}

#[test]
fn test_process_context_is_shared() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("process.db");

    assert!(std::ptr::eq(Context::process(), Context::process()));
    let first = Context::process().open(&path, Config::default()).unwrap();
    let err = Context::process()
        .open(&path, Config::default())
        .unwrap_err();
    assert!(matches!(err, KvError::AlreadyOpen(_)));

    drop(first);
    let _again = Context::process().open(&path, Config::default()).unwrap();
}

#[test]
fn test_debug_names_the_file() {
    let (temp_dir, _context, db) = setup_temp_db();
    let shown = format!("{:?}", db);
    assert!(shown.starts_with("Database"));
    assert!(shown.contains(&temp_dir.path().join("test.db").display().to_string()));
    assert!(shown.contains("hash_size: 131"));
}

#[test]
fn test_truncate_reinitializes() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("trunc.db");
    let context = Context::new();

    {
        let mut db = context.open(&path, Config::default()).unwrap();
        db.store(b"old", b"data", StoreMode::Insert).unwrap();
    }
    let mut db = context
        .open(&path, Config::builder().truncate(true).hash_size(5).build())
        .unwrap();
    assert_eq!(db.hash_size(), 5);
    assert_eq!(db.fetch(b"old").unwrap(), None);
    db.check().unwrap();
}

#[test]
fn test_internal_database_lives_in_memory() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("never-created.db");

    let mut db = Context::new().open(&path, Config::internal()).unwrap();
    assert!(db.is_internal());
    db.store(b"k", b"v", StoreMode::Insert).unwrap();
    assert_eq!(db.fetch(b"k").unwrap(), Some(b"v".to_vec()));
    assert!(!path.exists());
}

// =============================================================================
// Whole-Database Operations Tests
// =============================================================================

#[test]
fn test_wipe_all() {
    let (_temp, _context, mut db) = setup_temp_db();
    for i in 0..50u32 {
        db.store(&i.to_be_bytes(), b"v", StoreMode::Insert).unwrap();
    }
    let len = db.file_len().unwrap();

    db.wipe_all().unwrap();
    assert_eq!(db.record_count().unwrap(), 0);
    assert_eq!(db.allocated_records().unwrap(), 0);
    assert_eq!(db.file_len().unwrap(), len);
    db.check().unwrap();

    db.store(b"after", b"wipe", StoreMode::Insert).unwrap();
    assert_eq!(db.file_len().unwrap(), len);
}

#[test]
fn test_repack_keeps_every_record() {
    let (_temp, _context, mut db) = setup_temp_db();
    for i in 0..300u32 {
        db.store(format!("key-{}", i).as_bytes(), &[i as u8; 40], StoreMode::Insert)
            .unwrap();
    }
    for i in (0..300u32).step_by(3) {
        db.delete(format!("key-{}", i).as_bytes()).unwrap();
    }

    db.repack().unwrap();
    assert_eq!(db.record_count().unwrap(), 200);
    assert_eq!(db.fetch(b"key-1").unwrap(), Some(vec![1u8; 40]));
    assert_eq!(db.fetch(b"key-3").unwrap(), None);
    db.check().unwrap();
}

#[test]
fn test_keys_lists_everything() {
    let (_temp, _context, mut db) = setup_temp_db();
    for key in ["alpha", "beta", "gamma"] {
        db.store(key.as_bytes(), b"", StoreMode::Insert).unwrap();
    }
    let mut keys = db.keys().unwrap();
    keys.sort();
    assert_eq!(keys, vec![b"alpha".to_vec(), b"beta".to_vec(), b"gamma".to_vec()]);
}
