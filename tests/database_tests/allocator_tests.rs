//! Tests for free-space reuse and file growth
//!
//! These tests verify:
//! - Deleted space is reused before the file grows
//! - Growth happens in page-sized steps
//! - Heavy churn keeps the structure valid

use chainkv::{Config, Context, Database, StoreMode};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_db(hash_size: u32) -> (TempDir, Context, Database) {
    let temp_dir = TempDir::new().unwrap();
    let context = Context::new();
    let config = Config::builder().hash_size(hash_size).build();
    let db = context.open(temp_dir.path().join("alloc.db"), config).unwrap();
    (temp_dir, context, db)
}

fn key(i: u32) -> Vec<u8> {
    format!("key-{:06}", i).into_bytes()
}

// =============================================================================
// Reuse Tests
// =============================================================================

#[test]
fn test_deleted_space_is_reused() {
    let (_temp, _context, mut db) = setup_temp_db(31);
    for i in 0..100 {
        db.store(&key(i), &[7u8; 50], StoreMode::Insert).unwrap();
    }
    db.delete(&key(50)).unwrap();
    let len = db.file_len().unwrap();

    // Same-sized record: must fit in the freed space
    db.store(&key(1000), &[8u8; 50], StoreMode::Insert).unwrap();
    assert_eq!(db.file_len().unwrap(), len);
    db.check().unwrap();
}

#[test]
fn test_growing_value_moves_record() {
    let (_temp, _context, mut db) = setup_temp_db(31);
    db.store(b"grow", b"small", StoreMode::Insert).unwrap();
    db.store(b"neighbour", b"x", StoreMode::Insert).unwrap();

    db.store(b"grow", &[1u8; 300], StoreMode::Replace).unwrap();
    assert_eq!(db.fetch(b"grow").unwrap(), Some(vec![1u8; 300]));
    assert_eq!(db.fetch(b"neighbour").unwrap(), Some(b"x".to_vec()));
    assert_eq!(db.allocated_records().unwrap(), 2);
    db.check().unwrap();
}

#[test]
fn test_file_grows_in_pages() {
    let (_temp, _context, mut db) = setup_temp_db(131);
    for i in 0..1000 {
        db.store(&key(i), &[0u8; 100], StoreMode::Insert).unwrap();
    }
    assert_eq!(db.file_len().unwrap() % 4096, 0);
    db.check().unwrap();
}

#[test]
fn test_delete_everything_then_refill() {
    let (_temp, _context, mut db) = setup_temp_db(7);
    for i in 0..400 {
        db.store(&key(i), &[3u8; 20], StoreMode::Insert).unwrap();
    }
    let len = db.file_len().unwrap();
    for i in 0..400 {
        db.delete(&key(i)).unwrap();
    }
    assert_eq!(db.allocated_records().unwrap(), 0);
    db.check().unwrap();

    for i in 0..400 {
        db.store(&key(i), &[4u8; 20], StoreMode::Insert).unwrap();
    }
    assert_eq!(db.file_len().unwrap(), len);
    db.check().unwrap();
}

#[test]
fn test_churn_keeps_structure_valid() {
    let (_temp, _context, mut db) = setup_temp_db(13);
    let mut live = std::collections::BTreeMap::new();

    // Deterministic mix of sizes, replacements and deletes
    let mut state = 0x2545_f491u32;
    for round in 0..3000u32 {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        let k = key(state % 200);
        match state % 5 {
            0 | 1 | 2 => {
                let value = vec![round as u8; (state % 700) as usize];
                db.store(&k, &value, StoreMode::Upsert).unwrap();
                live.insert(k, value);
            }
            3 => {
                if live.remove(&k).is_some() {
                    db.delete(&k).unwrap();
                }
            }
            _ => {
                assert_eq!(db.fetch(&k).unwrap(), live.get(&k).cloned());
            }
        }
        if round % 500 == 0 {
            db.check().unwrap();
        }
    }

    db.check().unwrap();
    assert_eq!(db.record_count().unwrap(), live.len());
    for (k, v) in &live {
        assert_eq!(db.fetch(k).unwrap().as_ref(), Some(v));
    }
}
