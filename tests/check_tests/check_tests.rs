//! Tests for the integrity check on real files
//!
//! These tests verify:
//! - Healthy files pass after a variety of operations
//! - On-disk damage is reported as corruption naming the record
//! - Corruption is sticky on the handle that found it
//! - Validators see every record

use std::fs;
use std::path::Path;

use chainkv::{Config, Context, ErrorCode, StoreMode};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn write_sample(path: &Path) {
    let context = Context::new();
    let mut db = context.open(path, Config::builder().hash_size(11).build()).unwrap();
    for i in 0..20u32 {
        db.store(format!("sample-{}", i).as_bytes(), b"payload", StoreMode::Insert)
            .unwrap();
    }
    db.store(b"needle-key-0042", b"needle-value", StoreMode::Insert).unwrap();
    db.close().unwrap();
}

/// Offset of the first occurrence of `needle` in the file
fn find_bytes(path: &Path, needle: &[u8]) -> usize {
    let bytes = fs::read(path).unwrap();
    bytes
        .windows(needle.len())
        .position(|w| w == needle)
        .expect("needle not found in file")
}

fn flip_byte(path: &Path, offset: usize) {
    let mut bytes = fs::read(path).unwrap();
    bytes[offset] ^= 0x20;
    fs::write(path, bytes).unwrap();
}

// =============================================================================
// Check Tests
// =============================================================================

#[test]
fn test_healthy_file_passes() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("healthy.db");
    write_sample(&path);

    let mut db = Context::new().open(&path, Config::default()).unwrap();
    db.check().unwrap();
    assert_eq!(db.last_error(), None);
}

#[test]
fn test_damaged_key_is_reported() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("damaged.db");
    write_sample(&path);

    let key_at = find_bytes(&path, b"needle-key-0042");
    flip_byte(&path, key_at + 3);

    let mut db = Context::new().open(&path, Config::default()).unwrap();
    let err = db.check().unwrap_err();
    assert!(err.is_corruption());
    let record_at = key_at - 24;
    assert!(
        err.to_string().contains(&format!("record at {}", record_at)),
        "unexpected message: {}",
        err
    );

    // Every later operation reports the same corruption
    assert_eq!(db.last_error(), Some(ErrorCode::Corrupt));
    assert!(db.fetch(b"sample-1").unwrap_err().is_corruption());
    assert!(db.store(b"new", b"v", StoreMode::Insert).unwrap_err().is_corruption());
}

#[test]
fn test_damaged_tailer_is_reported() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("tailer.db");
    write_sample(&path);

    // The tailer sits right after the value and padding of the record
    let key_at = find_bytes(&path, b"needle-key-0042");
    let record_at = key_at - 24;
    let bytes = fs::read(&path).unwrap();
    let rec_len = u32::from_le_bytes(bytes[record_at + 4..record_at + 8].try_into().unwrap());
    let tailer_at = record_at + 24 + rec_len as usize - 4;
    flip_byte(&path, tailer_at);

    let mut db = Context::new().open(&path, Config::default()).unwrap();
    let err = db.check().unwrap_err();
    assert!(err.to_string().contains("tailer"), "unexpected message: {}", err);
}

#[test]
fn test_damaged_slot_table_is_reported() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("slots.db");
    write_sample(&path);

    // Point chain 0 into the middle of the header
    let mut bytes = fs::read(&path).unwrap();
    let chain0 = 128 + 8 * 4;
    bytes[chain0..chain0 + 4].copy_from_slice(&64u32.to_le_bytes());
    fs::write(&path, bytes).unwrap();

    let mut db = Context::new().open(&path, Config::default()).unwrap();
    assert!(db.check().unwrap_err().is_corruption());
}

#[test]
fn test_check_after_reopen_with_validator() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("validated.db");
    write_sample(&path);

    let mut db = Context::new().open(&path, Config::default()).unwrap();
    let mut visited = 0;
    db.check_with(|key, value| {
        visited += 1;
        !key.is_empty() && !value.is_empty()
    })
    .unwrap();
    assert_eq!(visited, 21);
}

#[test]
fn test_read_only_check() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("ro-check.db");
    write_sample(&path);

    let mut db = Context::new()
        .open(&path, Config::builder().read_only().build())
        .unwrap();
    db.check().unwrap();
    assert_eq!(db.record_count().unwrap(), 21);
}
