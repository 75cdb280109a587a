//! # ChainKV
//!
//! A single-file hash key-value store with:
//! - Memory-mapped access shared by any number of processes
//! - Per-chain advisory byte-range locks; no daemon or side channel
//! - Crash-safe transactions backed by an undo record in the file itself
//! - A full structural integrity check
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Context (open-file registry)                │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ open
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                        Database                              │
//! │     store / fetch / delete / traverse / check / repack       │
//! └──────┬──────────────────┬──────────────────────┬────────────┘
//!        │                  │                      │
//!        ▼                  ▼                      ▼
//!  ┌───────────┐     ┌─────────────┐        ┌─────────────┐
//!  │   Locks   │     │ Transaction │        │   Layout    │
//!  │  (fcntl)  │     │  (overlay)  │        │ chains/free │
//!  └───────────┘     └──────┬──────┘        └──────┬──────┘
//!                           └──────────┬───────────┘
//!                                      ▼
//!                              ┌─────────────┐
//!                              │   Storage   │
//!                              │ (mmap/file) │
//!                              └─────────────┘
//! ```
//!
//! ## Example
//! ```no_run
//! use chainkv::{Config, Context, StoreMode};
//!
//! let context = Context::new();
//! let mut db = context.open("example.db", Config::default())?;
//! db.store(b"hello", b"world", StoreMode::Upsert)?;
//! assert_eq!(db.fetch(b"hello")?, Some(b"world".to_vec()));
//! # Ok::<(), chainkv::KvError>(())
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod hash;
pub mod context;
pub mod storage;
pub mod lock;
pub mod transaction;
pub mod traverse;
pub mod database;

mod layout;
mod freelist;
mod check;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{ErrorCode, KvError, Result};
pub use config::{AccessMode, Config, ConfigBuilder, OpenFlags, DEFAULT_HASH_SIZE};
pub use context::Context;
pub use database::{Database, StoreMode};
pub use hash::HashFunction;
pub use lock::{LockAddress, LockGuard, LockMode, LockWait};
pub use storage::ByteOrder;
pub use transaction::TransactionState;
pub use traverse::Visit;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of ChainKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
