//! Error types for ChainKV
//!
//! Provides a unified error type for all operations, plus a small `Copy`
//! error code that a handle remembers as its last error.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using KvError
pub type Result<T> = std::result::Result<T, KvError>;

/// Unified error type for ChainKV operations
#[derive(Debug, Error)]
pub enum KvError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Database would exceed the 4 GiB format limit (requested {requested} bytes)")]
    TooLarge { requested: u64 },

    // -------------------------------------------------------------------------
    // Format Errors
    // -------------------------------------------------------------------------
    #[error("Database corruption detected: {0}")]
    Corrupt(String),

    #[error("Hash function mismatch: {0}")]
    HashMismatch(String),

    #[error("Unsupported format version: {found:#010x}")]
    Version { found: u32 },

    // -------------------------------------------------------------------------
    // Usage Errors
    // -------------------------------------------------------------------------
    #[error("Invalid argument: {0}")]
    Invalid(String),

    #[error("Database is read-only")]
    ReadOnly,

    #[error("Database {0} is already open in this context")]
    AlreadyOpen(PathBuf),

    #[error("Transaction error: {0}")]
    Transaction(String),

    // -------------------------------------------------------------------------
    // Record Errors
    // -------------------------------------------------------------------------
    #[error("Key already exists")]
    KeyExists,

    #[error("Key not found")]
    NotFound,

    // -------------------------------------------------------------------------
    // Concurrency Errors
    // -------------------------------------------------------------------------
    #[error("Lock would block")]
    WouldBlock,
}

impl KvError {
    /// Error code stored as the handle's last error
    pub fn code(&self) -> ErrorCode {
        match self {
            KvError::Io(_) => ErrorCode::Io,
            KvError::OutOfMemory(_) => ErrorCode::OutOfMemory,
            KvError::TooLarge { .. } => ErrorCode::Io,
            KvError::Corrupt(_) | KvError::HashMismatch(_) => ErrorCode::Corrupt,
            KvError::Version { .. } => ErrorCode::Version,
            KvError::Invalid(_) => ErrorCode::Invalid,
            KvError::ReadOnly => ErrorCode::ReadOnly,
            KvError::AlreadyOpen(_) => ErrorCode::AlreadyOpen,
            KvError::Transaction(_) => ErrorCode::Nesting,
            KvError::KeyExists => ErrorCode::Exists,
            KvError::NotFound => ErrorCode::NotFound,
            KvError::WouldBlock => ErrorCode::WouldBlock,
        }
    }

    /// Conditions a caller is expected to handle and retry around
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            KvError::WouldBlock | KvError::NotFound | KvError::KeyExists
        )
    }

    pub fn is_corruption(&self) -> bool {
        self.code() == ErrorCode::Corrupt
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        KvError::Corrupt(msg.into())
    }
}

impl From<nix::Error> for KvError {
    fn from(e: nix::Error) -> Self {
        KvError::Io(std::io::Error::from(e))
    }
}

/// Compact error classification, retrievable after the fact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Corrupt,
    Io,
    WouldBlock,
    OutOfMemory,
    Exists,
    NotFound,
    Invalid,
    ReadOnly,
    Nesting,
    AlreadyOpen,
    Version,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Corrupt => "Corrupt database",
            ErrorCode::Io => "IO Error",
            ErrorCode::WouldBlock => "Locking error",
            ErrorCode::OutOfMemory => "Out of memory",
            ErrorCode::Exists => "Record exists",
            ErrorCode::NotFound => "Record does not exist",
            ErrorCode::Invalid => "Invalid parameter",
            ErrorCode::ReadOnly => "write not permitted",
            ErrorCode::Nesting => "Transaction nesting or state error",
            ErrorCode::AlreadyOpen => "Database already open",
            ErrorCode::Version => "Unsupported format version",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
