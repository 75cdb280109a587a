//! Configuration for ChainKV
//!
//! Open-time options with sensible defaults.

use crate::hash::HashFunction;
use crate::lock::LockWait;
use crate::storage::ByteOrder;

/// Default number of hash chains for new databases
pub const DEFAULT_HASH_SIZE: u32 = 131;

/// How the database file is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
    /// Rejected on open; a hash database always needs to read
    WriteOnly,
}

/// Behavior flags for a handle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    /// Keep everything in a heap buffer; no file, no locks
    pub internal: bool,
    /// Skip OS-level locking (single-process use only)
    pub no_lock: bool,
    /// Use positional reads/writes instead of a memory map
    pub no_mmap: bool,
    /// Reinitialize the file if no other handle has it open
    pub clear_if_first: bool,
}

/// Main configuration for a ChainKV handle
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Layout Configuration
    // -------------------------------------------------------------------------
    /// Number of hash chains when creating a file (existing files keep theirs)
    pub hash_size: u32,

    /// Byte order used when creating a file
    pub byte_order: ByteOrder,

    /// Hash function; must match the one that created the file
    pub hash: HashFunction,

    // -------------------------------------------------------------------------
    // Open Configuration
    // -------------------------------------------------------------------------
    pub access: AccessMode,

    /// Create the file if it does not exist
    pub create: bool,

    /// Reinitialize the file on open
    pub truncate: bool,

    /// Permission bits for newly created files
    pub mode: u32,

    pub flags: OpenFlags,

    // -------------------------------------------------------------------------
    // Locking Configuration
    // -------------------------------------------------------------------------
    /// Whether record operations wait for chain locks
    pub lock_wait: LockWait,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hash_size: DEFAULT_HASH_SIZE,
            byte_order: ByteOrder::default(),
            hash: HashFunction::default(),
            access: AccessMode::ReadWrite,
            create: true,
            truncate: false,
            mode: 0o600,
            flags: OpenFlags::default(),
            lock_wait: LockWait::Block,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Default config for an internal (memory-only) database
    pub fn internal() -> Self {
        Self::builder().internal(true).build()
    }

    pub fn is_read_only(&self) -> bool {
        self.access == AccessMode::ReadOnly
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the number of hash chains for new files (0 means default)
    pub fn hash_size(mut self, size: u32) -> Self {
        self.config.hash_size = if size == 0 { DEFAULT_HASH_SIZE } else { size };
        self
    }

    pub fn byte_order(mut self, order: ByteOrder) -> Self {
        self.config.byte_order = order;
        self
    }

    pub fn hash(mut self, hash: HashFunction) -> Self {
        self.config.hash = hash;
        self
    }

    pub fn access(mut self, access: AccessMode) -> Self {
        self.config.access = access;
        self
    }

    pub fn read_only(self) -> Self {
        self.access(AccessMode::ReadOnly)
    }

    pub fn create(mut self, create: bool) -> Self {
        self.config.create = create;
        self
    }

    pub fn truncate(mut self, truncate: bool) -> Self {
        self.config.truncate = truncate;
        self
    }

    /// Set the permission bits for newly created files
    pub fn mode(mut self, mode: u32) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn flags(mut self, flags: OpenFlags) -> Self {
        self.config.flags = flags;
        self
    }

    pub fn internal(mut self, internal: bool) -> Self {
        self.config.flags.internal = internal;
        self
    }

    pub fn no_lock(mut self, no_lock: bool) -> Self {
        self.config.flags.no_lock = no_lock;
        self
    }

    pub fn no_mmap(mut self, no_mmap: bool) -> Self {
        self.config.flags.no_mmap = no_mmap;
        self
    }

    pub fn clear_if_first(mut self, clear: bool) -> Self {
        self.config.flags.clear_if_first = clear;
        self
    }

    /// Set whether record operations block on busy chains
    pub fn lock_wait(mut self, wait: LockWait) -> Self {
        self.config.lock_wait = wait;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
