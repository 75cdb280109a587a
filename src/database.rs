//! Database Module
//!
//! The handle that ties the components together.
//!
//! ## Responsibilities
//! - Open or create the file under the open lock, validate the header,
//!   detect byte order and hash function, replay interrupted transactions
//! - Route every read and write through the active transaction, if any
//! - Record operations: store, fetch, exists, append, delete
//! - Track the last error and make corruption sticky

use std::fmt;
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::{AccessMode, Config, OpenFlags, DEFAULT_HASH_SIZE};
use crate::context::{FileId, Registration, Registry};
use crate::error::{ErrorCode, KvError, Result};
use crate::hash::HashFunction;
use crate::lock::{LockAddress, LockMode, LockWait, Locker};
use crate::storage::codec::{self, ByteOrder, Header, RecordHeader, HEADER_SIZE};
use crate::storage::Backend;
use crate::transaction::Transaction;
use crate::traverse::Visit;

/// How `store` treats an existing key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Fail with `KeyExists` if the key is present
    Insert,
    /// Fail with `NotFound` if the key is absent
    Replace,
    /// Insert or replace
    Upsert,
}

/// An open database
///
/// ## Concurrency Model
///
/// A handle is used through `&mut self` and is never shared between
/// threads. Concurrency comes from multiple handles (in one or many
/// processes) on the same file, coordinated only by byte-range locks:
///
/// - **Record operations** take the chain lock for their key (shared for
///   reads, exclusive for writes) and the allocation lock while changing
///   free lists
/// - **Transactions** take the transaction lock plus a shared lock on every
///   chain, upgraded to exclusive for commit
/// - **Whole-database operations** (check, traverse_read, wipe) take every
///   chain lock in ascending order
pub struct Database {
    pub(crate) name: Option<PathBuf>,
    pub(crate) backend: Backend,
    pub(crate) order: ByteOrder,
    /// Geometry and self-check values; fixed for the life of the handle
    pub(crate) header: Header,
    pub(crate) hash: HashFunction,
    pub(crate) locks: Locker,
    pub(crate) transaction: Option<Transaction>,
    pub(crate) flags: OpenFlags,
    pub(crate) read_only: bool,
    pub(crate) lock_wait: LockWait,
    last_error: Option<ErrorCode>,
    /// Message of the corruption that poisoned this handle
    poisoned: Option<String>,
    /// Dropped last, after the file (and its locks) are closed
    registration: Option<Registration>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .field("hash_size", &self.header.hash_size)
            .field("byte_order", &self.order)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

impl Database {
    // =========================================================================
    // Open / Close
    // =========================================================================

    fn validate(config: &Config) -> Result<()> {
        if config.access == AccessMode::WriteOnly {
            return Err(KvError::Invalid(
                "a database cannot be opened write-only".to_string(),
            ));
        }
        if config.truncate && config.is_read_only() {
            return Err(KvError::Invalid(
                "truncate requires read-write access".to_string(),
            ));
        }
        Ok(())
    }

    fn with_backend(backend: Backend, config: &Config, locking: bool) -> Self {
        Self {
            name: None,
            backend,
            order: config.byte_order,
            header: Header::default(),
            hash: config.hash.clone(),
            locks: Locker::new(locking),
            transaction: None,
            flags: config.flags,
            read_only: config.is_read_only(),
            lock_wait: config.lock_wait,
            last_error: None,
            poisoned: None,
            registration: None,
        }
    }

    /// Open a memory-only database
    pub fn open_internal(mut config: Config) -> Result<Self> {
        Self::validate(&config)?;
        if config.is_read_only() {
            return Err(KvError::Invalid(
                "an internal database cannot be read-only".to_string(),
            ));
        }
        config.flags.internal = true;
        config.flags.no_lock = true;
        config.flags.no_mmap = true;

        let mut db = Self::with_backend(Backend::memory(), &config, false);
        db.create_database(config.hash_size, config.byte_order)?;
        debug!(hash_size = db.header.hash_size, "opened internal database");
        Ok(db)
    }

    pub(crate) fn open_file(registry: &Arc<Registry>, path: &Path, config: Config) -> Result<Self> {
        Self::validate(&config)?;
        if config.flags.internal {
            let mut db = Self::open_internal(config)?;
            db.name = Some(path.to_path_buf());
            return Ok(db);
        }

        let read_only = config.is_read_only();
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(config.create && !read_only)
            .mode(config.mode)
            .open(path)?;

        // Claim the file before touching any lock on it
        let registration = Registry::register(registry, FileId::of(&file.metadata()?), path)?;

        let backend = Backend::open_file(file, !config.flags.no_mmap, !read_only)?;
        let locking = !read_only && !config.flags.no_lock;
        let mut db = Self::with_backend(backend, &config, locking);
        db.name = Some(path.to_path_buf());
        db.registration = Some(registration);

        db.initialize(&config)?;

        info!(
            path = %path.display(),
            hash_size = db.header.hash_size,
            byte_order = ?db.order,
            hash = db.hash.name(),
            mapped = db.backend.is_mapped(),
            "opened database"
        );
        Ok(db)
    }

    /// Validate or create the file while holding the open lock
    fn initialize(&mut self, config: &Config) -> Result<()> {
        let wait = self.lock_wait;
        let mut db = self.lock_open(wait)?;
        db.load_or_create(config)
    }

    fn load_or_create(&mut self, config: &Config) -> Result<()> {
        let mut reinitialize = config.truncate;

        if self.flags.clear_if_first && !self.read_only {
            match self.acquire_lock(LockAddress::Active, LockMode::Exclusive, LockWait::NoWait) {
                Ok(()) => {
                    reinitialize = true;
                    // Keep the active lock shared for the life of the handle
                    self.acquire_lock(LockAddress::Active, LockMode::Shared, LockWait::Block)?;
                    self.release_lock(LockAddress::Active, LockMode::Exclusive)?;
                }
                Err(KvError::WouldBlock) => {
                    self.acquire_lock(LockAddress::Active, LockMode::Shared, LockWait::Block)?;
                }
                Err(e) => return Err(e),
            }
        }

        let len = self.backend.refresh()?;
        let head = if len >= HEADER_SIZE as u64 {
            self.backend.read(0, HEADER_SIZE as usize)?
        } else {
            Vec::new()
        };

        if reinitialize || !Header::has_magic(&head) {
            if self.read_only || !(config.create || reinitialize) {
                return Err(KvError::corrupt(if len == 0 {
                    "file is empty"
                } else {
                    "not a database file (bad signature)"
                }));
            }
            self.create_database(config.hash_size, config.byte_order)?;
            info!(hash_size = self.header.hash_size, "initialized new database file");
        }

        let head = self.backend.read(0, HEADER_SIZE as usize)?;
        let order = Header::detect_order(&head)?;
        let header = Header::decode(&head, order)?;
        if header.hash_size == 0 {
            return Err(KvError::corrupt("header declares zero hash chains"));
        }
        if self.backend.len() < codec::data_start(header.hash_size) {
            return Err(KvError::corrupt(format!(
                "file ({} bytes) is shorter than its {}-chain slot table",
                self.backend.len(),
                header.hash_size
            )));
        }
        if order.needs_conversion() {
            debug!(?order, "file byte order differs from native");
        }
        self.order = order;
        self.header = header;

        self.verify_hash()?;
        self.recover()
    }

    /// Write a fresh header and empty slot table
    pub(crate) fn create_database(&mut self, hash_size: u32, order: ByteOrder) -> Result<()> {
        let hash_size = if hash_size == 0 { DEFAULT_HASH_SIZE } else { hash_size };
        let header = Header::new(hash_size, self.hash.magic_hashes(order));
        let start = codec::data_start(hash_size);

        let mut image = vec![0u8; start as usize];
        image[..HEADER_SIZE as usize].copy_from_slice(&header.encode(order));

        self.backend.set_len(0)?;
        self.backend.set_len(start)?;
        self.backend.write(0, &image)?;
        self.backend.sync()?;

        self.order = order;
        self.header = header;
        Ok(())
    }

    /// Match the header self-check values against our hash function,
    /// falling back to the other built-in one
    fn verify_hash(&mut self) -> Result<()> {
        let stored = (self.header.magic1_hash, self.header.magic2_hash);
        if self.hash.magic_hashes(self.order) == stored {
            return Ok(());
        }
        if let Some(alternate) = self.hash.alternate() {
            if alternate.magic_hashes(self.order) == stored {
                debug!(
                    requested = self.hash.name(),
                    using = alternate.name(),
                    "file was created with the other built-in hash"
                );
                self.hash = alternate;
                return Ok(());
            }
        }
        Err(KvError::HashMismatch(format!(
            "{} was not created with the {} hash function (magic1 {:#010x}, magic2 {:#010x})",
            self.display_name(),
            self.hash.name(),
            stored.0,
            stored.1
        )))
    }

    /// Close the handle, cancelling any active transaction
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        let mut result = Ok(());
        if self.transaction.is_some() {
            warn!("closing with an active transaction; cancelling it");
            result = self.cancel_transaction();
        }
        self.locks.release_all(self.backend.file());
        result
    }

    // =========================================================================
    // Error Tracking
    // =========================================================================

    /// Run a public operation, recording its failure as the last error
    pub(crate) fn guarded<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if let Some(message) = &self.poisoned {
            let err = KvError::Corrupt(message.clone());
            self.last_error = Some(err.code());
            return Err(err);
        }
        let result = op(self);
        if let Err(e) = &result {
            self.last_error = Some(e.code());
            if e.is_corruption() {
                error!(name = %self.display_name(), error = %e, "database is corrupt");
                self.poisoned = Some(match e {
                    KvError::Corrupt(message) => message.clone(),
                    other => other.to_string(),
                });
            }
        }
        result
    }

    /// Code of the most recent failure on this handle
    pub fn last_error(&self) -> Option<ErrorCode> {
        self.last_error
    }

    pub fn error_string(&self) -> &'static str {
        self.last_error.map_or("Success", ErrorCode::as_str)
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.is_some()
    }

    // =========================================================================
    // I/O Dispatch
    // =========================================================================

    pub(crate) fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        match &self.transaction {
            Some(txn) => txn.overlay.read(&mut self.backend, offset, len),
            None => self.backend.read(offset, len),
        }
    }

    pub(crate) fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(KvError::ReadOnly);
        }
        match &mut self.transaction {
            Some(txn) => txn.write(&mut self.backend, offset, data),
            None => self.backend.write(offset, data),
        }
    }

    pub(crate) fn read_u32_at(&mut self, offset: u32) -> Result<u32> {
        let bytes = self.read_at(offset as u64, 4)?;
        Ok(self.order.read_u32(&bytes))
    }

    pub(crate) fn write_u32_at(&mut self, offset: u32, value: u32) -> Result<()> {
        let bytes = self.order.u32_bytes(value);
        self.write_at(offset as u64, &bytes)
    }

    pub(crate) fn read_record(&mut self, offset: u32) -> Result<RecordHeader> {
        let bytes = self.read_at(offset as u64, codec::RECORD_HEADER_SIZE as usize)?;
        Ok(RecordHeader::decode(&bytes, self.order))
    }

    pub(crate) fn write_record(&mut self, offset: u32, record: &RecordHeader) -> Result<()> {
        let bytes = record.encode(self.order);
        self.write_at(offset as u64, &bytes)
    }

    /// Length as last observed (the transaction's view when one is active)
    pub(crate) fn known_len(&self) -> u64 {
        match &self.transaction {
            Some(txn) => txn.overlay.len(),
            None => self.backend.len(),
        }
    }

    /// Length after picking up growth by other processes
    pub(crate) fn current_len(&mut self) -> Result<u64> {
        match &self.transaction {
            Some(txn) => Ok(txn.overlay.len()),
            None => self.backend.refresh(),
        }
    }

    pub(crate) fn set_data_len(&mut self, len: u64) -> Result<()> {
        if self.read_only {
            return Err(KvError::ReadOnly);
        }
        match &mut self.transaction {
            Some(txn) => txn.grow(len),
            None => self.backend.set_len(len),
        }
    }

    // =========================================================================
    // Record Operations
    // =========================================================================

    /// Store `value` under `key`
    pub fn store(&mut self, key: &[u8], value: &[u8], mode: StoreMode) -> Result<()> {
        self.guarded(|db| db.store_record(key, value, mode))
    }

    /// Fetch the value stored under `key`
    pub fn fetch(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.guarded(|db| db.fetch_record(key))
    }

    pub fn exists(&mut self, key: &[u8]) -> Result<bool> {
        self.guarded(|db| {
            check_key(key)?;
            let hash = db.hash.hash(key);
            let chain = db.chain_for_hash(hash);
            let wait = db.lock_wait;
            let mut db = db.lock_chain(chain, LockMode::Shared, wait)?;
            Ok(db.find(chain, key, hash)?.is_some())
        })
    }

    /// Append `data` to the value under `key`, creating it if absent
    pub fn append(&mut self, key: &[u8], data: &[u8]) -> Result<()> {
        self.guarded(|db| db.append_record(key, data))
    }

    /// Delete `key`; a missing key is reported as `NotFound`
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.guarded(|db| db.delete_record(key))
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            Err(KvError::ReadOnly)
        } else {
            Ok(())
        }
    }

    pub(crate) fn store_record(&mut self, key: &[u8], value: &[u8], mode: StoreMode) -> Result<()> {
        self.check_writable()?;
        check_key(key)?;
        let hash = self.hash.hash(key);
        let chain = self.chain_for_hash(hash);
        let wait = self.lock_wait;

        let mut db = self.lock_chain(chain, LockMode::Exclusive, wait)?;
        match (mode, db.find(chain, key, hash)?) {
            (StoreMode::Insert, Some(_)) => Err(KvError::KeyExists),
            (StoreMode::Replace, None) => Err(KvError::NotFound),
            (_, Some(location)) => db.replace_value(&location, key, value, hash),
            (_, None) => db.insert_record(chain, key, value, hash).map(|_| ()),
        }
    }

    fn fetch_record(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        check_key(key)?;
        let hash = self.hash.hash(key);
        let chain = self.chain_for_hash(hash);
        let wait = self.lock_wait;

        let mut db = self.lock_chain(chain, LockMode::Shared, wait)?;
        match db.find(chain, key, hash)? {
            Some(location) => db.read_value(&location).map(Some),
            None => Ok(None),
        }
    }

    fn append_record(&mut self, key: &[u8], data: &[u8]) -> Result<()> {
        self.check_writable()?;
        check_key(key)?;
        let hash = self.hash.hash(key);
        let chain = self.chain_for_hash(hash);
        let wait = self.lock_wait;

        let mut db = self.lock_chain(chain, LockMode::Exclusive, wait)?;
        match db.find(chain, key, hash)? {
            Some(location) => {
                let mut value = db.read_value(&location)?;
                value.extend_from_slice(data);
                db.replace_value(&location, key, &value, hash)
            }
            None => db.insert_record(chain, key, data, hash).map(|_| ()),
        }
    }

    fn delete_record(&mut self, key: &[u8]) -> Result<()> {
        self.check_writable()?;
        check_key(key)?;
        let hash = self.hash.hash(key);
        let chain = self.chain_for_hash(hash);
        let wait = self.lock_wait;

        let mut db = self.lock_chain(chain, LockMode::Exclusive, wait)?;
        match db.find(chain, key, hash)? {
            Some(location) => db.remove_record(&location),
            None => Err(KvError::NotFound),
        }
    }

    // =========================================================================
    // Whole-Database Operations
    // =========================================================================

    /// Remove every record; the record space becomes one free record
    pub fn wipe_all(&mut self) -> Result<()> {
        self.guarded(|db| db.wipe_records())
    }

    fn wipe_records(&mut self) -> Result<()> {
        self.check_writable()?;
        let mut db = self.lock_all_chains(LockMode::Exclusive, LockWait::Block)?;
        let mut db = db.lock_allocation()?;
        db.reset_layout()
    }

    /// Rewrite all records densely inside a transaction
    pub fn repack(&mut self) -> Result<()> {
        self.guarded(|db| db.repack_records())
    }

    fn repack_records(&mut self) -> Result<()> {
        self.check_writable()?;
        let owns_transaction = self.transaction.is_none();
        if owns_transaction {
            self.begin_transaction()?;
        }
        let result = self.rebuild_records();
        if !owns_transaction {
            return result;
        }
        match result {
            Ok(()) => self.commit_transaction(),
            Err(e) => {
                if let Err(cancel) = self.cancel_transaction() {
                    warn!(error = %cancel, "failed to cancel repack transaction");
                }
                Err(e)
            }
        }
    }

    fn rebuild_records(&mut self) -> Result<()> {
        let mut records = Vec::new();
        self.traverse_chains_read(|key, value| {
            records.push((key.to_vec(), value.to_vec()));
            Visit::Continue
        })?;
        self.wipe_records()?;
        for (key, value) in &records {
            self.store_record(key, value, StoreMode::Insert)?;
        }
        info!(records = records.len(), "repacked database");
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Path the database was opened with (None for anonymous internal ones)
    pub fn path(&self) -> Option<&Path> {
        self.name.as_deref()
    }

    fn display_name(&self) -> String {
        self.name
            .as_ref()
            .map_or_else(|| "<internal>".to_string(), |p| p.display().to_string())
    }

    pub fn hash_size(&self) -> u32 {
        self.header.hash_size
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.order
    }

    /// Hash function in use (may differ from the requested built-in)
    pub fn hash_function(&self) -> &HashFunction {
        &self.hash
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_internal(&self) -> bool {
        self.backend.is_memory()
    }

    pub fn lock_wait(&self) -> LockWait {
        self.lock_wait
    }

    pub fn set_lock_wait(&mut self, wait: LockWait) {
        self.lock_wait = wait;
    }

    /// Size of the database file (or buffer) in bytes
    pub fn file_len(&mut self) -> Result<u64> {
        self.guarded(|db| db.current_len())
    }

    /// Number of live records according to the header
    pub fn allocated_records(&mut self) -> Result<u32> {
        self.guarded(|db| db.read_u32_at(codec::ALLOCATED_FIELD))
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(name = %self.display_name(), error = %e, "error while closing database");
        }
    }
}

fn check_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        Err(KvError::Invalid("zero-length key".to_string()))
    } else {
        Ok(())
    }
}
