//! Lock Module
//!
//! Cross-process coordination through advisory byte-range locks on the
//! database file itself; no daemon or side channel is involved.
//!
//! ## Responsibilities
//! - Map logical lock addresses to lock bytes past the data region
//! - Count nested acquisitions per handle (the OS primitive does not nest)
//! - Take all chain locks in ascending order
//! - Release through scoped guards on every exit path
//!
//! ## Lock Byte Layout
//! ```text
//! 2^32 + 0    Open lock         (file initialization)
//! 2^32 + 1    Transaction lock  (one transaction at a time)
//! 2^32 + 2    Allocation lock   (free-list structure)
//! 2^32 + 3    Active lock       (clear-if-first detection)
//! 2^32 + 16+i Chain lock i
//! ```
//!
//! Data offsets are `u32`, so lock bytes never overlap records.

mod fcntl;
mod guard;
mod ledger;

use std::fs::File;

use tracing::{trace, warn};

use crate::database::Database;
use crate::error::{KvError, Result};

pub use guard::LockGuard;
pub(crate) use ledger::{LockLedger, OsAction};

/// First lock byte; every data offset is below it
pub const LOCK_BASE: u64 = 1 << 32;

/// Lock slot of chain 0
const CHAIN_SLOT_BASE: u64 = 16;

/// A logical lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockAddress {
    Open,
    Transaction,
    Allocation,
    Active,
    Chain(u32),
}

impl LockAddress {
    pub fn byte_offset(self) -> u64 {
        LOCK_BASE
            + match self {
                LockAddress::Open => 0,
                LockAddress::Transaction => 1,
                LockAddress::Allocation => 2,
                LockAddress::Active => 3,
                LockAddress::Chain(i) => CHAIN_SLOT_BASE + i as u64,
            }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Whether a lock request waits for a busy lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockWait {
    #[default]
    Block,
    /// Fail immediately with `KvError::WouldBlock`
    NoWait,
}

/// Ledger plus the OS primitive
pub(crate) struct Locker {
    ledger: LockLedger,
    /// False for internal, read-only and no-lock handles
    enabled: bool,
}

impl Locker {
    pub fn new(enabled: bool) -> Self {
        Self {
            ledger: LockLedger::new(),
            enabled,
        }
    }

    pub fn held(&self, address: LockAddress) -> Option<LockMode> {
        self.ledger.held(address)
    }

    pub fn acquire(
        &mut self,
        file: Option<&File>,
        address: LockAddress,
        mode: LockMode,
        wait: LockWait,
    ) -> Result<()> {
        if let OsAction::Lock(os_mode) = self.ledger.plan_acquire(address, mode) {
            if let (true, Some(file)) = (self.enabled, file) {
                if !fcntl::lock_range(file, address.byte_offset(), 1, os_mode, wait)? {
                    trace!(?address, ?mode, "lock busy");
                    return Err(KvError::WouldBlock);
                }
            }
        }
        self.ledger.record_acquire(address, mode);
        Ok(())
    }

    pub fn release(
        &mut self,
        file: Option<&File>,
        address: LockAddress,
        mode: LockMode,
    ) -> Result<()> {
        let action = self.ledger.plan_release(address, mode)?;
        self.ledger.record_release(address, mode);
        if let (true, Some(file)) = (self.enabled, file) {
            match action {
                OsAction::None => {}
                OsAction::Unlock => fcntl::unlock_range(file, address.byte_offset(), 1)?,
                OsAction::Lock(os_mode) => {
                    // Downgrade from exclusive; cannot block
                    fcntl::lock_range(file, address.byte_offset(), 1, os_mode, LockWait::Block)?;
                }
            }
        }
        Ok(())
    }

    /// Drop every lock still held (handle teardown)
    pub fn release_all(&mut self, file: Option<&File>) {
        for address in self.ledger.drain() {
            if let (true, Some(file)) = (self.enabled, file) {
                if let Err(e) = fcntl::unlock_range(file, address.byte_offset(), 1) {
                    warn!(?address, error = %e, "failed to release lock on close");
                }
            }
        }
    }
}

// =============================================================================
// Database lock helpers
// =============================================================================

impl Database {
    pub(crate) fn acquire_lock(
        &mut self,
        address: LockAddress,
        mode: LockMode,
        wait: LockWait,
    ) -> Result<()> {
        self.locks.acquire(self.backend.file(), address, mode, wait)
    }

    pub(crate) fn release_lock(&mut self, address: LockAddress, mode: LockMode) -> Result<()> {
        self.locks.release(self.backend.file(), address, mode)
    }

    /// Take every chain lock in ascending order, unwinding on failure
    pub(crate) fn acquire_all_chains(&mut self, mode: LockMode, wait: LockWait) -> Result<()> {
        for chain in 0..self.header.hash_size {
            if let Err(e) = self.acquire_lock(LockAddress::Chain(chain), mode, wait) {
                for taken in (0..chain).rev() {
                    if let Err(unwind) = self.release_lock(LockAddress::Chain(taken), mode) {
                        warn!(chain = taken, error = %unwind, "failed to unwind chain lock");
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    pub(crate) fn release_all_chains(&mut self, mode: LockMode) -> Result<()> {
        let mut first_error = None;
        for chain in (0..self.header.hash_size).rev() {
            if let Err(e) = self.release_lock(LockAddress::Chain(chain), mode) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Scoped lock on a single address
    pub(crate) fn lock(
        &mut self,
        address: LockAddress,
        mode: LockMode,
        wait: LockWait,
    ) -> Result<LockGuard<'_>> {
        self.acquire_lock(address, mode, wait)?;
        Ok(LockGuard::new(self, vec![(address, mode)]))
    }

    pub(crate) fn lock_chain(
        &mut self,
        chain: u32,
        mode: LockMode,
        wait: LockWait,
    ) -> Result<LockGuard<'_>> {
        self.lock(LockAddress::Chain(chain), mode, wait)
    }

    pub(crate) fn lock_all_chains(
        &mut self,
        mode: LockMode,
        wait: LockWait,
    ) -> Result<LockGuard<'_>> {
        self.acquire_all_chains(mode, wait)?;
        let held = (0..self.header.hash_size)
            .map(|chain| (LockAddress::Chain(chain), mode))
            .collect();
        Ok(LockGuard::new(self, held))
    }

    pub(crate) fn lock_allocation(&mut self) -> Result<LockGuard<'_>> {
        self.lock(LockAddress::Allocation, LockMode::Exclusive, LockWait::Block)
    }

    /// Serializes opens against each other and against a commit in progress
    pub(crate) fn lock_open(&mut self, wait: LockWait) -> Result<LockGuard<'_>> {
        self.lock(LockAddress::Open, LockMode::Exclusive, wait)
    }

    pub(crate) fn lock_transaction(&mut self) -> Result<()> {
        self.acquire_lock(LockAddress::Transaction, LockMode::Exclusive, LockWait::Block)
    }

    // -------------------------------------------------------------------------
    // Public guards
    // -------------------------------------------------------------------------

    /// Lock the chain holding `key` exclusively until the guard drops.
    ///
    /// Record operations made through the guard reuse the held lock.
    pub fn lock_chain_of(&mut self, key: &[u8]) -> Result<LockGuard<'_>> {
        let chain = self.chain_of(key);
        self.guarded(|db| db.acquire_lock(LockAddress::Chain(chain), LockMode::Exclusive, LockWait::Block))?;
        Ok(LockGuard::new(self, vec![(LockAddress::Chain(chain), LockMode::Exclusive)]))
    }

    /// Like `lock_chain_of`, but fails with `WouldBlock` instead of waiting
    pub fn try_lock_chain_of(&mut self, key: &[u8]) -> Result<LockGuard<'_>> {
        let chain = self.chain_of(key);
        self.guarded(|db| db.acquire_lock(LockAddress::Chain(chain), LockMode::Exclusive, LockWait::NoWait))?;
        Ok(LockGuard::new(self, vec![(LockAddress::Chain(chain), LockMode::Exclusive)]))
    }

    /// Exclusive lock on every chain
    pub fn lock_all(&mut self) -> Result<LockGuard<'_>> {
        self.guarded(|db| db.acquire_all_chains(LockMode::Exclusive, LockWait::Block))?;
        self.all_chains_guard(LockMode::Exclusive)
    }

    pub fn try_lock_all(&mut self) -> Result<LockGuard<'_>> {
        self.guarded(|db| db.acquire_all_chains(LockMode::Exclusive, LockWait::NoWait))?;
        self.all_chains_guard(LockMode::Exclusive)
    }

    /// Shared lock on every chain: readers proceed, writers wait
    pub fn read_lock_all(&mut self) -> Result<LockGuard<'_>> {
        self.guarded(|db| db.acquire_all_chains(LockMode::Shared, LockWait::Block))?;
        self.all_chains_guard(LockMode::Shared)
    }

    fn all_chains_guard(&mut self, mode: LockMode) -> Result<LockGuard<'_>> {
        let held = (0..self.header.hash_size)
            .map(|chain| (LockAddress::Chain(chain), mode))
            .collect();
        Ok(LockGuard::new(self, held))
    }
}
