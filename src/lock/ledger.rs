//! Per-handle lock ledger
//!
//! OS advisory locks do not nest, so the ledger counts how many times each
//! address is held in each mode and only reports an OS action when the
//! strongest held mode changes.

use super::{LockAddress, LockMode};
use crate::error::{KvError, Result};

/// What must happen at the OS level for a ledger transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OsAction {
    None,
    /// Take the lock in this mode (also used to upgrade and downgrade)
    Lock(LockMode),
    Unlock,
}

#[derive(Debug, Clone)]
struct LedgerEntry {
    address: LockAddress,
    shared: u32,
    exclusive: u32,
}

impl LedgerEntry {
    fn mode(&self) -> Option<LockMode> {
        if self.exclusive > 0 {
            Some(LockMode::Exclusive)
        } else if self.shared > 0 {
            Some(LockMode::Shared)
        } else {
            None
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct LockLedger {
    entries: Vec<LedgerEntry>,
}

impl LockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, address: LockAddress) -> Option<usize> {
        self.entries.iter().position(|e| e.address == address)
    }

    /// Strongest mode this handle holds on `address`
    pub fn held(&self, address: LockAddress) -> Option<LockMode> {
        self.position(address).and_then(|i| self.entries[i].mode())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn plan_acquire(&self, address: LockAddress, mode: LockMode) -> OsAction {
        match (self.held(address), mode) {
            (None, _) => OsAction::Lock(mode),
            (Some(LockMode::Shared), LockMode::Exclusive) => OsAction::Lock(LockMode::Exclusive),
            _ => OsAction::None,
        }
    }

    pub fn record_acquire(&mut self, address: LockAddress, mode: LockMode) {
        let i = match self.position(address) {
            Some(i) => i,
            None => {
                self.entries.push(LedgerEntry {
                    address,
                    shared: 0,
                    exclusive: 0,
                });
                self.entries.len() - 1
            }
        };
        match mode {
            LockMode::Shared => self.entries[i].shared += 1,
            LockMode::Exclusive => self.entries[i].exclusive += 1,
        }
    }

    pub fn plan_release(&self, address: LockAddress, mode: LockMode) -> Result<OsAction> {
        let entry = self
            .position(address)
            .map(|i| &self.entries[i])
            .filter(|e| match mode {
                LockMode::Shared => e.shared > 0,
                LockMode::Exclusive => e.exclusive > 0,
            })
            .ok_or_else(|| {
                KvError::Invalid(format!("unlock of {:?} ({:?}) which is not held", address, mode))
            })?;

        let (shared, exclusive) = match mode {
            LockMode::Shared => (entry.shared - 1, entry.exclusive),
            LockMode::Exclusive => (entry.shared, entry.exclusive - 1),
        };
        Ok(match (shared, exclusive) {
            (0, 0) => OsAction::Unlock,
            (_, 0) if entry.exclusive > 0 => OsAction::Lock(LockMode::Shared),
            _ => OsAction::None,
        })
    }

    pub fn record_release(&mut self, address: LockAddress, mode: LockMode) {
        if let Some(i) = self.position(address) {
            let entry = &mut self.entries[i];
            match mode {
                LockMode::Shared => entry.shared = entry.shared.saturating_sub(1),
                LockMode::Exclusive => entry.exclusive = entry.exclusive.saturating_sub(1),
            }
            if entry.mode().is_none() {
                self.entries.swap_remove(i);
            }
        }
    }

    /// Forget every entry, returning the addresses that were held
    pub fn drain(&mut self) -> Vec<LockAddress> {
        self.entries.drain(..).map(|e| e.address).collect()
    }
}
