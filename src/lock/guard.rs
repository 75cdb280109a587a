//! Scoped lock guard
//!
//! Holds one or more ledger entries and releases them, newest first, when
//! dropped. The guard dereferences to the database, so work done under the
//! lock goes through it and the borrow checker keeps the lock alive for
//! exactly that long.

use std::ops::{Deref, DerefMut};

use tracing::warn;

use super::{LockAddress, LockMode};
use crate::database::Database;

pub struct LockGuard<'a> {
    db: &'a mut Database,
    held: Vec<(LockAddress, LockMode)>,
}

impl<'a> LockGuard<'a> {
    pub(crate) fn new(db: &'a mut Database, held: Vec<(LockAddress, LockMode)>) -> Self {
        Self { db, held }
    }

    /// Locks covered by this guard
    pub fn held(&self) -> &[(LockAddress, LockMode)] {
        &self.held
    }
}

impl Deref for LockGuard<'_> {
    type Target = Database;

    fn deref(&self) -> &Database {
        self.db
    }
}

impl DerefMut for LockGuard<'_> {
    fn deref_mut(&mut self) -> &mut Database {
        self.db
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        while let Some((address, mode)) = self.held.pop() {
            if let Err(e) = self.db.release_lock(address, mode) {
                warn!(?address, ?mode, error = %e, "failed to release lock");
            }
        }
    }
}
