//! Transaction Module
//!
//! All-or-nothing groups of modifications, at most one per database file.
//!
//! ## Lifecycle
//! ```text
//!  start ──► Active ──prepare──► Prepared ──commit──► (applied)
//!              │                    │
//!              └──────cancel────────┴──► (discarded)
//! ```
//!
//! ## Locking
//! - `start` takes the transaction lock and a shared lock on every chain, so
//!   readers on other handles keep going while writers wait
//! - `prepare` upgrades every chain lock to exclusive and takes the open
//!   lock, so no new handle attaches (and mistakes the live commit for a
//!   crashed one) until the commit is over
//!
//! ## Durability
//! Modifications stay in a private block overlay until commit. Prepare
//! writes the pre-images of every block about to be overwritten into the
//! recovery area, a record of its own inside the record space, and points
//! the header at them; commit then writes the blocks and clears the pointer.
//! The file never shrinks: space the commit added past the old end is
//! covered by the recovery area until the commit lands. A crash at any
//! point leaves either the old state or a pointer that the next open
//! replays.

mod overlay;
mod recovery;

use tracing::{debug, error, warn};

use crate::database::Database;
use crate::error::{KvError, Result};
use crate::lock::{LockAddress, LockMode, LockWait};
use crate::storage::codec::{
    Header, RecordHeader, HEADER_SIZE, MIN_RECORD_SIZE, RECORD_ALIGN, RECORD_HEADER_SIZE,
    RECOVERY_AREA_FIELD, RECOVERY_FIELD, TAILER_SIZE,
};
use crate::storage::Backend;

use overlay::BLOCK_SIZE;
use recovery::UndoLog;

pub(crate) use overlay::Overlay;

/// Smallest recovery area; commits touching a few blocks reuse it in place
const MIN_AREA_SIZE: u64 = 8 * BLOCK_SIZE;

/// Where prepare put the undo log
struct Placement {
    /// Offset of the encoded log
    offset: u64,
    bytes: Vec<u8>,
    entries: usize,
    /// End of the recovery area holding it
    end: u64,
}

/// Where the handle's transaction stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Inactive,
    Active,
    /// Recovery record written; only commit or cancel are allowed
    Prepared,
}

pub(crate) struct Transaction {
    pub(crate) overlay: Overlay,
    state: TransactionState,
    /// Offset of the recovery record, once one has been written
    recovery_offset: Option<u32>,
    /// Whether the chain locks were upgraded to exclusive
    upgraded: bool,
    /// Whether the open lock is held for the commit
    open_locked: bool,
}

impl Transaction {
    fn new(base_len: u64) -> Self {
        Self {
            overlay: Overlay::new(base_len),
            state: TransactionState::Active,
            recovery_offset: None,
            upgraded: false,
            open_locked: false,
        }
    }

    pub(crate) fn write(&mut self, backend: &mut Backend, offset: u64, data: &[u8]) -> Result<()> {
        self.ensure_active()?;
        self.overlay.write(backend, offset, data)
    }

    pub(crate) fn grow(&mut self, len: u64) -> Result<()> {
        self.ensure_active()?;
        self.overlay.grow(len);
        Ok(())
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state {
            TransactionState::Prepared => Err(KvError::Transaction(
                "transaction is prepared; commit or cancel it first".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

impl Database {
    // =========================================================================
    // Public API
    // =========================================================================

    /// Begin a transaction; blocks while another handle has one open
    pub fn transaction_start(&mut self) -> Result<()> {
        self.guarded(|db| db.begin_transaction())
    }

    /// Make the transaction crash-safe without applying it yet
    pub fn transaction_prepare_commit(&mut self) -> Result<()> {
        self.guarded(|db| db.prepare_transaction())
    }

    pub fn transaction_commit(&mut self) -> Result<()> {
        self.guarded(|db| db.commit_transaction())
    }

    pub fn transaction_cancel(&mut self) -> Result<()> {
        self.guarded(|db| db.cancel_transaction())
    }

    pub fn transaction_state(&self) -> TransactionState {
        self.transaction
            .as_ref()
            .map_or(TransactionState::Inactive, |txn| txn.state)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub(crate) fn begin_transaction(&mut self) -> Result<()> {
        if self.read_only {
            return Err(KvError::ReadOnly);
        }
        if self.transaction.is_some() {
            return Err(KvError::Transaction(
                "a transaction is already active on this handle".to_string(),
            ));
        }

        self.lock_transaction()?;
        if let Err(e) = self.acquire_all_chains(LockMode::Shared, LockWait::Block) {
            if let Err(unlock) = self.release_lock(LockAddress::Transaction, LockMode::Exclusive) {
                warn!(error = %unlock, "failed to release transaction lock");
            }
            return Err(e);
        }

        match self.pending_recovery_check() {
            Ok(base_len) => {
                self.transaction = Some(Transaction::new(base_len));
                debug!(base_len, "transaction started");
                Ok(())
            }
            Err(e) => {
                if let Err(unlock) = self.release_transaction_locks(false, false) {
                    warn!(error = %unlock, "failed to release transaction locks");
                }
                Err(e)
            }
        }
    }

    /// Current length, refusing to start over an unrecovered commit
    fn pending_recovery_check(&mut self) -> Result<u64> {
        let base_len = self.backend.refresh()?;
        let head = self.backend.read(0, HEADER_SIZE as usize)?;
        if Header::decode(&head, self.order)?.recovery_start != 0 {
            return Err(KvError::Transaction(
                "an interrupted transaction is pending recovery; reopen the database".to_string(),
            ));
        }
        Ok(base_len)
    }

    pub(crate) fn prepare_transaction(&mut self) -> Result<()> {
        match self.transaction_state() {
            TransactionState::Inactive => {
                return Err(KvError::Transaction("no transaction is active".to_string()))
            }
            TransactionState::Prepared => {
                return Err(KvError::Transaction("transaction is already prepared".to_string()))
            }
            TransactionState::Active => {}
        }

        if let Err(e) = self.write_recovery() {
            error!(error = %e, "failed to prepare transaction; cancelling it");
            if let Err(abort) = self.abort_transaction() {
                warn!(error = %abort, "failed to clean up after prepare");
            }
            return Err(e);
        }
        Ok(())
    }

    fn active_transaction(&mut self) -> Result<&mut Transaction> {
        self.transaction
            .as_mut()
            .ok_or_else(|| KvError::Transaction("no transaction is active".to_string()))
    }

    fn write_recovery(&mut self) -> Result<()> {
        self.acquire_all_chains(LockMode::Exclusive, LockWait::Block)?;
        self.active_transaction()?.upgraded = true;

        // Nothing to protect: memory databases and empty transactions
        if self.backend.is_memory() || self.active_transaction()?.overlay.is_empty() {
            self.active_transaction()?.state = TransactionState::Prepared;
            return Ok(());
        }

        self.acquire_lock(LockAddress::Open, LockMode::Exclusive, LockWait::Block)?;
        self.active_transaction()?.open_locked = true;

        let placement = self.place_recovery()?;
        let base_len = self.active_transaction()?.overlay.base_len();
        if placement.end > base_len {
            // Claim the tail before it exists, so a crash while growing
            // leaves something the next open can reseal
            let claim = u32::try_from(base_len)
                .map_err(|_| KvError::TooLarge { requested: base_len })?;
            self.backend
                .write(RECOVERY_AREA_FIELD as u64, &self.order.u32_bytes(claim))?;
            self.backend.sync()?;
            self.backend.set_len(placement.end)?;
            if !self.seal_tail(base_len)? {
                return Err(KvError::corrupt(format!(
                    "file length {} is not record aligned",
                    base_len
                )));
            }
        }
        self.backend.write(placement.offset, &placement.bytes)?;
        self.backend.sync()?;

        let offset = u32::try_from(placement.offset).map_err(|_| KvError::TooLarge {
            requested: placement.offset,
        })?;
        let pointer = self.order.u32_bytes(offset);
        let txn = self.active_transaction()?;
        txn.recovery_offset = Some(offset);
        txn.overlay.patch_if_dirty(placement.offset, &placement.bytes);
        self.backend.write(RECOVERY_FIELD as u64, &pointer)?;
        self.backend.sync()?;

        let txn = self.active_transaction()?;
        txn.overlay.patch_if_dirty(RECOVERY_FIELD as u64, &pointer);
        txn.state = TransactionState::Prepared;
        debug!(
            offset,
            entries = placement.entries,
            bytes = placement.bytes.len(),
            "recovery record written"
        );
        Ok(())
    }

    fn build_undo_log(&mut self, skip: Option<std::ops::Range<u64>>) -> Result<UndoLog> {
        match &self.transaction {
            Some(txn) => txn.overlay.undo_log(&mut self.backend, skip),
            None => Err(KvError::Transaction("no transaction is active".to_string())),
        }
    }

    /// Find room for the undo log: the current recovery area when it is big
    /// enough, otherwise a new area at the end of the record space. The
    /// area itself is set up through the overlay, so it is part of the
    /// commit.
    fn place_recovery(&mut self) -> Result<Placement> {
        let order = self.order;

        let area = self.read_u32_at(RECOVERY_AREA_FIELD)?;
        if area != 0 {
            let record = self.read_record(area)?;
            if !record.is_recovery() {
                return Err(KvError::corrupt(format!(
                    "recovery area at {} has magic {:#010x}",
                    area, record.magic
                )));
            }
            let body = area as u64 + RECORD_HEADER_SIZE as u64;
            let capacity = record.rec_len as u64 - TAILER_SIZE as u64;
            // The area's own old contents are scratch
            let log = self.build_undo_log(Some(body..body + capacity))?;
            let bytes = log.encode(order)?;
            if bytes.len() as u64 <= capacity {
                return Ok(Placement {
                    offset: body,
                    bytes,
                    entries: log.entries.len(),
                    end: area as u64 + record.total_len(),
                });
            }
            debug!(area, capacity, needed = bytes.len(), "recovery area too small");
            self.release_recovery_area(area)?;
        }

        let start = self.known_len();
        let too_large = |requested: u64| KvError::TooLarge { requested };
        let start32 = u32::try_from(start).map_err(|_| too_large(start))?;

        // Dirty every block below the old end that the area touches before
        // collecting pre-images
        self.set_data_len(start + MIN_RECORD_SIZE as u64)?;
        self.write_u32_at(RECOVERY_AREA_FIELD, start32)?;
        self.write_record(start32, &RecordHeader::recovery(MIN_RECORD_SIZE))?;

        let log = self.build_undo_log(None)?;
        let bytes = log.encode(order)?;
        let raw = RECORD_HEADER_SIZE as u64 + bytes.len() as u64 + TAILER_SIZE as u64;
        let total = ((raw + BLOCK_SIZE - 1) / BLOCK_SIZE * BLOCK_SIZE).max(MIN_AREA_SIZE);
        let end = start + total;
        let total32 = u32::try_from(total)
            .ok()
            .filter(|_| end <= u32::MAX as u64)
            .ok_or_else(|| too_large(end))?;

        self.set_data_len(end)?;
        self.write_record(start32, &RecordHeader::recovery(total32))?;
        let body = start + RECORD_HEADER_SIZE as u64;
        self.write_at(body, &bytes)?;
        self.write_tailer(start32, total32)?;
        debug!(offset = start, bytes = total, "new recovery area");

        Ok(Placement {
            offset: body,
            bytes,
            entries: log.entries.len(),
            end,
        })
    }

    /// Cover the file past `old_len` with one recovery record and make it
    /// the recovery area. Until a commit lands, space it added at the end
    /// belongs to nothing else. Returns `false` when the tail cannot hold a
    /// record and has to be cut off instead.
    pub(crate) fn seal_tail(&mut self, old_len: u64) -> Result<bool> {
        let len = self.backend.len();
        if len <= old_len {
            return Ok(true);
        }
        let span = len - old_len;
        let (Ok(offset), Ok(total)) = (u32::try_from(old_len), u32::try_from(span)) else {
            return Err(KvError::TooLarge { requested: len });
        };
        if total < MIN_RECORD_SIZE || total % RECORD_ALIGN != 0 {
            return Ok(false);
        }

        let order = self.order;
        self.backend
            .write(old_len, &RecordHeader::recovery(total).encode(order))?;
        self.backend
            .write(len - TAILER_SIZE as u64, &order.u32_bytes(total))?;
        self.backend
            .write(RECOVERY_AREA_FIELD as u64, &order.u32_bytes(offset))?;
        Ok(true)
    }

    pub(crate) fn commit_transaction(&mut self) -> Result<()> {
        match self.transaction_state() {
            TransactionState::Inactive => {
                return Err(KvError::Transaction("no transaction is active".to_string()))
            }
            TransactionState::Active => self.prepare_transaction()?,
            TransactionState::Prepared => {}
        }
        let Some(txn) = self.transaction.take() else {
            return Err(KvError::Transaction("no transaction is active".to_string()));
        };

        let result = self.apply_transaction(&txn);
        if let Err(e) = &result {
            error!(error = %e, "commit failed while applying changes");
            if let Some(offset) = txn.recovery_offset {
                if let Err(replay) = self.replay_recovery(offset) {
                    error!(error = %replay, "rollback failed; the next open will retry it");
                }
            }
        }
        let unlock = self.release_transaction_locks(txn.upgraded, txn.open_locked);
        result.and(unlock)
    }

    fn apply_transaction(&mut self, txn: &Transaction) -> Result<()> {
        let new_len = txn.overlay.len();
        if self.backend.len() < new_len {
            self.backend.set_len(new_len)?;
        }
        for (offset, bytes) in txn.overlay.dirty_ranges() {
            self.backend.write(offset, bytes)?;
        }
        self.backend.sync()?;

        if txn.recovery_offset.is_some() {
            self.backend.write(RECOVERY_FIELD as u64, &self.order.u32_bytes(0))?;
            self.backend.sync()?;
        }
        debug!(
            blocks = txn.overlay.dirty_blocks(),
            len = new_len,
            "transaction committed"
        );
        Ok(())
    }

    pub(crate) fn cancel_transaction(&mut self) -> Result<()> {
        if self.transaction.is_none() {
            return Err(KvError::Transaction("no transaction is active".to_string()));
        }
        debug!("transaction cancelled");
        self.abort_transaction()
    }

    /// Discard the overlay and any recovery record, then unlock
    fn abort_transaction(&mut self) -> Result<()> {
        let Some(txn) = self.transaction.take() else {
            return Ok(());
        };
        let mut result = Ok(());
        if txn.open_locked {
            // Live data was never touched beyond the recovery area
            result = self.retire_recovery(txn.overlay.base_len());
        }
        let unlock = self.release_transaction_locks(txn.upgraded, txn.open_locked);
        result.and(unlock)
    }

    fn retire_recovery(&mut self, base_len: u64) -> Result<()> {
        self.backend.write(RECOVERY_FIELD as u64, &self.order.u32_bytes(0))?;
        self.backend.sync()?;
        self.repair_recovery_area()
    }

    fn release_transaction_locks(&mut self, upgraded: bool, open_locked: bool) -> Result<()> {
        let mut result = Ok(());
        if open_locked {
            result = result.and(self.release_lock(LockAddress::Open, LockMode::Exclusive));
        }
        if upgraded {
            result = result.and(self.release_all_chains(LockMode::Exclusive));
        }
        result = result.and(self.release_all_chains(LockMode::Shared));
        result.and(self.release_lock(LockAddress::Transaction, LockMode::Exclusive))
    }
}
