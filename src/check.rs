//! Integrity check
//!
//! Validates the whole file under a shared lock on every chain plus the
//! allocation lock:
//!
//! 1. The header matches the handle's geometry and hash function
//! 2. Records tile the space from the end of the slot table to end of file,
//!    each with a valid magic, length and matching tailer. Recovery records
//!    left behind by interrupted commits are allowed anywhere, but the
//!    header's recovery area must name one of them
//! 3. Every used record is on exactly one chain, the one its key hashes to,
//!    and its stored hash is correct
//! 4. Every free record is on exactly one free list, the right one
//! 5. The header's allocation count matches the used records
//!
//! Any failure is reported as corruption naming the offending offset.

use std::collections::{HashMap, HashSet};

use crate::database::Database;
use crate::error::{KvError, Result};
use crate::freelist::bucket_for;
use crate::lock::LockMode;
use crate::storage::codec::{
    self, Header, RecordHeader, FREE_BUCKETS, HEADER_SIZE, MIN_RECORD_SIZE, RECORD_ALIGN,
    RECORD_HEADER_SIZE, TAILER_SIZE,
};
use crate::transaction::TransactionState;

type Validator<'a> = &'a mut dyn FnMut(&[u8], &[u8]) -> bool;

/// Records found walking the file, by offset
#[derive(Default)]
struct RecordScan {
    used: HashMap<u32, RecordHeader>,
    free: HashMap<u32, RecordHeader>,
    recovery: HashSet<u32>,
}

impl Database {
    /// Verify the structure of the whole database
    pub fn check(&mut self) -> Result<()> {
        self.guarded(|db| db.check_locked(None))
    }

    /// Like `check`, additionally passing every record to `validator`;
    /// a `false` return fails the check
    pub fn check_with<F>(&mut self, mut validator: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        self.guarded(|db| db.check_locked(Some(&mut validator)))
    }

    fn check_locked(&mut self, validator: Option<Validator<'_>>) -> Result<()> {
        let wait = self.lock_wait;
        let mut db = self.lock_all_chains(LockMode::Shared, wait)?;
        let mut db = db.lock_allocation()?;
        db.verify_structure(validator)
    }

    fn verify_structure(&mut self, mut validator: Option<Validator<'_>>) -> Result<()> {
        let header = self.verify_header()?;
        let RecordScan {
            used,
            free,
            recovery,
        } = self.scan_records()?;
        if header.recovery_area != 0 && !recovery.contains(&header.recovery_area) {
            return Err(KvError::corrupt(format!(
                "recovery area {} is not a recovery record",
                header.recovery_area
            )));
        }

        // Chains
        let mut linked = HashSet::new();
        for chain in 0..self.header.hash_size {
            let mut offset = self.chain_head(chain)?;
            while offset != 0 {
                let record = used.get(&offset).copied().ok_or_else(|| {
                    KvError::corrupt(format!(
                        "chain {} links to {} which is not a used record",
                        chain, offset
                    ))
                })?;
                if !linked.insert(offset) {
                    return Err(KvError::corrupt(format!(
                        "record at {} is linked more than once (seen again on chain {})",
                        offset, chain
                    )));
                }

                let body = offset as u64 + RECORD_HEADER_SIZE as u64;
                let key = self.read_at(body, record.key_len as usize)?;
                let hash = self.hash.hash(&key);
                if hash != record.full_hash {
                    return Err(KvError::corrupt(format!(
                        "record at {} stores hash {:#010x} but its key hashes to {:#010x}",
                        offset, record.full_hash, hash
                    )));
                }
                if self.chain_for_hash(hash) != chain {
                    return Err(KvError::corrupt(format!(
                        "record at {} belongs on chain {} but is linked from chain {}",
                        offset,
                        self.chain_for_hash(hash),
                        chain
                    )));
                }
                if let Some(validate) = validator.as_deref_mut() {
                    let value = self.read_at(body + record.key_len as u64, record.data_len as usize)?;
                    if !validate(&key[..], &value[..]) {
                        return Err(KvError::corrupt(format!(
                            "validator rejected record at {}",
                            offset
                        )));
                    }
                }
                offset = record.next;
            }
        }
        if let Some(orphan) = used.keys().filter(|o| !linked.contains(*o)).min() {
            return Err(KvError::corrupt(format!(
                "used record at {} is not on any chain",
                orphan
            )));
        }

        // Free lists
        let mut listed = HashSet::new();
        for bucket in 0..FREE_BUCKETS {
            let mut offset = self.read_u32_at(codec::bucket_slot(bucket))?;
            while offset != 0 {
                let record = free.get(&offset).copied().ok_or_else(|| {
                    KvError::corrupt(format!(
                        "free list {} links to {} which is not a free record",
                        bucket, offset
                    ))
                })?;
                if !listed.insert(offset) {
                    return Err(KvError::corrupt(format!(
                        "free record at {} is listed more than once",
                        offset
                    )));
                }
                if bucket_for(record.total_len()) != bucket {
                    return Err(KvError::corrupt(format!(
                        "free record at {} ({} bytes) is on free list {}",
                        offset,
                        record.total_len(),
                        bucket
                    )));
                }
                offset = record.next;
            }
        }
        if let Some(orphan) = free.keys().filter(|o| !listed.contains(*o)).min() {
            return Err(KvError::corrupt(format!(
                "free record at {} is not on any free list",
                orphan
            )));
        }

        if header.allocated as usize != used.len() {
            return Err(KvError::corrupt(format!(
                "header counts {} allocated records but {} exist",
                header.allocated,
                used.len()
            )));
        }
        Ok(())
    }

    fn verify_header(&mut self) -> Result<Header> {
        let head = self.read_at(0, HEADER_SIZE as usize)?;
        let header = Header::decode(&head, self.order)?;
        if header.hash_size != self.header.hash_size {
            return Err(KvError::corrupt(format!(
                "header hash size changed from {} to {}",
                self.header.hash_size, header.hash_size
            )));
        }
        if (header.magic1_hash, header.magic2_hash) != self.hash.magic_hashes(self.order) {
            return Err(KvError::corrupt(
                "header hash check values do not match the hash function",
            ));
        }
        if header.recovery_start != 0 && self.transaction_state() != TransactionState::Prepared {
            return Err(KvError::corrupt(format!(
                "recovery pointer {} is set outside a commit",
                header.recovery_start
            )));
        }
        Ok(header)
    }

    /// Walk the record space by length, sorting records by kind
    fn scan_records(&mut self) -> Result<RecordScan> {
        let start = codec::data_start(self.header.hash_size);
        let end = self.current_len()?;
        if end < start {
            return Err(KvError::corrupt(format!(
                "file ({} bytes) ends inside the slot table",
                end
            )));
        }

        let mut scan = RecordScan::default();
        let mut offset = start;
        while offset < end {
            if end - offset < MIN_RECORD_SIZE as u64 {
                return Err(KvError::corrupt(format!(
                    "{} stray bytes after the last record at {}",
                    end - offset,
                    offset
                )));
            }
            let record = self.read_record(offset as u32)?;
            let total = record.total_len();
            if total < MIN_RECORD_SIZE as u64
                || total % RECORD_ALIGN as u64 != 0
                || offset + total > end
            {
                return Err(KvError::corrupt(format!(
                    "record at {} has invalid length {}",
                    offset, total
                )));
            }
            let tailer = self.read_u32_at((offset + total - TAILER_SIZE as u64) as u32)?;
            if tailer as u64 != total {
                return Err(KvError::corrupt(format!(
                    "record at {} has length {} but tailer {}",
                    offset, total, tailer
                )));
            }

            if record.is_used() {
                if !record.payload_fits() {
                    return Err(KvError::corrupt(format!(
                        "record at {} claims {} key and {} data bytes in {} bytes",
                        offset, record.key_len, record.data_len, record.rec_len
                    )));
                }
                scan.used.insert(offset as u32, record);
            } else if record.is_free() {
                scan.free.insert(offset as u32, record);
            } else if record.is_recovery() {
                scan.recovery.insert(offset as u32);
            } else {
                return Err(KvError::corrupt(format!(
                    "record at {} has bad magic {:#010x}",
                    offset, record.magic
                )));
            }
            offset += total;
        }
        Ok(scan)
    }
}
