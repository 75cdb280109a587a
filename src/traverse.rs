//! Traversal over every record
//!
//! `traverse` locks one chain at a time, so other handles keep working on
//! the rest of the database and the visitor may delete what it sees.
//! `traverse_read` holds a shared lock on every chain for the whole walk and
//! sees a consistent snapshot.

use crate::database::Database;
use crate::error::{KvError, Result};
use crate::layout::RecordLocation;
use crate::lock::{LockMode, LockWait};
use crate::storage::codec::RECORD_HEADER_SIZE;

/// What a traversal visitor wants next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Continue,
    /// Delete the record just visited, then continue
    Delete,
    Stop,
}

impl Database {
    /// Visit every record, chain by chain. Returns the number visited.
    pub fn traverse<F>(&mut self, visit: F) -> Result<usize>
    where
        F: FnMut(&[u8], &[u8]) -> Visit,
    {
        self.guarded(|db| db.traverse_chains(visit))
    }

    /// Visit every record under a database-wide shared lock
    pub fn traverse_read<F>(&mut self, visit: F) -> Result<usize>
    where
        F: FnMut(&[u8], &[u8]) -> Visit,
    {
        self.guarded(|db| db.traverse_chains_read(visit))
    }

    pub fn record_count(&mut self) -> Result<usize> {
        self.traverse_read(|_, _| Visit::Continue)
    }

    /// All keys, in chain order
    pub fn keys(&mut self) -> Result<Vec<Vec<u8>>> {
        let mut keys = Vec::new();
        self.traverse_read(|key, _| {
            keys.push(key.to_vec());
            Visit::Continue
        })?;
        Ok(keys)
    }

    pub(crate) fn traverse_chains<F>(&mut self, mut visit: F) -> Result<usize>
    where
        F: FnMut(&[u8], &[u8]) -> Visit,
    {
        let mut count = 0;
        for chain in 0..self.header.hash_size {
            let mut db = self.lock_chain(chain, LockMode::Exclusive, LockWait::Block)?;
            if db.walk_chain(chain, &mut visit, &mut count, true)? {
                break;
            }
        }
        Ok(count)
    }

    pub(crate) fn traverse_chains_read<F>(&mut self, mut visit: F) -> Result<usize>
    where
        F: FnMut(&[u8], &[u8]) -> Visit,
    {
        let mut db = self.lock_all_chains(LockMode::Shared, LockWait::Block)?;
        let mut count = 0;
        for chain in 0..db.header.hash_size {
            if db.walk_chain(chain, &mut visit, &mut count, false)? {
                break;
            }
        }
        Ok(count)
    }

    /// Walk one chain; returns true when the visitor asked to stop
    fn walk_chain<F>(
        &mut self,
        chain: u32,
        visit: &mut F,
        count: &mut usize,
        allow_delete: bool,
    ) -> Result<bool>
    where
        F: FnMut(&[u8], &[u8]) -> Visit,
    {
        let mut steps = 0u64;
        let mut prev = None;
        let mut offset = self.chain_head(chain)?;

        while offset != 0 {
            steps += 1;
            if self.walked_too_far(steps)? {
                return Err(KvError::corrupt(format!("loop in hash chain {}", chain)));
            }
            let record = self.read_used_record(offset)?;
            let body = offset as u64 + RECORD_HEADER_SIZE as u64;
            let key = self.read_at(body, record.key_len as usize)?;
            let value = self.read_at(body + record.key_len as u64, record.data_len as usize)?;
            *count += 1;

            match visit(&key[..], &value[..]) {
                Visit::Continue => prev = Some(offset),
                Visit::Delete if !allow_delete => {
                    return Err(KvError::Invalid(
                        "records cannot be deleted during a read traversal".to_string(),
                    ));
                }
                Visit::Delete => {
                    self.remove_record(&RecordLocation {
                        chain,
                        offset,
                        prev,
                        record,
                    })?;
                }
                Visit::Stop => return Ok(true),
            }
            offset = record.next;
        }
        Ok(false)
    }
}
