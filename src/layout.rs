//! Hash chain layout
//!
//! Each chain slot holds the offset of the newest record hashing to it;
//! records link to older ones through `next`. Lookups compare the full
//! 32-bit hash and key length before reading the key itself.

use crate::database::Database;
use crate::error::{KvError, Result};
use crate::storage::codec::{
    self, RecordHeader, MIN_RECORD_SIZE, RECORD_ALIGN, RECORD_HEADER_SIZE, TAILER_SIZE,
};

/// A record found on a chain, with its predecessor for unlinking
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecordLocation {
    pub chain: u32,
    pub offset: u32,
    /// None when the record is the chain head
    pub prev: Option<u32>,
    pub record: RecordHeader,
}

impl Database {
    /// Index of the chain `key` lives on
    pub fn chain_of(&self, key: &[u8]) -> u32 {
        self.chain_for_hash(self.hash.hash(key))
    }

    pub(crate) fn chain_for_hash(&self, hash: u32) -> u32 {
        hash % self.header.hash_size
    }

    pub(crate) fn chain_head(&mut self, chain: u32) -> Result<u32> {
        self.read_u32_at(codec::chain_slot(chain))
    }

    fn set_chain_head(&mut self, chain: u32, offset: u32) -> Result<()> {
        self.write_u32_at(codec::chain_slot(chain), offset)
    }

    /// Whether a walk of `steps` links is longer than the file could hold.
    /// Another process may have grown the file, so the cached length is
    /// only trusted when it clears the walk.
    pub(crate) fn walked_too_far(&mut self, steps: u64) -> Result<bool> {
        let records = |len: u64| len / MIN_RECORD_SIZE as u64 + 1;
        if steps <= records(self.known_len()) {
            return Ok(false);
        }
        Ok(steps > records(self.current_len()?))
    }

    /// Read a record reached through a link and insist it is a live record
    pub(crate) fn read_used_record(&mut self, offset: u32) -> Result<RecordHeader> {
        let start = codec::data_start(self.header.hash_size);
        let end = offset as u64 + MIN_RECORD_SIZE as u64;
        let len = match self.known_len() {
            known if end > known => self.current_len()?,
            known => known,
        };
        if (offset as u64) < start || offset % RECORD_ALIGN != 0 || end > len {
            return Err(KvError::corrupt(format!(
                "link to offset {} points outside the record space",
                offset
            )));
        }
        let record = self.read_record(offset)?;
        if !record.is_used() {
            return Err(KvError::corrupt(format!(
                "record at {} has magic {:#010x}, expected a used record",
                offset, record.magic
            )));
        }
        if !record.payload_fits() {
            return Err(KvError::corrupt(format!(
                "record at {} claims {} key and {} data bytes in {} bytes",
                offset, record.key_len, record.data_len, record.rec_len
            )));
        }
        Ok(record)
    }

    /// Walk `chain` looking for `key`
    pub(crate) fn find(&mut self, chain: u32, key: &[u8], hash: u32) -> Result<Option<RecordLocation>> {
        let mut steps = 0u64;
        let mut prev = None;
        let mut offset = self.chain_head(chain)?;

        while offset != 0 {
            steps += 1;
            if self.walked_too_far(steps)? {
                return Err(KvError::corrupt(format!("loop in hash chain {}", chain)));
            }
            let record = self.read_used_record(offset)?;
            if record.full_hash == hash && record.key_len as usize == key.len() {
                let stored = self.read_at(offset as u64 + RECORD_HEADER_SIZE as u64, key.len())?;
                if stored == key {
                    return Ok(Some(RecordLocation {
                        chain,
                        offset,
                        prev,
                        record,
                    }));
                }
            }
            prev = Some(offset);
            offset = record.next;
        }
        Ok(None)
    }

    pub(crate) fn read_value(&mut self, location: &RecordLocation) -> Result<Vec<u8>> {
        let start = location.offset as u64 + RECORD_HEADER_SIZE as u64 + location.record.key_len as u64;
        self.read_at(start, location.record.data_len as usize)
    }

    /// Allocate a record for `key`/`value` and push it on the front of `chain`
    pub(crate) fn insert_record(&mut self, chain: u32, key: &[u8], value: &[u8], hash: u32) -> Result<u32> {
        let needed = Self::record_size(key.len(), value.len())?;
        let (offset, total) = self.allocate(needed)?;

        let mut record = RecordHeader::used(total, key.len() as u32, value.len() as u32, hash);
        record.next = self.chain_head(chain)?;

        let body = offset as u64 + RECORD_HEADER_SIZE as u64;
        self.write_at(body, key)?;
        self.write_at(body + key.len() as u64, value)?;
        self.write_record(offset, &record)?;

        // Linked last: a reader never sees a half-written record
        self.set_chain_head(chain, offset)?;
        Ok(offset)
    }

    /// Replace the value of a located record, in place when it fits
    pub(crate) fn replace_value(
        &mut self,
        location: &RecordLocation,
        key: &[u8],
        value: &[u8],
        hash: u32,
    ) -> Result<()> {
        if self.update_in_place(location, value)? {
            return Ok(());
        }
        self.remove_record(location)?;
        self.insert_record(location.chain, key, value, hash)?;
        Ok(())
    }

    fn update_in_place(&mut self, location: &RecordLocation, value: &[u8]) -> Result<bool> {
        let mut record = location.record;
        let capacity = record.rec_len as u64 - TAILER_SIZE as u64;
        if record.key_len as u64 + value.len() as u64 > capacity {
            return Ok(false);
        }
        let start = location.offset as u64 + RECORD_HEADER_SIZE as u64 + record.key_len as u64;
        self.write_at(start, value)?;
        record.data_len = value.len() as u32;
        self.write_record(location.offset, &record)?;
        Ok(true)
    }

    /// Unlink a record from its chain and hand its space back
    pub(crate) fn remove_record(&mut self, location: &RecordLocation) -> Result<()> {
        match location.prev {
            None => self.set_chain_head(location.chain, location.record.next)?,
            // `next` is the first field of a record
            Some(prev) => self.write_u32_at(prev, location.record.next)?,
        }
        self.release(location.offset)
    }
}
