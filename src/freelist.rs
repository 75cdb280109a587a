//! Free-space management
//!
//! Free records sit on eight size-bucketed singly linked lists whose heads
//! live right after the header. Bucket `b` holds records of
//! `[32 << b, 32 << (b + 1))` bytes; the last bucket is open-ended.
//!
//! Allocation is first-fit starting at the smallest bucket that can hold the
//! request, splitting off the remainder when it is worth a record of its own.
//! Released space merges with free neighbours on both sides: the right one
//! is found by offset arithmetic, the left one through its tailer.
//!
//! Every function here runs under the allocation lock.

use tracing::debug;

use crate::database::Database;
use crate::error::{KvError, Result};
use crate::storage::codec::{
    self, align_up, RecordHeader, ALLOCATED_FIELD, FREE_BUCKETS, MIN_RECORD_SIZE, RECORD_ALIGN,
    RECORD_HEADER_SIZE, RECOVERY_AREA_FIELD, TAILER_SIZE,
};

/// Smallest remainder split off into a free record of its own
const MIN_SPLIT: u32 = 64;

/// Growth granularity of the file
const EXPAND_ALIGN: u64 = 4096;

/// Bucket for a record of `total` bytes
pub(crate) fn bucket_for(total: u64) -> u32 {
    let mut bucket = 0;
    let mut bound = MIN_RECORD_SIZE as u64 * 2;
    while bucket < FREE_BUCKETS - 1 && total >= bound {
        bucket += 1;
        bound *= 2;
    }
    bucket
}

impl Database {
    /// Aligned record size for a key and value
    pub(crate) fn record_size(key_len: usize, data_len: usize) -> Result<u32> {
        let raw = RECORD_HEADER_SIZE as u64 + key_len as u64 + data_len as u64 + TAILER_SIZE as u64;
        let total = align_up(raw).max(MIN_RECORD_SIZE as u64);
        u32::try_from(total).map_err(|_| KvError::TooLarge { requested: total })
    }

    /// Reserve at least `needed` bytes, growing the file if no free record
    /// fits. Returns the record offset and its actual size.
    pub(crate) fn allocate(&mut self, needed: u32) -> Result<(u32, u32)> {
        let mut db = self.lock_allocation()?;
        let (offset, total) = match db.take_free(needed)? {
            Some(found) => found,
            None => {
                db.expand(needed)?;
                db.take_free(needed)?.ok_or_else(|| {
                    KvError::corrupt(format!("no free record of {} bytes after expanding", needed))
                })?
            }
        };

        // Claim the space before dropping the lock so the tiling stays valid
        db.write_record(offset, &RecordHeader::used(total, 0, 0, 0))?;
        db.write_tailer(offset, total)?;
        db.adjust_allocated(1)?;
        Ok((offset, total))
    }

    /// Return a used record's space to the free lists
    pub(crate) fn release(&mut self, offset: u32) -> Result<()> {
        let mut db = self.lock_allocation()?;
        let record = db.read_record(offset)?;
        db.adjust_allocated(-1)?;
        db.free_region(offset, record.total_len())
    }

    /// Return a recovery area's space to the free lists
    pub(crate) fn release_recovery_area(&mut self, offset: u32) -> Result<()> {
        let mut db = self.lock_allocation()?;
        let record = db.read_record(offset)?;
        if !record.is_recovery() {
            return Err(KvError::corrupt(format!(
                "recovery area at {} has magic {:#010x}",
                offset, record.magic
            )));
        }
        db.free_region(offset, record.total_len())
    }

    fn adjust_allocated(&mut self, delta: i32) -> Result<()> {
        let count = self.read_u32_at(ALLOCATED_FIELD)?;
        let count = count.checked_add_signed(delta).ok_or_else(|| {
            KvError::corrupt(format!("allocated record count {} cannot change by {}", count, delta))
        })?;
        self.write_u32_at(ALLOCATED_FIELD, count)
    }

    pub(crate) fn write_tailer(&mut self, offset: u32, total: u32) -> Result<()> {
        self.write_u32_at(offset + total - TAILER_SIZE, total)
    }

    fn read_free_record(&mut self, offset: u32) -> Result<RecordHeader> {
        let record = self.read_record(offset)?;
        if !record.is_free() {
            return Err(KvError::corrupt(format!(
                "free list links to {} which has magic {:#010x}",
                offset, record.magic
            )));
        }
        Ok(record)
    }

    /// Unlink and return the first free record of at least `needed` bytes
    fn take_free(&mut self, needed: u32) -> Result<Option<(u32, u32)>> {
        for bucket in bucket_for(needed as u64)..FREE_BUCKETS {
            let mut steps = 0u64;
            let mut prev = None;
            let mut offset = self.read_u32_at(codec::bucket_slot(bucket))?;

            while offset != 0 {
                steps += 1;
                if self.walked_too_far(steps)? {
                    return Err(KvError::corrupt(format!("loop in free list {}", bucket)));
                }
                let record = self.read_free_record(offset)?;
                let total = record.total_len() as u32;
                if total >= needed {
                    self.unlink_free(bucket, prev, record.next)?;
                    if total - needed >= MIN_SPLIT {
                        self.push_free(offset + needed, total - needed)?;
                        return Ok(Some((offset, needed)));
                    }
                    return Ok(Some((offset, total)));
                }
                prev = Some(offset);
                offset = record.next;
            }
        }
        Ok(None)
    }

    fn unlink_free(&mut self, bucket: u32, prev: Option<u32>, next: u32) -> Result<()> {
        match prev {
            None => self.write_u32_at(codec::bucket_slot(bucket), next),
            Some(prev) => self.write_u32_at(prev, next),
        }
    }

    /// Write a free record and put it at the head of its bucket
    fn push_free(&mut self, offset: u32, total: u32) -> Result<()> {
        let bucket = bucket_for(total as u64);
        let slot = codec::bucket_slot(bucket);
        let mut record = RecordHeader::free(total);
        record.next = self.read_u32_at(slot)?;
        self.write_record(offset, &record)?;
        self.write_tailer(offset, total)?;
        self.write_u32_at(slot, offset)
    }

    /// Remove a specific free record from its bucket
    fn remove_free(&mut self, offset: u32, record: &RecordHeader) -> Result<()> {
        let bucket = bucket_for(record.total_len());
        let mut steps = 0u64;
        let mut prev = None;
        let mut current = self.read_u32_at(codec::bucket_slot(bucket))?;

        while current != 0 {
            if current == offset {
                return self.unlink_free(bucket, prev, record.next);
            }
            steps += 1;
            if self.walked_too_far(steps)? {
                return Err(KvError::corrupt(format!("loop in free list {}", bucket)));
            }
            prev = Some(current);
            current = self.read_free_record(current)?.next;
        }
        Err(KvError::corrupt(format!(
            "free record at {} is missing from free list {}",
            offset, bucket
        )))
    }

    /// Turn `[offset, offset + total)` into free space, merging neighbours
    fn free_region(&mut self, mut offset: u32, mut total: u64) -> Result<()> {
        let end = self.known_len();
        let start = codec::data_start(self.header.hash_size);

        let right = offset as u64 + total;
        if right + MIN_RECORD_SIZE as u64 <= end {
            let neighbour = self.read_record(right as u32)?;
            if neighbour.is_free() {
                self.remove_free(right as u32, &neighbour)?;
                total += neighbour.total_len();
            }
        }

        if offset as u64 >= start + MIN_RECORD_SIZE as u64 {
            let left_total = self.read_u32_at(offset - TAILER_SIZE)? as u64;
            if left_total >= MIN_RECORD_SIZE as u64
                && left_total % RECORD_ALIGN as u64 == 0
                && offset as u64 - left_total >= start
            {
                let left = (offset as u64 - left_total) as u32;
                let neighbour = self.read_record(left)?;
                if neighbour.is_free() && neighbour.total_len() == left_total {
                    self.remove_free(left, &neighbour)?;
                    offset = left;
                    total += left_total;
                }
            }
        }

        let total = u32::try_from(total)
            .map_err(|_| KvError::corrupt(format!("merged free record at {} exceeds 4 GiB", offset)))?;
        self.push_free(offset, total)
    }

    /// Grow the file by at least `needed` bytes, or a quarter of its size
    pub(crate) fn expand(&mut self, needed: u32) -> Result<()> {
        let current = self.current_len()?;
        if current % RECORD_ALIGN as u64 != 0 {
            return Err(KvError::corrupt(format!(
                "file length {} is not record aligned",
                current
            )));
        }

        let limit = u32::MAX as u64 / RECORD_ALIGN as u64 * RECORD_ALIGN as u64;
        let grow = (needed as u64).max(current / 4);
        let mut new_len = (current + grow + EXPAND_ALIGN - 1) / EXPAND_ALIGN * EXPAND_ALIGN;
        if new_len > limit {
            new_len = current + needed as u64;
            if new_len > limit {
                return Err(KvError::TooLarge { requested: new_len });
            }
        }

        self.set_data_len(new_len)?;
        debug!(from = current, to = new_len, "expanded database");
        self.free_region(current as u32, new_len - current)
    }

    /// Empty every chain and free list and free the whole record space
    pub(crate) fn reset_layout(&mut self) -> Result<()> {
        let slots = (FREE_BUCKETS + self.header.hash_size) as usize;
        self.write_at(codec::bucket_slot(0) as u64, &vec![0u8; slots * 4])?;
        self.write_u32_at(ALLOCATED_FIELD, 0)?;
        self.write_u32_at(RECOVERY_AREA_FIELD, 0)?;

        let start = codec::data_start(self.header.hash_size);
        let end = self.current_len()?;
        if end > start {
            let total = u32::try_from(end - start)
                .map_err(|_| KvError::corrupt(format!("record space of {} bytes", end - start)))?;
            self.push_free(start as u32, total)?;
        }
        Ok(())
    }
}
