//! Recovery record
//!
//! Before a commit touches live data, the pre-images of every block it will
//! overwrite are written into the recovery area and the header's recovery
//! pointer is set to them. If the commit is interrupted, the next open
//! copies the pre-images back and hands whatever the commit added past the
//! old length to the recovery area. The pointer is cleared last, so an
//! interrupted replay simply runs again.
//!
//! ## Record Layout
//! ```text
//! +----------+---------+-------+-------------+--------------------+-------+
//! | magic:4  | old:4   | n:4   | payload:4   | n x {off, len, ..} | crc:4 |
//! +----------+---------+-------+-------------+--------------------+-------+
//! ```
//! Integers use the file's byte order; the CRC32 covers everything before it.

use bytes::{Buf, BufMut, BytesMut};
use tracing::{info, warn};

use crate::database::Database;
use crate::error::{KvError, Result};
use crate::storage::codec::{
    self, ByteOrder, Header, RecordHeader, HEADER_SIZE, MIN_RECORD_SIZE, RECORD_ALIGN,
    RECORD_HEADER_SIZE, RECOVERY_AREA_FIELD, RECOVERY_FIELD, RECOVERY_MAGIC, TAILER_SIZE,
};

const PREFIX_SIZE: usize = 16;
const ENTRY_HEADER_SIZE: usize = 8;
const CRC_SIZE: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct UndoEntry {
    pub offset: u64,
    pub bytes: Vec<u8>,
}

/// Everything needed to put the file back as it was
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct UndoLog {
    pub old_len: u64,
    pub entries: Vec<UndoEntry>,
}

fn put_u32(buf: &mut BytesMut, order: ByteOrder, value: u32) {
    match order {
        ByteOrder::Little => buf.put_u32_le(value),
        ByteOrder::Big => buf.put_u32(value),
    }
}

fn get_u32(buf: &mut &[u8], order: ByteOrder) -> u32 {
    match order {
        ByteOrder::Little => buf.get_u32_le(),
        ByteOrder::Big => buf.get_u32(),
    }
}

fn to_u32(value: u64) -> Result<u32> {
    u32::try_from(value).map_err(|_| KvError::TooLarge { requested: value })
}

impl UndoLog {
    pub fn encode(&self, order: ByteOrder) -> Result<Vec<u8>> {
        let payload: usize = self
            .entries
            .iter()
            .map(|e| ENTRY_HEADER_SIZE + e.bytes.len())
            .sum();

        let mut buf = BytesMut::with_capacity(PREFIX_SIZE + payload + CRC_SIZE);
        put_u32(&mut buf, order, RECOVERY_MAGIC);
        put_u32(&mut buf, order, to_u32(self.old_len)?);
        put_u32(&mut buf, order, to_u32(self.entries.len() as u64)?);
        put_u32(&mut buf, order, to_u32(payload as u64)?);
        for entry in &self.entries {
            put_u32(&mut buf, order, to_u32(entry.offset)?);
            put_u32(&mut buf, order, to_u32(entry.bytes.len() as u64)?);
            buf.put_slice(&entry.bytes);
        }
        let crc = crc32fast::hash(&buf);
        put_u32(&mut buf, order, crc);
        Ok(buf.to_vec())
    }

    /// Full encoded length, read from the fixed prefix
    pub fn encoded_len(prefix: &[u8], order: ByteOrder) -> Result<u64> {
        if prefix.len() < PREFIX_SIZE {
            return Err(KvError::corrupt("recovery record prefix is truncated"));
        }
        let mut cursor = prefix;
        let magic = get_u32(&mut cursor, order);
        if magic != RECOVERY_MAGIC {
            return Err(KvError::corrupt(format!(
                "recovery record has magic {:#010x}",
                magic
            )));
        }
        let _old_len = get_u32(&mut cursor, order);
        let _count = get_u32(&mut cursor, order);
        let payload = get_u32(&mut cursor, order);
        Ok((PREFIX_SIZE + CRC_SIZE) as u64 + payload as u64)
    }

    pub fn decode(bytes: &[u8], order: ByteOrder) -> Result<Self> {
        let total = Self::encoded_len(bytes, order)?;
        if bytes.len() as u64 != total {
            return Err(KvError::corrupt(format!(
                "recovery record is {} bytes, expected {}",
                bytes.len(),
                total
            )));
        }
        let (body, mut crc_bytes) = bytes.split_at(bytes.len() - CRC_SIZE);
        let stored = get_u32(&mut crc_bytes, order);
        let actual = crc32fast::hash(body);
        if stored != actual {
            return Err(KvError::corrupt(format!(
                "recovery record checksum mismatch: stored {:#010x}, computed {:#010x}",
                stored, actual
            )));
        }

        let mut cursor = &body[4..];
        let old_len = get_u32(&mut cursor, order) as u64;
        let count = get_u32(&mut cursor, order);
        let _payload = get_u32(&mut cursor, order);

        let mut entries = Vec::new();
        for _ in 0..count {
            if cursor.remaining() < ENTRY_HEADER_SIZE {
                return Err(KvError::corrupt("recovery entry header is truncated"));
            }
            let offset = get_u32(&mut cursor, order) as u64;
            let len = get_u32(&mut cursor, order) as usize;
            if cursor.remaining() < len {
                return Err(KvError::corrupt("recovery entry data is truncated"));
            }
            if offset + len as u64 > old_len {
                return Err(KvError::corrupt(format!(
                    "recovery entry {}+{} lies past the old length {}",
                    offset, len, old_len
                )));
            }
            entries.push(UndoEntry {
                offset,
                bytes: cursor[..len].to_vec(),
            });
            cursor.advance(len);
        }
        if cursor.has_remaining() {
            return Err(KvError::corrupt("trailing bytes in recovery record"));
        }
        Ok(Self { old_len, entries })
    }
}

impl Database {
    /// Replay an interrupted commit found at open
    pub(crate) fn recover(&mut self) -> Result<()> {
        let head = self.backend.read(0, HEADER_SIZE as usize)?;
        let header = Header::decode(&head, self.order)?;
        if header.recovery_start == 0 {
            return self.repair_recovery_area();
        }
        if self.read_only {
            return Err(KvError::Transaction(
                "an interrupted transaction must be recovered; open read-write".to_string(),
            ));
        }
        warn!(
            offset = header.recovery_start,
            "found an interrupted transaction, restoring pre-commit state"
        );
        self.replay_recovery(header.recovery_start)?;
        self.repair_recovery_area()
    }

    /// Make the header's recovery area a whole recovery record again after
    /// a commit was cut short while growing the file
    pub(crate) fn repair_recovery_area(&mut self) -> Result<()> {
        let head = self.backend.read(0, HEADER_SIZE as usize)?;
        let area = Header::decode(&head, self.order)?.recovery_area;
        if area == 0 || self.is_whole_recovery_record(area)? {
            return Ok(());
        }
        if (area as u64) < codec::data_start(self.header.hash_size) {
            return Err(KvError::corrupt(format!(
                "recovery area {} lies inside the slot table",
                area
            )));
        }
        if self.read_only {
            return Err(KvError::Transaction(
                "an interrupted transaction must be recovered; open read-write".to_string(),
            ));
        }

        let len = self.backend.len();
        warn!(area, len, "recovery area was cut short, resealing the end of the file");
        if (area as u64) >= len || !self.seal_tail(area as u64)? {
            if (area as u64) < len {
                self.backend.set_len(area as u64)?;
            }
            self.backend
                .write(RECOVERY_AREA_FIELD as u64, &self.order.u32_bytes(0))?;
        }
        self.backend.sync()
    }

    fn is_whole_recovery_record(&mut self, offset: u32) -> Result<bool> {
        let len = self.backend.len();
        let start = offset as u64;
        if start + RECORD_HEADER_SIZE as u64 > len {
            return Ok(false);
        }
        let bytes = self.backend.read(start, RECORD_HEADER_SIZE as usize)?;
        let record = RecordHeader::decode(&bytes, self.order);
        let total = record.total_len();
        if !record.is_recovery()
            || total < MIN_RECORD_SIZE as u64
            || total % RECORD_ALIGN as u64 != 0
            || start + total > len
        {
            return Ok(false);
        }
        let tailer = self.backend.read(start + total - TAILER_SIZE as u64, TAILER_SIZE as usize)?;
        Ok(self.order.read_u32(&tailer) as u64 == total)
    }

    /// Copy the pre-images at `start` back into place
    pub(crate) fn replay_recovery(&mut self, pointer: u32) -> Result<()> {
        let len = self.backend.refresh()?;
        let start = pointer as u64;
        if start < codec::data_start(self.header.hash_size) || start + PREFIX_SIZE as u64 > len {
            return Err(KvError::corrupt(format!(
                "recovery pointer {} lies outside the file ({} bytes)",
                start, len
            )));
        }

        let prefix = self.backend.read(start, PREFIX_SIZE)?;
        let total = UndoLog::encoded_len(&prefix, self.order)?;
        if start + total > len {
            return Err(KvError::corrupt(format!(
                "recovery record at {} runs past the end of the file",
                start
            )));
        }
        let bytes = self.backend.read(start, total as usize)?;
        let log = UndoLog::decode(&bytes, self.order)?;
        if let Some(entry) = log
            .entries
            .iter()
            .find(|e| e.offset < start + total && start < e.offset + e.bytes.len() as u64)
        {
            return Err(KvError::corrupt(format!(
                "recovery record at {} overlaps the data it restores at {}",
                start, entry.offset
            )));
        }

        let field = RECOVERY_FIELD as u64;
        let keep = self.order.u32_bytes(pointer);
        for entry in &log.entries {
            let end = entry.offset + entry.bytes.len() as u64;
            if entry.offset <= field && field + 4 <= end {
                // The pointer stays set until everything else is back
                let mut bytes = entry.bytes.clone();
                let at = (field - entry.offset) as usize;
                bytes[at..at + 4].copy_from_slice(&keep);
                self.backend.write(entry.offset, &bytes)?;
            } else {
                self.backend.write(entry.offset, &entry.bytes)?;
            }
        }
        self.backend.sync()?;

        let sealed = self.seal_tail(log.old_len)?;
        self.backend.sync()?;

        self.backend.write(RECOVERY_FIELD as u64, &self.order.u32_bytes(0))?;
        self.backend.sync()?;

        if !sealed {
            warn!(len, old_len = log.old_len, "dropping unusable space at end of file");
            self.backend.set_len(log.old_len)?;
            self.backend.sync()?;
        }

        info!(
            entries = log.entries.len(),
            restored_len = log.old_len,
            "recovered interrupted transaction"
        );
        Ok(())
    }
}
