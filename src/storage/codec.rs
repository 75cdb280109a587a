//! On-disk structure codec
//!
//! Every multi-byte field is stored in the file's byte order. These functions
//! are the only place wire bytes are interpreted: callers always work with
//! the decoded `Header` / `RecordHeader` values and never touch raw fields.

use crate::error::{KvError, Result};

// =============================================================================
// Format Constants
// =============================================================================

/// Length of the magic signature field
pub const MAGIC_FOOD_LEN: usize = 32;

/// Magic signature at offset 0, NUL padded
pub const MAGIC_FOOD: [u8; MAGIC_FOOD_LEN] = magic_food();

/// Format version; also reveals the file's byte order on open
pub const FORMAT_VERSION: u32 = 0x4348_4b01;

/// Header size: signature (32) + seven u32 fields (28) + reserved (68)
pub const HEADER_SIZE: u32 = 128;

/// Number of size-bucketed free lists rooted in the slot table
pub const FREE_BUCKETS: u32 = 8;

/// Record header: next, rec_len, key_len, data_len, full_hash, magic
pub const RECORD_HEADER_SIZE: u32 = 24;

/// Trailing copy of the record's total length, used for left-merging
pub const TAILER_SIZE: u32 = 4;

/// Records are sized and placed on this boundary
pub const RECORD_ALIGN: u32 = 8;

/// Smallest possible record (header + tailer, aligned)
pub const MIN_RECORD_SIZE: u32 = 32;

pub const USED_MAGIC: u32 = 0x2601_1999;
pub const FREE_MAGIC: u32 = 0xd9fe_e666;
pub const RECOVERY_MAGIC: u32 = 0xf53b_c0e7;

// Header field offsets (for single-field updates)
pub const VERSION_FIELD: u32 = 32;
pub const HASH_SIZE_FIELD: u32 = 36;
pub const RECOVERY_FIELD: u32 = 40;
pub const ALLOCATED_FIELD: u32 = 44;
pub const MAGIC1_FIELD: u32 = 48;
pub const MAGIC2_FIELD: u32 = 52;
pub const RECOVERY_AREA_FIELD: u32 = 56;

const fn magic_food() -> [u8; MAGIC_FOOD_LEN] {
    let text = b"ChainKV hash database\n";
    let mut out = [0u8; MAGIC_FOOD_LEN];
    let mut i = 0;
    while i < text.len() {
        out[i] = text[i];
        i += 1;
    }
    out
}

// =============================================================================
// Geometry
// =============================================================================

/// Round `len` up to the record alignment
pub fn align_up(len: u64) -> u64 {
    let a = RECORD_ALIGN as u64;
    (len + a - 1) / a * a
}

/// Offset of the head slot for free bucket `bucket`
pub fn bucket_slot(bucket: u32) -> u32 {
    HEADER_SIZE + 4 * bucket
}

/// Offset of the head slot for hash chain `chain`
pub fn chain_slot(chain: u32) -> u32 {
    HEADER_SIZE + 4 * (FREE_BUCKETS + chain)
}

/// First byte of the record space for a table of `hash_size` chains
pub fn data_start(hash_size: u32) -> u64 {
    align_up(HEADER_SIZE as u64 + 4 * (FREE_BUCKETS as u64 + hash_size as u64))
}

// =============================================================================
// Byte Order
// =============================================================================

/// Byte order of the integers in a database file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    /// Byte order of the running process
    pub const fn native() -> Self {
        if cfg!(target_endian = "little") {
            ByteOrder::Little
        } else {
            ByteOrder::Big
        }
    }

    /// Whether values must be converted when moving between disk and memory
    pub fn needs_conversion(self) -> bool {
        self != Self::native()
    }

    pub fn read_u32(self, bytes: &[u8]) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&bytes[..4]);
        match self {
            ByteOrder::Little => u32::from_le_bytes(raw),
            ByteOrder::Big => u32::from_be_bytes(raw),
        }
    }

    pub fn write_u32(self, bytes: &mut [u8], value: u32) {
        bytes[..4].copy_from_slice(&self.u32_bytes(value));
    }

    pub fn u32_bytes(self, value: u32) -> [u8; 4] {
        match self {
            ByteOrder::Little => value.to_le_bytes(),
            ByteOrder::Big => value.to_be_bytes(),
        }
    }
}

impl Default for ByteOrder {
    fn default() -> Self {
        ByteOrder::Little
    }
}

// =============================================================================
// File Header
// =============================================================================

/// Decoded file header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub version: u32,
    /// Number of hash chains
    pub hash_size: u32,
    /// Offset of the pending recovery record, 0 when none
    pub recovery_start: u32,
    /// Records currently handed out by the allocator
    pub allocated: u32,
    pub magic1_hash: u32,
    pub magic2_hash: u32,
    /// Offset of the record reserved for recovery data, 0 when none
    pub recovery_area: u32,
}

impl Header {
    pub fn new(hash_size: u32, magic_hashes: (u32, u32)) -> Self {
        Self {
            version: FORMAT_VERSION,
            hash_size,
            recovery_start: 0,
            allocated: 0,
            magic1_hash: magic_hashes.0,
            magic2_hash: magic_hashes.1,
            recovery_area: 0,
        }
    }

    /// True if `bytes` starts with the magic signature
    pub fn has_magic(bytes: &[u8]) -> bool {
        bytes.len() >= HEADER_SIZE as usize && bytes[..MAGIC_FOOD_LEN] == MAGIC_FOOD
    }

    /// Determine the file's byte order from the version field
    pub fn detect_order(bytes: &[u8]) -> Result<ByteOrder> {
        if !Self::has_magic(bytes) {
            return Err(KvError::corrupt("missing database signature"));
        }
        let field = &bytes[VERSION_FIELD as usize..];
        if ByteOrder::Little.read_u32(field) == FORMAT_VERSION {
            Ok(ByteOrder::Little)
        } else if ByteOrder::Big.read_u32(field) == FORMAT_VERSION {
            Ok(ByteOrder::Big)
        } else {
            Err(KvError::Version {
                found: ByteOrder::native().read_u32(field),
            })
        }
    }

    pub fn decode(bytes: &[u8], order: ByteOrder) -> Result<Self> {
        if !Self::has_magic(bytes) {
            return Err(KvError::corrupt("missing database signature"));
        }
        let field = |offset: u32| order.read_u32(&bytes[offset as usize..]);
        let header = Self {
            version: field(VERSION_FIELD),
            hash_size: field(HASH_SIZE_FIELD),
            recovery_start: field(RECOVERY_FIELD),
            allocated: field(ALLOCATED_FIELD),
            magic1_hash: field(MAGIC1_FIELD),
            magic2_hash: field(MAGIC2_FIELD),
            recovery_area: field(RECOVERY_AREA_FIELD),
        };
        if header.version != FORMAT_VERSION {
            return Err(KvError::Version {
                found: header.version,
            });
        }
        Ok(header)
    }

    pub fn encode(&self, order: ByteOrder) -> [u8; HEADER_SIZE as usize] {
        let mut out = [0u8; HEADER_SIZE as usize];
        out[..MAGIC_FOOD_LEN].copy_from_slice(&MAGIC_FOOD);
        let mut put = |offset: u32, value: u32| order.write_u32(&mut out[offset as usize..], value);
        put(VERSION_FIELD, self.version);
        put(HASH_SIZE_FIELD, self.hash_size);
        put(RECOVERY_FIELD, self.recovery_start);
        put(ALLOCATED_FIELD, self.allocated);
        put(MAGIC1_FIELD, self.magic1_hash);
        put(MAGIC2_FIELD, self.magic2_hash);
        put(RECOVERY_AREA_FIELD, self.recovery_area);
        out
    }
}

// =============================================================================
// Record Header
// =============================================================================

/// Decoded record header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Next record in the hash chain or free list, 0 at the end
    pub next: u32,
    /// Bytes after the header, including padding and tailer
    pub rec_len: u32,
    pub key_len: u32,
    pub data_len: u32,
    /// Full hash of the key (used records only)
    pub full_hash: u32,
    pub magic: u32,
}

impl RecordHeader {
    pub fn used(total: u32, key_len: u32, data_len: u32, full_hash: u32) -> Self {
        Self {
            next: 0,
            rec_len: total - RECORD_HEADER_SIZE,
            key_len,
            data_len,
            full_hash,
            magic: USED_MAGIC,
        }
    }

    pub fn free(total: u32) -> Self {
        Self {
            next: 0,
            rec_len: total - RECORD_HEADER_SIZE,
            key_len: 0,
            data_len: 0,
            full_hash: 0,
            magic: FREE_MAGIC,
        }
    }

    /// Space holding recovery data; neither used nor free
    pub fn recovery(total: u32) -> Self {
        Self {
            magic: RECOVERY_MAGIC,
            ..Self::free(total)
        }
    }

    /// Header plus body, as stored in the tailer
    pub fn total_len(&self) -> u64 {
        RECORD_HEADER_SIZE as u64 + self.rec_len as u64
    }

    pub fn is_used(&self) -> bool {
        self.magic == USED_MAGIC
    }

    pub fn is_free(&self) -> bool {
        self.magic == FREE_MAGIC
    }

    pub fn is_recovery(&self) -> bool {
        self.magic == RECOVERY_MAGIC
    }

    /// Key + data + tailer must fit in the body
    pub fn payload_fits(&self) -> bool {
        self.key_len as u64 + self.data_len as u64 + TAILER_SIZE as u64 <= self.rec_len as u64
    }

    pub fn decode(bytes: &[u8], order: ByteOrder) -> Self {
        let field = |i: usize| order.read_u32(&bytes[i * 4..]);
        Self {
            next: field(0),
            rec_len: field(1),
            key_len: field(2),
            data_len: field(3),
            full_hash: field(4),
            magic: field(5),
        }
    }

    pub fn encode(&self, order: ByteOrder) -> [u8; RECORD_HEADER_SIZE as usize] {
        let mut out = [0u8; RECORD_HEADER_SIZE as usize];
        let fields = [
            self.next,
            self.rec_len,
            self.key_len,
            self.data_len,
            self.full_hash,
            self.magic,
        ];
        for (i, value) in fields.iter().enumerate() {
            order.write_u32(&mut out[i * 4..], *value);
        }
        out
    }
}
