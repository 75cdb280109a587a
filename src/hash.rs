//! Key hash functions
//!
//! The hash decides chain placement, so a file can only be read with the
//! function that wrote it. Two hashes over fixed inputs are stored in the
//! header and checked on open.

use std::fmt;
use std::sync::Arc;

use twox_hash::xxh3::hash64;

use crate::storage::codec::{ByteOrder, MAGIC_FOOD, USED_MAGIC};

/// Signature of a caller-supplied hash
pub type CustomHashFn = dyn Fn(&[u8]) -> u32 + Send + Sync;

/// Hash function used to place keys on chains
#[derive(Clone, Default)]
pub enum HashFunction {
    /// Multiplicative string hash, the default
    #[default]
    Classic,
    /// xxh3-64 folded to 32 bits
    Xxh3,
    /// Caller-supplied; never swapped for a built-in on open
    Custom(Arc<CustomHashFn>),
}

impl HashFunction {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&[u8]) -> u32 + Send + Sync + 'static,
    {
        HashFunction::Custom(Arc::new(f))
    }

    pub fn hash(&self, key: &[u8]) -> u32 {
        match self {
            HashFunction::Classic => classic_hash(key),
            HashFunction::Xxh3 => {
                let h = hash64(key);
                (h ^ (h >> 32)) as u32
            }
            HashFunction::Custom(f) => f(key),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HashFunction::Classic => "classic",
            HashFunction::Xxh3 => "xxh3",
            HashFunction::Custom(_) => "custom",
        }
    }

    /// The other built-in, probed when the header hashes do not match
    pub(crate) fn alternate(&self) -> Option<HashFunction> {
        match self {
            HashFunction::Classic => Some(HashFunction::Xxh3),
            HashFunction::Xxh3 => Some(HashFunction::Classic),
            HashFunction::Custom(_) => None,
        }
    }

    /// Self-check values recorded in the header
    pub(crate) fn magic_hashes(&self, order: ByteOrder) -> (u32, u32) {
        let magic1 = self.hash(&MAGIC_FOOD);
        let magic2 = self.hash(&order.u32_bytes(USED_MAGIC));
        // Both zero would be indistinguishable from an unset header
        if magic1 == 0 && magic2 == 0 {
            (1, magic2)
        } else {
            (magic1, magic2)
        }
    }
}

impl fmt::Debug for HashFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashFunction({})", self.name())
    }
}

fn classic_hash(key: &[u8]) -> u32 {
    let mut value = 0x238F_13AFu32.wrapping_mul(key.len() as u32);
    for (i, &byte) in key.iter().enumerate() {
        value = value.wrapping_add((byte as u32) << (i * 5 % 24));
    }
    1_103_515_243u32.wrapping_mul(value).wrapping_add(12345)
}
