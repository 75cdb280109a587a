//! Copy-on-write block overlay
//!
//! Writes made inside a transaction land in private 4 KiB blocks; reads see
//! those blocks and fall through to the backend elsewhere. Bytes past the
//! length at transaction start read as zero until written.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::ops::Range;

use crate::error::{KvError, Result};
use crate::storage::Backend;

use super::recovery::{UndoEntry, UndoLog};

pub(crate) const BLOCK_SIZE: u64 = 4096;

pub(crate) struct Overlay {
    blocks: BTreeMap<u64, Vec<u8>>,
    /// Backend length when the transaction started
    base_len: u64,
    /// Length as seen inside the transaction
    len: u64,
}

impl Overlay {
    pub fn new(base_len: u64) -> Self {
        Self {
            blocks: BTreeMap::new(),
            base_len,
            len: base_len,
        }
    }

    pub fn base_len(&self) -> u64 {
        self.base_len
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    /// True when nothing has been written
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn dirty_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Extend the visible length; the data region never shrinks in a transaction
    pub fn grow(&mut self, len: u64) {
        self.len = self.len.max(len);
    }

    fn check_bounds(&self, offset: u64, len: usize) -> Result<()> {
        if offset + len as u64 > self.len {
            return Err(KvError::corrupt(format!(
                "access of {} bytes at {} beyond transaction length {}",
                len, offset, self.len
            )));
        }
        Ok(())
    }

    pub fn read(&self, backend: &mut Backend, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.check_bounds(offset, len)?;
        let mut out = vec![0u8; len];
        let mut pos = 0;
        while pos < len {
            let at = offset + pos as u64;
            let within = (at % BLOCK_SIZE) as usize;
            let n = (len - pos).min(BLOCK_SIZE as usize - within);
            match self.blocks.get(&(at / BLOCK_SIZE)) {
                Some(block) => out[pos..pos + n].copy_from_slice(&block[within..within + n]),
                None if at < self.base_len => {
                    let m = (n as u64).min(self.base_len - at) as usize;
                    backend.read_into(at, &mut out[pos..pos + m])?;
                }
                None => {}
            }
            pos += n;
        }
        Ok(out)
    }

    pub fn write(&mut self, backend: &mut Backend, offset: u64, data: &[u8]) -> Result<()> {
        self.check_bounds(offset, data.len())?;
        let mut pos = 0;
        while pos < data.len() {
            let at = offset + pos as u64;
            let within = (at % BLOCK_SIZE) as usize;
            let n = (data.len() - pos).min(BLOCK_SIZE as usize - within);
            let block = self.block_mut(backend, at / BLOCK_SIZE)?;
            block[within..within + n].copy_from_slice(&data[pos..pos + n]);
            pos += n;
        }
        Ok(())
    }

    fn block_mut(&mut self, backend: &mut Backend, index: u64) -> Result<&mut Vec<u8>> {
        let base_len = self.base_len;
        match self.blocks.entry(index) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let mut block = vec![0u8; BLOCK_SIZE as usize];
                let start = index * BLOCK_SIZE;
                if start < base_len {
                    let m = BLOCK_SIZE.min(base_len - start) as usize;
                    backend.read_into(start, &mut block[..m])?;
                }
                Ok(entry.insert(block))
            }
        }
    }

    /// Overwrite bytes only within blocks that are already dirty
    pub fn patch_if_dirty(&mut self, offset: u64, data: &[u8]) {
        let mut pos = 0;
        while pos < data.len() {
            let at = offset + pos as u64;
            let within = (at % BLOCK_SIZE) as usize;
            let n = (data.len() - pos).min(BLOCK_SIZE as usize - within);
            if let Some(block) = self.blocks.get_mut(&(at / BLOCK_SIZE)) {
                block[within..within + n].copy_from_slice(&data[pos..pos + n]);
            }
            pos += n;
        }
    }

    /// Dirty bytes in offset order, clipped to the transaction length
    pub fn dirty_ranges(&self) -> impl Iterator<Item = (u64, &[u8])> + '_ {
        self.blocks.iter().filter_map(move |(&index, block)| {
            let start = index * BLOCK_SIZE;
            if start >= self.len {
                return None;
            }
            let end = (start + BLOCK_SIZE).min(self.len);
            Some((start, &block[..(end - start) as usize]))
        })
    }

    /// Pre-images of every dirty block that existed before the transaction,
    /// leaving out `skip` (scratch space whose old contents do not matter)
    pub fn undo_log(&self, backend: &mut Backend, skip: Option<Range<u64>>) -> Result<UndoLog> {
        let mut entries = Vec::new();
        let mut push = |backend: &mut Backend, start: u64, end: u64| -> Result<()> {
            if start < end {
                entries.push(UndoEntry {
                    offset: start,
                    bytes: backend.read(start, (end - start) as usize)?,
                });
            }
            Ok(())
        };
        for &index in self.blocks.keys() {
            let start = index * BLOCK_SIZE;
            if start >= self.base_len {
                break;
            }
            let end = (start + BLOCK_SIZE).min(self.base_len);
            match &skip {
                Some(skip) if skip.start < end && start < skip.end => {
                    push(backend, start, skip.start.max(start))?;
                    push(backend, skip.end.min(end), end)?;
                }
                _ => push(backend, start, end)?,
            }
        }
        Ok(UndoLog {
            old_len: self.base_len,
            entries,
        })
    }
}
