//! Storage backends
//!
//! A database lives either in a heap buffer (internal databases) or in a file
//! that is accessed through a shared memory map, or through positional
//! reads and writes when mapping is disabled.

use std::fs::File;
use std::os::unix::fs::FileExt;

use memmap2::{Mmap, MmapMut};
use tracing::debug;

use crate::error::{KvError, Result};

/// Current view of a mapped file
enum Mapping {
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

impl Mapping {
    fn as_slice(&self) -> &[u8] {
        match self {
            Mapping::ReadOnly(m) => &m[..],
            Mapping::ReadWrite(m) => &m[..],
        }
    }
}

/// File-backed storage
pub(crate) struct FileBackend {
    file: File,
    map: Option<Mapping>,
    len: u64,
    use_mmap: bool,
    writable: bool,
}

/// Where the database bytes live
pub(crate) enum Backend {
    Memory(Vec<u8>),
    File(FileBackend),
}

impl Backend {
    pub fn memory() -> Self {
        Backend::Memory(Vec::new())
    }

    pub fn open_file(file: File, use_mmap: bool, writable: bool) -> Result<Self> {
        let len = file.metadata()?.len();
        let mut backend = FileBackend {
            file,
            map: None,
            len,
            use_mmap,
            writable,
        };
        backend.remap()?;
        Ok(Backend::File(backend))
    }

    /// Cached length (may lag behind growth by another process)
    pub fn len(&self) -> u64 {
        match self {
            Backend::Memory(buf) => buf.len() as u64,
            Backend::File(f) => f.len,
        }
    }

    pub fn is_memory(&self) -> bool {
        matches!(self, Backend::Memory(_))
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self, Backend::File(f) if f.map.is_some())
    }

    /// The file that carries the byte-range locks
    pub fn file(&self) -> Option<&File> {
        match self {
            Backend::Memory(_) => None,
            Backend::File(f) => Some(&f.file),
        }
    }

    /// Re-read the real length, remapping if another process changed it
    pub fn refresh(&mut self) -> Result<u64> {
        match self {
            Backend::Memory(buf) => Ok(buf.len() as u64),
            Backend::File(f) => {
                let real = f.file.metadata()?.len();
                if real != f.len {
                    debug!(old = f.len, new = real, "file length changed, remapping");
                    f.len = real;
                    f.remap()?;
                }
                Ok(real)
            }
        }
    }

    fn ensure_bounds(&mut self, offset: u64, len: usize) -> Result<()> {
        let end = offset
            .checked_add(len as u64)
            .ok_or_else(|| KvError::corrupt(format!("offset {} overflows", offset)))?;
        if end <= self.len() {
            return Ok(());
        }
        let real = self.refresh()?;
        if end <= real {
            Ok(())
        } else {
            Err(KvError::corrupt(format!(
                "access {}+{} beyond end of data ({})",
                offset, len, real
            )))
        }
    }

    pub fn read_into(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.ensure_bounds(offset, buf.len())?;
        let start = offset as usize;
        match self {
            Backend::Memory(data) => buf.copy_from_slice(&data[start..start + buf.len()]),
            Backend::File(f) => match &f.map {
                Some(map) => buf.copy_from_slice(&map.as_slice()[start..start + buf.len()]),
                None => f.file.read_exact_at(buf, offset)?,
            },
        }
        Ok(())
    }

    pub fn read(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(len)
            .map_err(|e| KvError::OutOfMemory(format!("reading {} bytes: {}", len, e)))?;
        buf.resize(len, 0);
        self.read_into(offset, &mut buf)?;
        Ok(buf)
    }

    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if let Backend::File(f) = self {
            if !f.writable {
                return Err(KvError::ReadOnly);
            }
        }
        self.ensure_bounds(offset, data.len())?;
        let start = offset as usize;
        match self {
            Backend::Memory(buf) => buf[start..start + data.len()].copy_from_slice(data),
            Backend::File(f) => match &mut f.map {
                Some(Mapping::ReadWrite(map)) => {
                    map[start..start + data.len()].copy_from_slice(data)
                }
                Some(Mapping::ReadOnly(_)) => return Err(KvError::ReadOnly),
                None => f.file.write_all_at(data, offset)?,
            },
        }
        Ok(())
    }

    /// Grow (zero-filling) or shrink the backing store
    pub fn set_len(&mut self, new_len: u64) -> Result<()> {
        match self {
            Backend::Memory(buf) => {
                let new_len = usize::try_from(new_len)
                    .map_err(|_| KvError::TooLarge { requested: new_len })?;
                if new_len > buf.len() {
                    buf.try_reserve_exact(new_len - buf.len()).map_err(|e| {
                        KvError::OutOfMemory(format!("growing to {} bytes: {}", new_len, e))
                    })?;
                }
                buf.resize(new_len, 0);
            }
            Backend::File(f) => {
                if !f.writable {
                    return Err(KvError::ReadOnly);
                }
                // The map must not outlive the bytes it covers
                f.map = None;
                f.file.set_len(new_len)?;
                f.len = new_len;
                f.remap()?;
            }
        }
        Ok(())
    }

    /// Flush mapped pages and file data to stable storage
    pub fn sync(&mut self) -> Result<()> {
        if let Backend::File(f) = self {
            if let Some(Mapping::ReadWrite(map)) = &f.map {
                map.flush()?;
            }
            if f.writable {
                f.file.sync_data()?;
            }
        }
        Ok(())
    }
}

impl FileBackend {
    fn remap(&mut self) -> Result<()> {
        self.map = None;
        if !self.use_mmap || self.len == 0 {
            return Ok(());
        }
        // SAFETY: the mapping is shared with other processes that follow the
        // same locking protocol; every access is bounds-checked against
        // `len`, and the map is dropped before the file is resized.
        let map = unsafe {
            if self.writable {
                Mapping::ReadWrite(MmapMut::map_mut(&self.file)?)
            } else {
                Mapping::ReadOnly(Mmap::map(&self.file)?)
            }
        };
        self.map = Some(map);
        Ok(())
    }
}
