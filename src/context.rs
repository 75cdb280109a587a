//! Process-scoped context
//!
//! Owns the registry of files opened through it. A file may be open at most
//! once per context: two handles sharing one lock owner would defeat the
//! locking protocol. Registrations are released when the handle is closed
//! or dropped.
//!
//! Separate contexts do not see each other's registrations; code that wants
//! the guard to cover a whole process opens through [`Context::process`].

use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::config::Config;
use crate::database::Database;
use crate::error::{KvError, Result};

/// Identity of an open file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct FileId {
    dev: u64,
    ino: u64,
}

impl FileId {
    pub fn of(metadata: &std::fs::Metadata) -> Self {
        Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Registry {
    open: Mutex<HashMap<FileId, PathBuf>>,
}

impl Registry {
    /// Claim `id`, or report the path it is already open under
    pub fn register(registry: &Arc<Self>, id: FileId, path: &Path) -> Result<Registration> {
        let mut open = registry.open.lock();
        if let Some(existing) = open.get(&id) {
            return Err(KvError::AlreadyOpen(existing.clone()));
        }
        open.insert(id, path.to_path_buf());
        Ok(Registration {
            registry: Arc::clone(registry),
            id,
        })
    }

    fn len(&self) -> usize {
        self.open.lock().len()
    }
}

/// Removes its file from the registry when dropped
#[derive(Debug)]
pub(crate) struct Registration {
    registry: Arc<Registry>,
    id: FileId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.open.lock().remove(&self.id);
    }
}

/// Entry point for opening databases
#[derive(Debug, Clone, Default)]
pub struct Context {
    registry: Arc<Registry>,
}

static PROCESS: OnceLock<Context> = OnceLock::new();

impl Context {
    /// A fresh context with its own registry.
    ///
    /// Handles opened through different contexts lock the file
    /// independently, the same as handles in different processes.
    pub fn new() -> Self {
        Self::default()
    }

    /// The context shared by the whole process
    pub fn process() -> &'static Context {
        PROCESS.get_or_init(Context::new)
    }

    /// Open (or create) the database at `path`.
    ///
    /// With `flags.internal` set the path is only used as a name and the
    /// database lives in memory.
    pub fn open(&self, path: impl AsRef<Path>, config: Config) -> Result<Database> {
        Database::open_file(&self.registry, path.as_ref(), config)
    }

    /// Open a memory-only database
    pub fn open_internal(&self, config: Config) -> Result<Database> {
        Database::open_internal(config)
    }

    /// Number of files currently open through this context
    pub fn open_count(&self) -> usize {
        self.registry.len()
    }
}
