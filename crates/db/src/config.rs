//! Open-time configuration for a database handle.

use crate::registry::HandleRegistry;
use crate::Tdb;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use trivdb_core::{default_hash, Flags, HashFn, LogLevel, Result, DEFAULT_HASH_SIZE};

/// Caller-supplied sink for engine diagnostics
pub type LogFn = Arc<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Everything `open` needs to know about a handle
#[derive(Clone)]
pub struct TdbConfig {
    /// Bucket count used when the database is created; ignored on open
    pub hash_size: u32,
    pub flags: Flags,
    pub read_only: bool,
    /// Create the file if it does not exist
    pub create: bool,
    /// Truncate the file on open, forcing a fresh database
    pub truncate: bool,
    /// Permission bits for a newly created file
    pub mode: u32,
    /// Tombstones a chain may hold before deletes purge it; 0 disables
    pub max_dead_records: u32,
    /// Growth granularity; the system page size when unset
    pub page_size: Option<u32>,
    pub hash_fn: HashFn,
    pub logger: Option<LogFn>,
}

impl Default for TdbConfig {
    fn default() -> Self {
        Self {
            hash_size: DEFAULT_HASH_SIZE,
            flags: Flags::empty(),
            read_only: false,
            create: true,
            truncate: false,
            mode: 0o600,
            max_dead_records: 0,
            page_size: None,
            hash_fn: default_hash,
            logger: None,
        }
    }
}

impl fmt::Debug for TdbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TdbConfig")
            .field("hash_size", &self.hash_size)
            .field("flags", &self.flags)
            .field("read_only", &self.read_only)
            .field("create", &self.create)
            .field("truncate", &self.truncate)
            .field("mode", &format_args!("{:o}", self.mode))
            .field("max_dead_records", &self.max_dead_records)
            .field("page_size", &self.page_size)
            .field("logger", &self.logger.is_some())
            .finish()
    }
}

impl TdbConfig {
    pub fn builder() -> TdbConfigBuilder {
        TdbConfigBuilder::default()
    }

    pub fn open(&self, path: impl AsRef<Path>) -> Result<Tdb> {
        Tdb::open(path, self)
    }

    pub fn open_in(&self, path: impl AsRef<Path>, registry: &HandleRegistry) -> Result<Tdb> {
        Tdb::open_in(path, self, registry)
    }

    pub fn open_memory(&self) -> Result<Tdb> {
        Tdb::open_memory(self)
    }
}

/// Builder for [`TdbConfig`]
#[derive(Debug, Default)]
pub struct TdbConfigBuilder {
    config: TdbConfig,
}

impl TdbConfigBuilder {
    pub fn with_hash_size(mut self, hash_size: u32) -> Self {
        self.config.hash_size = hash_size;
        self
    }

    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.config.flags = flags;
        self
    }

    pub fn add_flags(mut self, flags: Flags) -> Self {
        self.config.flags |= flags;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.config.read_only = read_only;
        self
    }

    pub fn create(mut self, create: bool) -> Self {
        self.config.create = create;
        self
    }

    pub fn truncate(mut self, truncate: bool) -> Self {
        self.config.truncate = truncate;
        self
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn with_max_dead_records(mut self, max_dead: u32) -> Self {
        self.config.max_dead_records = max_dead;
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.config.page_size = Some(page_size);
        self
    }

    pub fn with_hash_fn(mut self, hash_fn: HashFn) -> Self {
        self.config.hash_fn = hash_fn;
        self
    }

    pub fn with_logger(mut self, logger: impl Fn(LogLevel, &str) + Send + Sync + 'static) -> Self {
        self.config.logger = Some(Arc::new(logger));
        self
    }

    pub fn build(self) -> TdbConfig {
        self.config
    }
}
