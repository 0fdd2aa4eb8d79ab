//! Per-handle configuration applied on first open.

use shelf_core::OpenFlags;

use crate::error::{Error, Result};

/// Default number of object writes batched per commit
pub const DEFAULT_COMMIT_THRESHOLD: i64 = 1;

/// Handle configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Create the database file if it is missing
    pub create: bool,
    /// Refuse every write
    pub read_only: bool,
    /// Object writes batched per commit; zero or less commits every write
    pub commit_threshold: i64,
    /// Engine limits and durability
    pub engine: shelf_core::Config,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            create: true,
            read_only: false,
            commit_threshold: DEFAULT_COMMIT_THRESHOLD,
            engine: shelf_core::Config::default(),
        }
    }
}

impl Config {
    /// Open an existing database without write access.
    pub fn read_only() -> Self {
        Self {
            create: false,
            read_only: true,
            ..Self::default()
        }
    }

    pub fn with_create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    pub fn with_commit_threshold(mut self, threshold: i64) -> Self {
        self.commit_threshold = threshold;
        self
    }

    pub fn with_engine(mut self, engine: shelf_core::Config) -> Self {
        self.engine = engine;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.read_only && self.create {
            return Err(Error::Config("a read-only open cannot create the file".into()));
        }
        self.engine.validate().map_err(Error::Config)
    }

    pub(crate) fn open_flags(&self) -> OpenFlags {
        OpenFlags {
            create: self.create,
            read_only: self.read_only,
        }
    }
}
