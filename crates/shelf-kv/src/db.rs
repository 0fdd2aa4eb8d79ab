//! Database handles.
//!
//! A `Database` owns one engine connection. Clones share it; the registry
//! hands out clones of the same handle for the same file.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use shelf_core::{Connection, KvResult};

use crate::codec::Codec;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::registry::RegistryInner;

/// Object-layer batching state, guarded by the batch mutex.
pub(crate) struct Batch {
    pub(crate) uncommitted: usize,
    pub(crate) threshold: i64,
}

impl Batch {
    /// Threshold actually applied: anything below one means one.
    pub(crate) fn effective_threshold(&self) -> usize {
        self.threshold.max(1) as usize
    }
}

pub(crate) struct Shared {
    name: String,
    /// `None` once closed
    pub(crate) conn: RwLock<Option<Connection>>,
    closed: AtomicBool,
    registry: Weak<RegistryInner>,
    pub(crate) codec: RwLock<Codec>,
    /// Held across store-or-delete, counter update and conditional commit
    pub(crate) batch: Mutex<Batch>,
    pub(crate) cursors: AtomicUsize,
    read_only: bool,
}

impl Shared {
    pub(crate) fn new(name: String, conn: Connection, registry: Weak<RegistryInner>, config: &Config) -> Self {
        Self {
            name,
            conn: RwLock::new(Some(conn)),
            closed: AtomicBool::new(false),
            registry,
            codec: RwLock::new(Codec::default()),
            batch: Mutex::new(Batch {
                uncommitted: 0,
                threshold: config.commit_threshold,
            }),
            cursors: AtomicUsize::new(0),
            read_only: config.read_only,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Release the connection. Idempotent.
    pub(crate) fn close(&self) -> Result<()> {
        let mut batch = self.batch.lock();
        let conn = match self.conn.write().take() {
            Some(conn) => conn,
            None => return Ok(()),
        };
        self.closed.store(true, Ordering::Release);
        batch.uncommitted = 0;

        let outstanding = self.cursors.load(Ordering::Acquire);
        if outstanding > 0 {
            warn!(name = %self.name, cursors = outstanding, "closing database with cursors still open");
        }

        let result = conn.close().map_err(Error::from);
        drop(batch);

        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.name, self as *const Shared);
        }
        debug!(name = %self.name, "closed database handle");
        result
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if self.conn.get_mut().is_some() {
            warn!(name = %self.name, "database handle dropped without close");
            if let Err(e) = self.close() {
                warn!(name = %self.name, error = %e, "close on drop failed");
            }
        }
    }
}

/// Handle to an open database.
///
/// Cheap to clone; all clones refer to the same connection. Every operation
/// on a closed handle fails with `Error::InvalidState`.
#[derive(Clone)]
pub struct Database {
    pub(crate) inner: Arc<Shared>,
}

impl Database {
    /// Run `f` against the open connection.
    pub(crate) fn with_conn<R>(&self, f: impl FnOnce(&Connection) -> KvResult<R>) -> Result<R> {
        let guard = self.inner.conn.read();
        let conn = guard.as_ref().ok_or(Error::InvalidState("database handle is closed"))?;
        f(conn).map_err(Error::from)
    }

    /// Insert or overwrite a record.
    pub fn store(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.with_conn(|conn| conn.kv_store(key, value))
    }

    /// Append to a record's value; creates the record if it is missing.
    pub fn append(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.with_conn(|conn| conn.kv_append(key, value))
    }

    /// Read a record's value. Missing keys fail with `NotFound`.
    pub fn fetch(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.with_conn(|conn| {
            let mut len = 0u64;
            conn.kv_fetch(key, None, &mut len)?;
            let mut buf = vec![0u8; len as usize];
            conn.kv_fetch(key, Some(&mut buf), &mut len)?;
            buf.truncate(len as usize);
            Ok(buf)
        })
    }

    /// Remove a record. Missing keys fail with `NotFound`.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.with_conn(|conn| conn.kv_delete(key))
    }

    /// Close the handle, committing pending changes.
    ///
    /// Closing twice is a no-op. The connection is released even when the
    /// final commit fails; the error is still returned.
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }

    /// Normalised filename this handle is registered under.
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.read_only
    }

    /// True if both refer to the same underlying handle.
    pub fn same_handle(&self, other: &Database) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Cursors created on this handle and not yet released.
    pub fn outstanding_cursors(&self) -> usize {
        self.inner.cursors.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.inner.name)
            .field("closed", &self.is_closed())
            .field("read_only", &self.inner.read_only)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ErrorKind, Registry};
    use shelf_core::MEMORY_DB;
    use tempfile::TempDir;

    #[test]
    fn test_open_and_debug() {
        let registry = Registry::new();
        let db = registry.open(MEMORY_DB).unwrap();
        let debug_str = format!("{:?}", db);
        assert!(debug_str.contains("Database"));
        assert!(debug_str.contains(":mem:"));
    }

    #[test]
    fn test_store_fetch_delete() {
        let registry = Registry::new();
        let db = registry.open(MEMORY_DB).unwrap();
        db.store(b"k", b"v").unwrap();
        assert_eq!(db.fetch(b"k").unwrap(), b"v");
        db.delete(b"k").unwrap();
        assert!(db.fetch(b"k").unwrap_err().is_not_found());
        assert!(db.delete(b"k").unwrap_err().is_not_found());
    }

    #[test]
    fn test_closed_handle_is_invalid() {
        let registry = Registry::new();
        let db = registry.open(MEMORY_DB).unwrap();
        let other = db.clone();
        db.close().unwrap();
        db.close().unwrap();
        assert!(other.is_closed());
        assert!(matches!(other.store(b"k", b"v"), Err(Error::InvalidState(_))));
        assert!(matches!(other.fetch(b"k"), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_read_only_handle() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ro.db");
        let name = path.to_str().unwrap();

        let registry = Registry::new();
        let db = registry.open(name).unwrap();
        db.store(b"k", b"v").unwrap();
        db.close().unwrap();

        let db = registry.open_with(name, Config::read_only()).unwrap();
        assert!(db.is_read_only());
        assert_eq!(db.fetch(b"k").unwrap(), b"v");
        assert_eq!(db.store(b"k", b"w").unwrap_err().kind(), Some(ErrorKind::ReadOnly));
    }

    #[test]
    fn test_effective_threshold() {
        let mut batch = Batch { uncommitted: 0, threshold: 0 };
        assert_eq!(batch.effective_threshold(), 1);
        batch.threshold = -5;
        assert_eq!(batch.effective_threshold(), 1);
        batch.threshold = 7;
        assert_eq!(batch.effective_threshold(), 7);
    }
}
