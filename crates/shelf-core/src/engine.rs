//! Connections to a database.
//!
//! A `Connection` keeps the whole key space in an ordered map and the
//! database file as a commit log behind it.
//!
//! **Read path**: straight from the map
//! **Write path**: map first, with the prior value kept in the transaction's
//! undo log; nothing touches the file until commit
//! **Commit**: one append holding the final state of every touched key plus
//! a commit marker, synced when `sync_on_commit` is set

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::ThreadId;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::Config;
use crate::cursor::KvCursor;
use crate::error::EngineError;
use crate::format::{encode_record, record_size, Operation, HEADER_SIZE, PAYLOAD_PREFIX};
use crate::status::{KvResult, Status};
use crate::wal::{recover, replay, LogWriter};
use crate::{lib_init, thread_level, ThreadLevel, MEMORY_DB};

/// How to open a database file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags {
    /// Create the file if it does not exist
    pub create: bool,
    /// Refuse every write
    pub read_only: bool,
}

impl OpenFlags {
    pub const CREATE: OpenFlags = OpenFlags { create: true, read_only: false };
    pub const READ_WRITE: OpenFlags = OpenFlags { create: false, read_only: false };
    pub const READ_ONLY: OpenFlags = OpenFlags { create: false, read_only: true };
}

impl Default for OpenFlags {
    fn default() -> Self { OpenFlags::CREATE }
}

pub(crate) struct Txn {
    id: u64,
    /// Value each touched key had before the transaction, `None` if absent
    undo: HashMap<Vec<u8>, Option<Vec<u8>>>,
}

pub(crate) struct State {
    pub(crate) data: BTreeMap<Vec<u8>, Vec<u8>>,
    txn: Option<Txn>,
    next_txn_id: u64,
    pub(crate) open_cursors: usize,
    pub(crate) closed: bool,
}

pub(crate) struct Inner {
    pub(crate) state: Mutex<State>,
    log: Option<Mutex<LogWriter>>,
    path: PathBuf,
    read_only: bool,
    config: Config,
    /// Set in single-thread mode: the only thread allowed to use the connection
    owner: Option<ThreadId>,
}

/// Log an internal error and fold it into a status code.
fn fail(err: EngineError) -> Status {
    warn!(error = %err, "engine error");
    err.status()
}

/// Open-time I/O failures are reported as `CANTOPEN`.
fn open_failure(err: EngineError) -> Status {
    match fail(err) {
        Status::IOERR => Status::CANTOPEN,
        other => other,
    }
}

impl Inner {
    pub(crate) fn check_access(&self) -> KvResult<()> {
        match self.owner {
            Some(owner) if owner != std::thread::current().id() => Err(Status::LOCKED),
            _ => Ok(()),
        }
    }

    fn check_key(&self, key: &[u8]) -> KvResult<()> {
        if key.len() > self.config.max_key_size {
            return Err(fail(EngineError::OversizedEntry {
                entry_size: key.len() as u64,
                max_size: self.config.max_key_size as u64,
                component: "key",
            }));
        }
        Ok(())
    }

    fn check_value(&self, len: usize) -> KvResult<()> {
        if len > self.config.max_value_size {
            return Err(fail(EngineError::OversizedEntry {
                entry_size: len as u64,
                max_size: self.config.max_value_size as u64,
                component: "value",
            }));
        }
        Ok(())
    }

    /// Apply one write inside the current transaction, opening one if needed.
    fn write_locked(&self, state: &mut State, key: &[u8], value: Option<Vec<u8>>) -> KvResult<()> {
        if self.read_only {
            return Err(Status::READ_ONLY);
        }
        if state.txn.is_none() {
            let id = state.next_txn_id;
            state.next_txn_id += 1;
            state.txn = Some(Txn { id, undo: HashMap::new() });
        }

        let old = match value {
            Some(v) => state.data.insert(key.to_vec(), v),
            None => state.data.remove(key),
        };
        if let Some(txn) = state.txn.as_mut() {
            txn.undo.entry(key.to_vec()).or_insert(old);
        }
        Ok(())
    }

    pub(crate) fn delete_locked(&self, state: &mut State, key: &[u8]) -> KvResult<()> {
        if self.read_only {
            return Err(Status::READ_ONLY);
        }
        if !state.data.contains_key(key) {
            return Err(Status::NOTFOUND);
        }
        self.write_locked(state, key, None)
    }

    fn commit_locked(&self, state: &mut State) -> KvResult<()> {
        let txn = match state.txn.take() {
            Some(txn) => txn,
            None => return Ok(()),
        };
        let log = match &self.log {
            Some(log) if !txn.undo.is_empty() => log,
            _ => return Ok(()),
        };

        let mut keys: Vec<&Vec<u8>> = txn.undo.keys().collect();
        keys.sort();

        let estimate: usize = keys
            .iter()
            .map(|k| record_size(k, state.data.get(*k).map_or(&[][..], |v| v.as_slice())))
            .sum::<usize>()
            + HEADER_SIZE
            + PAYLOAD_PREFIX;
        let mut batch = Vec::with_capacity(estimate);
        for key in &keys {
            match state.data.get(*key) {
                Some(value) => encode_record(&mut batch, txn.id, Operation::Put, key, value),
                None => encode_record(&mut batch, txn.id, Operation::Delete, key, &[]),
            }
        }
        encode_record(&mut batch, txn.id, Operation::Commit, &[], &[]);

        let appended = log.lock().append(&batch, self.config.sync_on_commit);
        if let Err(err) = appended {
            state.txn = Some(txn);
            return Err(fail(err));
        }
        debug!(txn = txn.id, keys = keys.len(), bytes = batch.len(), "committed transaction");
        Ok(())
    }

    fn rollback_locked(&self, state: &mut State) {
        if let Some(txn) = state.txn.take() {
            let touched = txn.undo.len();
            for (key, old) in txn.undo {
                match old {
                    Some(value) => {
                        state.data.insert(key, value);
                    }
                    None => {
                        state.data.remove(&key);
                    }
                }
            }
            debug!(txn = txn.id, keys = touched, "rolled back transaction");
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(txn) = state.txn.take() {
            if !txn.undo.is_empty() {
                warn!(
                    path = %self.path.display(),
                    keys = txn.undo.len(),
                    "connection dropped without close; uncommitted changes discarded"
                );
            }
        }
    }
}

/// One open database.
///
/// All methods take `&self`; the key space sits behind a single mutex, so
/// a connection can be shared between threads in multi-thread mode.
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Open or create a database.
    ///
    /// `MEMORY_DB` opens a private in-memory database with no backing file.
    /// Fails with `CANTOPEN` when the path is a directory, when the file is
    /// missing and `flags.create` is unset, or when it cannot be created,
    /// and with `CORRUPT` when the file is not a database.
    pub fn open<P: AsRef<Path>>(path: P, flags: OpenFlags, config: Config) -> KvResult<Self> {
        let path = path.as_ref();
        if let Err(reason) = config.validate() {
            warn!(%reason, "invalid engine configuration");
            return Err(Status::INVALID);
        }
        lib_init()?;

        let owner = match thread_level() {
            ThreadLevel::Single => Some(std::thread::current().id()),
            ThreadLevel::Multi => None,
        };

        let (data, next_txn_id, log) = if path == Path::new(MEMORY_DB) {
            (BTreeMap::new(), 1, None)
        } else {
            Self::open_file(path, flags)?
        };

        debug!(
            path = %path.display(),
            keys = data.len(),
            read_only = flags.read_only,
            "opened database"
        );

        let state = State {
            data,
            txn: None,
            next_txn_id,
            open_cursors: 0,
            closed: false,
        };
        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                log: log.map(Mutex::new),
                path: path.to_path_buf(),
                read_only: flags.read_only,
                config,
                owner,
            }),
        })
    }

    #[allow(clippy::type_complexity)]
    fn open_file(
        path: &Path,
        flags: OpenFlags,
    ) -> KvResult<(BTreeMap<Vec<u8>, Vec<u8>>, u64, Option<LogWriter>)> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.is_dir() => {
                warn!(path = %path.display(), "cannot open a directory as a database");
                Err(Status::CANTOPEN)
            }
            Ok(_) if flags.read_only => {
                let rec = recover(path).map_err(open_failure)?;
                Ok((rec.data, rec.next_txn_id, None))
            }
            Ok(_) => {
                // lock before reading so no other writer appends in between
                let mut log = LogWriter::open(path).map_err(open_failure)?;
                let buffer = log.read_log().map_err(open_failure)?;
                let rec = replay(path, &buffer).map_err(open_failure)?;
                log.cut_tail(rec.valid_len).map_err(open_failure)?;
                Ok((rec.data, rec.next_txn_id, Some(log)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if !flags.create || flags.read_only {
                    debug!(path = %path.display(), "database file missing and create not requested");
                    return Err(Status::CANTOPEN);
                }
                let log = LogWriter::create(path).map_err(open_failure)?;
                Ok((BTreeMap::new(), 1, Some(log)))
            }
            Err(e) => Err(open_failure(EngineError::io(path, &e, "failed to stat database file"))),
        }
    }

    /// Close the connection, committing any pending transaction.
    ///
    /// If that commit fails the transaction is rolled back and the error
    /// returned; the connection is released either way. Cursors still open
    /// on it fail with `ABORT` from now on.
    pub fn close(self) -> KvResult<()> {
        let mut state = self.inner.state.lock();
        let result = self.inner.commit_locked(&mut state);
        if let Err(status) = result {
            warn!(path = %self.inner.path.display(), %status, "commit on close failed, rolling back");
            self.inner.rollback_locked(&mut state);
        }
        state.closed = true;
        if state.open_cursors > 0 {
            debug!(cursors = state.open_cursors, "closing with cursors still open");
        }
        drop(state);
        debug!(path = %self.inner.path.display(), "closed database");
        result
    }

    /// Insert or overwrite a record.
    pub fn kv_store(&self, key: &[u8], value: &[u8]) -> KvResult<()> {
        self.inner.check_access()?;
        self.inner.check_key(key)?;
        self.inner.check_value(value.len())?;
        let mut state = self.inner.state.lock();
        self.inner.write_locked(&mut state, key, Some(value.to_vec()))
    }

    /// Append to a record's value, creating the record if it is missing.
    pub fn kv_append(&self, key: &[u8], value: &[u8]) -> KvResult<()> {
        self.inner.check_access()?;
        self.inner.check_key(key)?;
        let mut state = self.inner.state.lock();
        let combined = match state.data.get(key) {
            Some(existing) => {
                self.inner.check_value(existing.len() + value.len())?;
                let mut joined = Vec::with_capacity(existing.len() + value.len());
                joined.extend_from_slice(existing);
                joined.extend_from_slice(value);
                joined
            }
            None => {
                self.inner.check_value(value.len())?;
                value.to_vec()
            }
        };
        self.inner.write_locked(&mut state, key, Some(combined))
    }

    /// Read a record's value.
    ///
    /// With `buf == None` only the value's length is written to `len`.
    /// Otherwise up to `buf.len()` bytes are copied and `len` is set to the
    /// number copied. Fails with `NOTFOUND` if the key is absent.
    pub fn kv_fetch(&self, key: &[u8], buf: Option<&mut [u8]>, len: &mut u64) -> KvResult<()> {
        self.inner.check_access()?;
        let state = self.inner.state.lock();
        let value = state.data.get(key).ok_or(Status::NOTFOUND)?;
        *len = copy_out(value, buf) as u64;
        Ok(())
    }

    /// Remove a record. Fails with `NOTFOUND` if the key is absent.
    pub fn kv_delete(&self, key: &[u8]) -> KvResult<()> {
        self.inner.check_access()?;
        let mut state = self.inner.state.lock();
        self.inner.delete_locked(&mut state, key)
    }

    /// Start a transaction. A no-op if one is already open.
    pub fn begin(&self) -> KvResult<()> {
        self.inner.check_access()?;
        let mut state = self.inner.state.lock();
        if state.txn.is_none() {
            let id = state.next_txn_id;
            state.next_txn_id += 1;
            state.txn = Some(Txn { id, undo: HashMap::new() });
        }
        Ok(())
    }

    /// Make the open transaction durable. A no-op without one.
    ///
    /// On failure the transaction stays open so the caller can roll back.
    pub fn commit(&self) -> KvResult<()> {
        self.inner.check_access()?;
        let mut state = self.inner.state.lock();
        self.inner.commit_locked(&mut state)
    }

    /// Undo every write of the open transaction. A no-op without one.
    pub fn rollback(&self) -> KvResult<()> {
        self.inner.check_access()?;
        let mut state = self.inner.state.lock();
        self.inner.rollback_locked(&mut state);
        Ok(())
    }

    /// Open a cursor over the key space. It starts unpositioned.
    pub fn cursor_init(&self) -> KvResult<KvCursor> {
        self.inner.check_access()?;
        self.inner.state.lock().open_cursors += 1;
        Ok(KvCursor::new(Arc::downgrade(&self.inner)))
    }

    /// Release a cursor.
    pub fn cursor_release(&self, cursor: KvCursor) {
        drop(cursor);
    }

    /// Make everything written so far durable, including commits made
    /// with `sync_on_commit` off.
    pub fn sync(&self) -> KvResult<()> {
        self.inner.check_access()?;
        match &self.inner.log {
            Some(log) => log.lock().sync().map_err(fail),
            None => Ok(()),
        }
    }

    /// Make every later commit fail with an I/O error, as a failing disk
    /// would. Writes still succeed in memory.
    #[cfg(any(test, feature = "failpoints"))]
    pub fn fail_commits(&self) -> KvResult<()> {
        if let Some(log) = &self.inner.log {
            let mut log = log.lock();
            *log = LogWriter::unwritable(log.path()).map_err(fail)?;
        }
        Ok(())
    }

    /// Path the connection was opened with.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.read_only
    }

    /// True while a transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.inner.state.lock().txn.is_some()
    }

    /// Number of keys touched by the open transaction.
    pub fn pending_changes(&self) -> usize {
        self.inner
            .state
            .lock()
            .txn
            .as_ref()
            .map_or(0, |txn| txn.undo.len())
    }

    /// Cursors opened on this connection and not yet released.
    pub fn open_cursors(&self) -> usize {
        self.inner.state.lock().open_cursors
    }

    /// Number of records, uncommitted writes included.
    pub fn len(&self) -> usize {
        self.inner.state.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("path", &self.inner.path)
            .field("read_only", &self.inner.read_only)
            .finish()
    }
}

/// Copy as much of `src` as fits into `buf`, or just report its length.
pub(crate) fn copy_out(src: &[u8], buf: Option<&mut [u8]>) -> usize {
    match buf {
        None => src.len(),
        Some(buf) => {
            let n = buf.len().min(src.len());
            buf[..n].copy_from_slice(&src[..n]);
            n
        }
    }
}
