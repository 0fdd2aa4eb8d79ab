//! Explicit transaction control on a `Database`.
//!
//! Without `begin`, the first write opens an implicit transaction that stays
//! open until `commit`, `rollback` or `close`. Every path that ends a
//! transaction runs under the batch mutex and resets the object layer's
//! uncommitted-change counter.

use tracing::{debug, warn};

use crate::db::{Batch, Database};
use crate::error::{Error, Result};

impl Database {
    /// Start a transaction. A no-op if one is already open.
    pub fn begin(&self) -> Result<()> {
        let _batch = self.inner.batch.lock();
        self.with_conn(|conn| conn.begin())
    }

    /// Commit the open transaction.
    ///
    /// On failure the transaction stays open; call `rollback` to discard it.
    pub fn commit(&self) -> Result<()> {
        let mut batch = self.inner.batch.lock();
        self.commit_locked(&mut batch)
    }

    /// Discard the open transaction.
    ///
    /// A failed rollback is reported and leaves the handle usable.
    pub fn rollback(&self) -> Result<()> {
        let mut batch = self.inner.batch.lock();
        self.with_conn(|conn| conn.rollback())?;
        batch.uncommitted = 0;
        debug!(name = self.name(), "rolled back");
        Ok(())
    }

    /// Run `f` inside a transaction.
    ///
    /// Commits when `f` succeeds. Rolls back when `f` or the commit fails,
    /// returning the original error.
    pub fn transaction<R>(&self, f: impl FnOnce(&Database) -> Result<R>) -> Result<R> {
        self.begin()?;
        let outcome = f(self).and_then(|value| self.commit().map(|_| value));
        outcome.map_err(|cause| {
            let mut batch = self.inner.batch.lock();
            self.rollback_locked(&mut batch, cause)
        })
    }

    pub(crate) fn commit_locked(&self, batch: &mut Batch) -> Result<()> {
        self.with_conn(|conn| conn.commit())?;
        if batch.uncommitted > 0 {
            debug!(name = self.name(), changes = batch.uncommitted, "committed batch");
        }
        batch.uncommitted = 0;
        Ok(())
    }

    /// Best-effort rollback after `cause`.
    ///
    /// A successful rollback discards the whole batch and resets the
    /// counter. A failed one leaves the counter alone; its error is attached
    /// to `cause` when it differs.
    pub(crate) fn rollback_locked(&self, batch: &mut Batch, cause: Error) -> Error {
        match self.with_conn(|conn| conn.rollback()) {
            Ok(()) => {
                batch.uncommitted = 0;
                cause
            }
            Err(rollback_err) => {
                warn!(
                    name = self.name(),
                    cause = %cause,
                    error = %rollback_err,
                    "rollback failed"
                );
                match rollback_err.kind() {
                    Some(kind) if Some(kind) != cause.kind() => Error::Rollback {
                        source: Box::new(cause),
                        rollback: kind,
                    },
                    _ => cause,
                }
            }
        }
    }
}
