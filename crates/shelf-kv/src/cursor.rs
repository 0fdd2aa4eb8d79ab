//! Cursors over a database's sorted key space.
//!
//! A cursor moves through four states:
//!
//! ```text
//! Unpositioned --seek/first/last/next/prev--> Positioned
//! Positioned   --step past either end / failed seek--> Exhausted
//! any          --release/close/drop--> Released
//! ```
//!
//! It holds only a weak reference to its handle. Once the handle is closed
//! every positioning or data call fails with `Error::InvalidState`.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use shelf_core::{KvCursor, KvResult, SeekMode};

use crate::db::{Database, Shared};
use crate::error::{Error, ErrorKind, Result};

/// Where a cursor stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// Created or reset; not on any entry
    Unpositioned,
    /// On an entry
    Positioned,
    /// Ran off an end or missed a seek
    Exhausted,
    /// Released; unusable
    Released,
}

/// Ordered cursor over a `Database`.
pub struct Cursor {
    parent: Weak<Shared>,
    raw: Option<KvCursor>,
    state: CursorState,
}

impl Database {
    /// Open a cursor. It starts unpositioned.
    pub fn cursor(&self) -> Result<Cursor> {
        let raw = self.with_conn(|conn| conn.cursor_init())?;
        self.inner.cursors.fetch_add(1, Ordering::AcqRel);
        Ok(Cursor {
            parent: Arc::downgrade(&self.inner),
            raw: Some(raw),
            state: CursorState::Unpositioned,
        })
    }
}

impl Cursor {
    pub fn state(&self) -> CursorState {
        self.state
    }

    /// Fail unless the cursor is unreleased and its handle still open.
    fn check_usable(&self) -> Result<Arc<Shared>> {
        if self.state == CursorState::Released {
            return Err(Error::InvalidState("cursor is released"));
        }
        match self.parent.upgrade() {
            Some(parent) if !parent.is_closed() => Ok(parent),
            _ => Err(Error::InvalidState("database handle is closed")),
        }
    }

    /// Run `f` on the engine cursor while the parent connection is held open.
    fn with_raw<R>(&mut self, f: impl FnOnce(&mut KvCursor) -> KvResult<R>) -> Result<R> {
        let parent = self.check_usable()?;
        let conn = parent.conn.read();
        if conn.is_none() {
            return Err(Error::InvalidState("database handle is closed"));
        }
        let raw = self.raw.as_mut().ok_or(Error::InvalidState("cursor is released"))?;
        f(raw).map_err(Error::from)
    }

    /// Apply the outcome of a move. `Done` is success and exhausts the
    /// cursor; `NotFound` exhausts it and is returned.
    fn moved(&mut self, outcome: Result<()>) -> Result<()> {
        match outcome {
            Ok(()) => {
                self.state = CursorState::Positioned;
                Ok(())
            }
            Err(e) if e.kind() == Some(ErrorKind::Done) => {
                self.state = CursorState::Exhausted;
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                self.state = CursorState::Exhausted;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn seek_mode(&mut self, key: &[u8], mode: SeekMode) -> Result<()> {
        let outcome = self.with_raw(|raw| raw.seek(key, mode));
        self.moved(outcome)
    }

    /// Move to `key` exactly.
    pub fn seek(&mut self, key: &[u8]) -> Result<()> {
        self.seek_mode(key, SeekMode::Exact)
    }

    /// Move to the greatest key less than or equal to `key`.
    pub fn seek_le(&mut self, key: &[u8]) -> Result<()> {
        self.seek_mode(key, SeekMode::Le)
    }

    /// Move to the least key greater than or equal to `key`.
    pub fn seek_ge(&mut self, key: &[u8]) -> Result<()> {
        self.seek_mode(key, SeekMode::Ge)
    }

    /// Move to the first entry. On an empty database the cursor is exhausted.
    pub fn first(&mut self) -> Result<()> {
        let outcome = self.with_raw(|raw| raw.first_entry());
        self.moved(outcome)
    }

    /// Move to the last entry. On an empty database the cursor is exhausted.
    pub fn last(&mut self) -> Result<()> {
        let outcome = self.with_raw(|raw| raw.last_entry());
        self.moved(outcome)
    }

    /// Step forward. From `Unpositioned` this is `first`; on `Exhausted`
    /// it does nothing.
    pub fn next(&mut self) -> Result<()> {
        self.check_usable()?;
        if self.state == CursorState::Exhausted {
            return Ok(());
        }
        let outcome = self.with_raw(|raw| raw.next_entry());
        self.moved(outcome)
    }

    /// Step backward. From `Unpositioned` this is `last`; on `Exhausted`
    /// it does nothing.
    pub fn prev(&mut self) -> Result<()> {
        self.check_usable()?;
        if self.state == CursorState::Exhausted {
            return Ok(());
        }
        let outcome = self.with_raw(|raw| raw.prev_entry());
        self.moved(outcome)
    }

    /// True when positioned on an entry that still exists.
    pub fn is_valid(&self) -> bool {
        if self.state != CursorState::Positioned {
            return false;
        }
        let parent = match self.parent.upgrade() {
            Some(parent) => parent,
            None => return false,
        };
        let conn = parent.conn.read();
        conn.is_some() && self.raw.as_ref().map_or(false, KvCursor::valid_entry)
    }

    fn require_positioned(&self) -> Result<()> {
        match self.state {
            CursorState::Positioned => Ok(()),
            CursorState::Released => Err(Error::InvalidState("cursor is released")),
            _ => Err(Error::InvalidState("cursor is not positioned")),
        }
    }

    /// Key of the current entry.
    pub fn key(&mut self) -> Result<Vec<u8>> {
        self.require_positioned()?;
        self.with_raw(|raw| {
            let mut len = 0usize;
            raw.key(None, &mut len)?;
            let mut buf = vec![0u8; len];
            raw.key(Some(&mut buf), &mut len)?;
            buf.truncate(len);
            Ok(buf)
        })
    }

    /// Value of the current entry.
    pub fn value(&mut self) -> Result<Vec<u8>> {
        self.require_positioned()?;
        self.with_raw(|raw| {
            let mut len = 0u64;
            raw.data(None, &mut len)?;
            let mut buf = vec![0u8; len as usize];
            raw.data(Some(&mut buf), &mut len)?;
            buf.truncate(len as usize);
            Ok(buf)
        })
    }

    /// Delete the current entry. The cursor moves to the entry that followed
    /// it, or becomes exhausted if there was none.
    pub fn delete(&mut self) -> Result<()> {
        self.require_positioned()?;
        let still_on_entry = self.with_raw(|raw| {
            raw.delete_entry()?;
            Ok(raw.valid_entry())
        })?;
        self.state = if still_on_entry {
            CursorState::Positioned
        } else {
            CursorState::Exhausted
        };
        Ok(())
    }

    /// Back to `Unpositioned`.
    pub fn reset(&mut self) -> Result<()> {
        self.with_raw(|raw| {
            raw.reset();
            Ok(())
        })?;
        self.state = CursorState::Unpositioned;
        Ok(())
    }

    /// Release the engine cursor. Idempotent.
    pub fn release(&mut self) {
        if let Some(raw) = self.raw.take() {
            if let Some(parent) = self.parent.upgrade() {
                parent.cursors.fetch_sub(1, Ordering::AcqRel);
                let conn = parent.conn.read();
                match conn.as_ref() {
                    Some(conn) => conn.cursor_release(raw),
                    None => drop(raw),
                }
            }
        }
        self.state = CursorState::Released;
    }

    /// Same as `release`.
    pub fn close(&mut self) {
        self.release();
    }

    /// Iterate `(key, value)` pairs forwards from the current entry, or from
    /// the first entry when unpositioned.
    pub fn walk(&mut self) -> Walk<'_> {
        Walk { cursor: self, forward: true, started: false, done: false }
    }

    /// Iterate `(key, value)` pairs backwards from the current entry, or
    /// from the last entry when unpositioned.
    pub fn walk_back(&mut self) -> Walk<'_> {
        Walk { cursor: self, forward: false, started: false, done: false }
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor").field("state", &self.state).finish()
    }
}

/// Iterator returned by [`Cursor::walk`] and [`Cursor::walk_back`]
pub struct Walk<'a> {
    cursor: &'a mut Cursor,
    forward: bool,
    started: bool,
    done: bool,
}

impl Walk<'_> {
    fn step(&mut self) -> Result<()> {
        if !self.started {
            self.started = true;
            return match self.cursor.state {
                CursorState::Unpositioned if self.forward => self.cursor.first(),
                CursorState::Unpositioned => self.cursor.last(),
                _ => Ok(()),
            };
        }
        if self.forward {
            self.cursor.next()
        } else {
            self.cursor.prev()
        }
    }
}

impl Iterator for Walk<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Err(e) = self.step() {
            self.done = true;
            return Some(Err(e));
        }
        match self.cursor.state {
            CursorState::Positioned => {
                let pair = self
                    .cursor
                    .key()
                    .and_then(|key| self.cursor.value().map(|value| (key, value)));
                if pair.is_err() {
                    self.done = true;
                }
                Some(pair)
            }
            CursorState::Released => {
                self.done = true;
                Some(Err(Error::InvalidState("cursor is released")))
            }
            _ => {
                self.done = true;
                None
            }
        }
    }
}
