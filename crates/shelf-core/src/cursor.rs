//! Cursors over a connection's ordered key space.
//!
//! A cursor remembers the key it sits on rather than an index, so writes
//! through the connection never invalidate it: `next_entry` from a key that
//! has since been deleted still lands on that key's successor.

use std::ops::Bound::{Excluded, Included, Unbounded};
use std::sync::Weak;

use crate::engine::{copy_out, Inner, State};
use crate::status::{KvResult, Status};

/// Match rule for `KvCursor::seek`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekMode {
    /// The key itself
    Exact,
    /// Greatest key less than or equal to the target
    Le,
    /// Least key greater than or equal to the target
    Ge,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Position {
    Unset,
    At(Vec<u8>),
    Eof,
}

/// Engine cursor. Obtained from `Connection::cursor_init`.
///
/// Every call fails with `ABORT` once the connection has been closed.
pub struct KvCursor {
    conn: Weak<Inner>,
    pos: Position,
}

fn with_state<R>(conn: &Weak<Inner>, f: impl FnOnce(&Inner, &mut State) -> KvResult<R>) -> KvResult<R> {
    let inner = conn.upgrade().ok_or(Status::ABORT)?;
    inner.check_access()?;
    let mut state = inner.state.lock();
    if state.closed {
        return Err(Status::ABORT);
    }
    f(&*inner, &mut *state)
}

fn first_key(state: &State) -> Option<Vec<u8>> {
    state.data.keys().next().cloned()
}

fn last_key(state: &State) -> Option<Vec<u8>> {
    state.data.keys().next_back().cloned()
}

fn key_after(state: &State, key: &[u8]) -> Option<Vec<u8>> {
    state
        .data
        .range::<[u8], _>((Excluded(key), Unbounded))
        .next()
        .map(|(k, _)| k.clone())
}

fn key_before(state: &State, key: &[u8]) -> Option<Vec<u8>> {
    state
        .data
        .range::<[u8], _>((Unbounded, Excluded(key)))
        .next_back()
        .map(|(k, _)| k.clone())
}

impl KvCursor {
    pub(crate) fn new(conn: Weak<Inner>) -> Self {
        Self { conn, pos: Position::Unset }
    }

    /// Move to `key` per `mode`. On no match the cursor is left past the
    /// end and `NOTFOUND` returned.
    pub fn seek(&mut self, key: &[u8], mode: SeekMode) -> KvResult<()> {
        let found = with_state(&self.conn, |_, state| {
            Ok(match mode {
                SeekMode::Exact => state.data.contains_key(key).then(|| key.to_vec()),
                SeekMode::Le => state
                    .data
                    .range::<[u8], _>((Unbounded, Included(key)))
                    .next_back()
                    .map(|(k, _)| k.clone()),
                SeekMode::Ge => state
                    .data
                    .range::<[u8], _>((Included(key), Unbounded))
                    .next()
                    .map(|(k, _)| k.clone()),
            })
        })?;
        self.land(found, Status::NOTFOUND)
    }

    /// Move to the smallest key. `DONE` if the key space is empty.
    pub fn first_entry(&mut self) -> KvResult<()> {
        let found = with_state(&self.conn, |_, state| Ok(first_key(state)))?;
        self.land(found, Status::DONE)
    }

    /// Move to the largest key. `DONE` if the key space is empty.
    pub fn last_entry(&mut self) -> KvResult<()> {
        let found = with_state(&self.conn, |_, state| Ok(last_key(state)))?;
        self.land(found, Status::DONE)
    }

    /// Step forward. `DONE` when there is no next key.
    ///
    /// An unpositioned cursor moves to the first key.
    pub fn next_entry(&mut self) -> KvResult<()> {
        let found = match &self.pos {
            Position::Eof => return Err(Status::DONE),
            Position::Unset => with_state(&self.conn, |_, state| Ok(first_key(state)))?,
            Position::At(key) => with_state(&self.conn, |_, state| Ok(key_after(state, key)))?,
        };
        self.land(found, Status::DONE)
    }

    /// Step backward. `DONE` when there is no previous key.
    ///
    /// An unpositioned cursor moves to the last key.
    pub fn prev_entry(&mut self) -> KvResult<()> {
        let found = match &self.pos {
            Position::Eof => return Err(Status::DONE),
            Position::Unset => with_state(&self.conn, |_, state| Ok(last_key(state)))?,
            Position::At(key) => with_state(&self.conn, |_, state| Ok(key_before(state, key)))?,
        };
        self.land(found, Status::DONE)
    }

    fn land(&mut self, found: Option<Vec<u8>>, miss: Status) -> KvResult<()> {
        match found {
            Some(key) => {
                self.pos = Position::At(key);
                Ok(())
            }
            None => {
                self.pos = Position::Eof;
                Err(miss)
            }
        }
    }

    /// True when the cursor sits on a key that still exists.
    pub fn valid_entry(&self) -> bool {
        match &self.pos {
            Position::At(key) => {
                with_state(&self.conn, |_, state| Ok(state.data.contains_key(key.as_slice())))
                    .unwrap_or(false)
            }
            _ => false,
        }
    }

    /// Key under the cursor, with the same buffer protocol as
    /// `Connection::kv_fetch`. `EOF` when not on an entry.
    pub fn key(&self, buf: Option<&mut [u8]>, len: &mut usize) -> KvResult<()> {
        let key = self.current()?;
        with_state(&self.conn, |_, state| {
            if !state.data.contains_key(key) {
                return Err(Status::EOF);
            }
            *len = copy_out(key, buf);
            Ok(())
        })
    }

    /// Value under the cursor. `EOF` when not on an entry.
    pub fn data(&self, buf: Option<&mut [u8]>, len: &mut u64) -> KvResult<()> {
        let key = self.current()?;
        with_state(&self.conn, |_, state| {
            let value = state.data.get(key).ok_or(Status::EOF)?;
            *len = copy_out(value, buf) as u64;
            Ok(())
        })
    }

    /// Delete the entry under the cursor and move to the key that followed
    /// it, or past the end if there is none.
    pub fn delete_entry(&mut self) -> KvResult<()> {
        let key = self.current()?.to_vec();
        let next = with_state(&self.conn, |inner, state| {
            inner.delete_locked(state, &key)?;
            Ok(key_after(state, &key))
        })?;
        self.pos = match next {
            Some(k) => Position::At(k),
            None => Position::Eof,
        };
        Ok(())
    }

    /// Forget the position.
    pub fn reset(&mut self) {
        self.pos = Position::Unset;
    }

    fn current(&self) -> KvResult<&[u8]> {
        match &self.pos {
            Position::At(key) => Ok(key),
            _ => Err(Status::EOF),
        }
    }
}

impl Drop for KvCursor {
    fn drop(&mut self) {
        if let Some(inner) = self.conn.upgrade() {
            let mut state = inner.state.lock();
            state.open_cursors = state.open_cursors.saturating_sub(1);
        }
    }
}

impl std::fmt::Debug for KvCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvCursor").field("pos", &self.pos).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Config, Connection, OpenFlags, MEMORY_DB};

    fn abc() -> Connection {
        let conn = Connection::open(MEMORY_DB, OpenFlags::CREATE, Config::relaxed()).unwrap();
        for k in [b"a", b"b", b"c"] {
            conn.kv_store(k, &[k[0].to_ascii_uppercase()]).unwrap();
        }
        conn
    }

    fn key_of(cur: &KvCursor) -> Vec<u8> {
        let mut len = 0usize;
        cur.key(None, &mut len).unwrap();
        let mut buf = vec![0u8; len];
        cur.key(Some(&mut buf), &mut len).unwrap();
        buf.truncate(len);
        buf
    }

    fn value_of(cur: &KvCursor) -> Vec<u8> {
        let mut len = 0u64;
        cur.data(None, &mut len).unwrap();
        let mut buf = vec![0u8; len as usize];
        cur.data(Some(&mut buf), &mut len).unwrap();
        buf.truncate(len as usize);
        buf
    }

    #[test]
    fn test_forward_and_backward() {
        let conn = abc();
        let mut cur = conn.cursor_init().unwrap();

        cur.first_entry().unwrap();
        let mut seen = vec![key_of(&cur)];
        while cur.next_entry().is_ok() {
            seen.push(key_of(&cur));
        }
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert!(!cur.valid_entry());

        cur.last_entry().unwrap();
        assert_eq!(value_of(&cur), b"C");
        cur.prev_entry().unwrap();
        assert_eq!(key_of(&cur), b"b");
        cur.prev_entry().unwrap();
        assert_eq!(cur.prev_entry(), Err(Status::DONE));
    }

    #[test]
    fn test_seek_modes() {
        let conn = abc();
        let mut cur = conn.cursor_init().unwrap();

        cur.seek(b"b", SeekMode::Ge).unwrap();
        assert_eq!(key_of(&cur), b"b");
        cur.seek(b"ab", SeekMode::Ge).unwrap();
        assert_eq!(key_of(&cur), b"b");
        cur.seek(b"ab", SeekMode::Le).unwrap();
        assert_eq!(key_of(&cur), b"a");
        cur.seek(b"c", SeekMode::Exact).unwrap();
        assert_eq!(value_of(&cur), b"C");

        assert_eq!(cur.seek(b"ab", SeekMode::Exact), Err(Status::NOTFOUND));
        assert!(!cur.valid_entry());
        assert_eq!(cur.seek(b"d", SeekMode::Ge), Err(Status::NOTFOUND));
        assert_eq!(cur.seek(b"0", SeekMode::Le), Err(Status::NOTFOUND));
    }

    #[test]
    fn test_unset_cursor_steps_to_ends() {
        let conn = abc();
        let mut cur = conn.cursor_init().unwrap();
        cur.next_entry().unwrap();
        assert_eq!(key_of(&cur), b"a");
        cur.reset();
        cur.prev_entry().unwrap();
        assert_eq!(key_of(&cur), b"c");
    }

    #[test]
    fn test_empty_key_space() {
        let conn = Connection::open(MEMORY_DB, OpenFlags::CREATE, Config::relaxed()).unwrap();
        let mut cur = conn.cursor_init().unwrap();
        assert_eq!(cur.first_entry(), Err(Status::DONE));
        assert_eq!(cur.last_entry(), Err(Status::DONE));
        assert_eq!(cur.next_entry(), Err(Status::DONE));
        let mut len = 0usize;
        assert_eq!(cur.key(None, &mut len), Err(Status::EOF));
    }

    #[test]
    fn test_delete_moves_to_successor() {
        let conn = abc();
        let mut cur = conn.cursor_init().unwrap();
        cur.seek(b"b", SeekMode::Exact).unwrap();
        cur.delete_entry().unwrap();
        assert_eq!(key_of(&cur), b"c");
        cur.delete_entry().unwrap();
        assert!(!cur.valid_entry());
        assert_eq!(conn.len(), 1);
        assert_eq!(cur.delete_entry(), Err(Status::EOF));
    }

    #[test]
    fn test_entry_removed_underneath() {
        let conn = abc();
        let mut cur = conn.cursor_init().unwrap();
        cur.seek(b"b", SeekMode::Exact).unwrap();
        conn.kv_delete(b"b").unwrap();
        assert!(!cur.valid_entry());
        let mut len = 0u64;
        assert_eq!(cur.data(None, &mut len), Err(Status::EOF));
        cur.next_entry().unwrap();
        assert_eq!(key_of(&cur), b"c");
    }

    #[test]
    fn test_cursor_after_close_aborts() {
        let conn = abc();
        let mut cur = conn.cursor_init().unwrap();
        cur.first_entry().unwrap();
        conn.close().unwrap();
        assert_eq!(cur.next_entry(), Err(Status::ABORT));
        assert!(!cur.valid_entry());
        cur.reset();
        assert_eq!(cur.first_entry(), Err(Status::ABORT));
    }
}
