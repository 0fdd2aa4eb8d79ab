//! Commit log for a database file.
//!
//! Writes are transactional: nothing reaches the file until commit, and a
//! commit is appended as one buffer holding the final state of every touched
//! key followed by a `Commit` marker. Recovery therefore only has to replay
//! transactions whose marker made it to disk.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use hashbrown::HashMap;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::format::{
    check_file_header, decode_record, file_header, find_next_magic, Operation, Record,
    FILE_HEADER_SIZE,
};
use crate::platform_durability::{durable_sync, sync_parent_dir};

/// Appends committed transactions to a database file.
///
/// Holds an exclusive lock on the file, so a second writer on the same
/// file fails to open instead of interleaving its commits.
pub struct LogWriter {
    file: File,
    path: PathBuf,
    /// Length of the file's valid prefix; every append starts here
    size: u64,
}

impl LogWriter {
    /// Create a new database file holding only the file header.
    pub fn create(path: &Path) -> EngineResult<Self> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| EngineError::io(path, &e, "failed to create database file"))?;
        lock_exclusive(&file, path)?;
        file.write_all(&file_header())
            .map_err(|e| EngineError::io(path, &e, "failed to write file header"))?;
        durable_sync(&file).map_err(|e| EngineError::io(path, &e, "failed to sync new file"))?;
        sync_parent_dir(path).map_err(|e| EngineError::io(path, &e, "failed to sync directory"))?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            size: FILE_HEADER_SIZE as u64,
        })
    }

    /// Open an existing database file and lock it. The writer starts at the
    /// end of the file; call `cut_tail` once recovery knows where the valid
    /// log ends. A zero-length file gets a fresh header.
    pub fn open(path: &Path) -> EngineResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| EngineError::io(path, &e, "failed to open database file"))?;
        lock_exclusive(&file, path)?;
        let mut size = file
            .metadata()
            .map_err(|e| EngineError::io(path, &e, "failed to stat database file"))?
            .len();

        if size == 0 {
            file.write_all(&file_header())
                .map_err(|e| EngineError::io(path, &e, "failed to write file header"))?;
            size = FILE_HEADER_SIZE as u64;
        }
        file.seek(SeekFrom::Start(size))
            .map_err(|e| EngineError::io(path, &e, "failed to seek to end of log"))?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            size,
        })
    }

    /// Read the whole file through the locked handle.
    pub fn read_log(&mut self) -> EngineResult<Vec<u8>> {
        let mut buffer = Vec::with_capacity(self.size as usize);
        self.file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.file.read_to_end(&mut buffer))
            .and_then(|_| self.file.seek(SeekFrom::Start(self.size)))
            .map_err(|e| EngineError::io(&self.path, &e, "failed to read database file"))?;
        Ok(buffer)
    }

    /// Cut off everything past `valid_len` (a torn tail left by a crash).
    pub fn cut_tail(&mut self, valid_len: u64) -> EngineResult<()> {
        if valid_len >= self.size {
            return Ok(());
        }
        warn!(
            path = %self.path.display(),
            dropped = self.size - valid_len,
            "truncating incomplete tail of database file"
        );
        self.file
            .set_len(valid_len)
            .map_err(|e| EngineError::io(&self.path, &e, "failed to truncate torn tail"))?;
        self.file
            .seek(SeekFrom::Start(valid_len))
            .map_err(|e| EngineError::io(&self.path, &e, "failed to seek to end of log"))?;
        self.size = valid_len;
        Ok(())
    }

    /// Append one encoded transaction. Optionally make it durable.
    ///
    /// If the write fails part-way the file is cut back to its previous
    /// length, so the half-written transaction never precedes a later one.
    pub fn append(&mut self, batch: &[u8], sync: bool) -> EngineResult<()> {
        if let Err(e) = self.file.write_all(batch) {
            let err = EngineError::io(&self.path, &e, "commit write failed");
            self.rewind();
            return Err(err);
        }
        if sync {
            if let Err(e) = durable_sync(&self.file) {
                let err = EngineError::io(&self.path, &e, "commit sync failed");
                self.rewind();
                return Err(err);
            }
        }
        self.size += batch.len() as u64;
        Ok(())
    }

    fn rewind(&mut self) {
        let restored = self
            .file
            .set_len(self.size)
            .and_then(|_| self.file.seek(SeekFrom::Start(self.size)).map(|_| ()));
        if let Err(e) = restored {
            warn!(path = %self.path.display(), error = %e, "could not cut back failed commit");
        }
    }

    /// Flush everything written so far to persistent storage.
    pub fn sync(&self) -> EngineResult<()> {
        durable_sync(&self.file).map_err(|e| EngineError::io(&self.path, &e, "log sync failed"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes of valid log, file header included.
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Claim the file for this writer. The lock lives as long as the handle.
fn lock_exclusive(file: &File, path: &Path) -> EngineResult<()> {
    file.try_lock_exclusive().map_err(|e| {
        if e.kind() == fs2::lock_contended_error().kind() {
            EngineError::Locked {
                path: path.to_path_buf(),
            }
        } else {
            EngineError::io(path, &e, "failed to lock database file")
        }
    })
}

/// Result of replaying a database file
#[derive(Debug, Default)]
pub struct Recovery {
    /// Key space after every committed transaction was applied
    pub data: BTreeMap<Vec<u8>, Vec<u8>>,
    /// First transaction id free for use
    pub next_txn_id: u64,
    /// Offset just past the last commit marker; later bytes belong to a
    /// commit that never finished
    pub valid_len: u64,
    /// Transactions applied
    pub committed: usize,
    /// Transactions that never reached their commit marker
    pub discarded: usize,
    /// Corrupt stretches skipped by resynchronisation
    pub skipped: usize,
}

/// Replay a database file.
///
/// Per record:
/// 1. bad magic or checksum: warn, scan forward to the next magic
/// 2. record cut off by end of file: stop, this is where the crash happened,
///    unless an intact record follows it, in which case it is skipped as in 1
/// 3. `Put`/`Delete`: held back under its transaction id
/// 4. `Commit`: apply the held-back records of that transaction
///
/// Everything after the last commit marker is reported as invalid so the
/// writer can cut it off.
///
/// A zero-length file is treated as empty. A file whose header is wrong is
/// rejected with `BadFileHeader`.
pub fn recover(path: &Path) -> EngineResult<Recovery> {
    let buffer = std::fs::read(path)
        .map_err(|e| EngineError::io(path, &e, "failed to read database file"))?;
    replay(path, &buffer)
}

/// Replay the contents of a database file; `path` is used for reporting.
pub fn replay(path: &Path, buffer: &[u8]) -> EngineResult<Recovery> {
    let mut out = Recovery {
        next_txn_id: 1,
        ..Recovery::default()
    };
    if buffer.is_empty() {
        return Ok(out);
    }

    check_file_header(buffer).map_err(|reason| EngineError::BadFileHeader {
        path: path.to_path_buf(),
        reason,
    })?;

    let mut pending: HashMap<u64, Vec<Record>> = HashMap::new();
    let mut offset = FILE_HEADER_SIZE;
    out.valid_len = offset as u64;

    while offset < buffer.len() {
        match decode_record(&buffer[offset..], offset as u64) {
            Ok((record, used)) => {
                offset += used;
                out.next_txn_id = out.next_txn_id.max(record.txn_id.saturating_add(1));
                match record.op {
                    Operation::Put | Operation::Delete => {
                        pending.entry(record.txn_id).or_default().push(record);
                    }
                    Operation::Commit => {
                        for r in pending.remove(&record.txn_id).unwrap_or_default() {
                            if r.op == Operation::Put {
                                out.data.insert(r.key, r.value);
                            } else {
                                out.data.remove(&r.key);
                            }
                        }
                        out.committed += 1;
                        out.valid_len = offset as u64;
                    }
                }
            }
            Err(EngineError::TornWrite { expected_size, available_bytes, .. }) => {
                if let Some(next) = next_intact_record(buffer, offset + 1) {
                    warn!(
                        path = %path.display(),
                        offset,
                        resume_at = next,
                        "record runs past a later intact record, skipping it"
                    );
                    out.skipped += 1;
                    offset = next;
                    continue;
                }
                warn!(
                    path = %path.display(),
                    offset,
                    expected_size,
                    available_bytes,
                    "torn write at end of log"
                );
                break;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping corrupt log record");
                out.skipped += 1;
                match find_next_magic(buffer, offset + 1) {
                    Some(next) => offset = next,
                    None => break,
                }
            }
        }
    }

    out.discarded = pending.len();
    debug!(
        path = %path.display(),
        keys = out.data.len(),
        committed = out.committed,
        discarded = out.discarded,
        skipped = out.skipped,
        "recovered database file"
    );
    Ok(out)
}

/// Offset of the first record at or after `from` that decodes cleanly.
fn next_intact_record(buffer: &[u8], from: usize) -> Option<usize> {
    let mut at = from;
    while let Some(pos) = find_next_magic(buffer, at) {
        if decode_record(&buffer[pos..], pos as u64).is_ok() {
            return Some(pos);
        }
        at = pos + 1;
    }
    None
}

#[cfg(any(test, feature = "failpoints"))]
impl LogWriter {
    /// Writer over a read-only handle; every append fails.
    pub(crate) fn unwritable(path: &Path) -> EngineResult<Self> {
        let file = File::open(path).map_err(|e| EngineError::io(path, &e, "failed to open database file"))?;
        let size = file
            .metadata()
            .map_err(|e| EngineError::io(path, &e, "failed to stat database file"))?
            .len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{encode_record, ChunkHeader, HEADER_SIZE, MAGIC_ARRAY};
    use tempfile::TempDir;

    fn txn(id: u64, puts: &[(&[u8], &[u8])], deletes: &[&[u8]]) -> Vec<u8> {
        let mut buf = Vec::new();
        for (k, v) in puts {
            encode_record(&mut buf, id, Operation::Put, k, v);
        }
        for k in deletes {
            encode_record(&mut buf, id, Operation::Delete, k, b"");
        }
        encode_record(&mut buf, id, Operation::Commit, b"", b"");
        buf
    }

    #[test]
    fn test_write_recover_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("t.db");

        let mut log = LogWriter::create(&path).unwrap();
        log.append(&txn(1, &[(b"key1", b"value1"), (b"key2", b"value2")], &[]), true).unwrap();
        log.append(&txn(2, &[], &[b"key1"]), false).unwrap();
        let size = log.size();
        drop(log);

        let rec = recover(&path).unwrap();
        assert_eq!(rec.data.len(), 1);
        assert_eq!(rec.data.get(&b"key2"[..]).unwrap(), b"value2");
        assert_eq!(rec.committed, 2);
        assert_eq!(rec.next_txn_id, 3);
        assert_eq!(rec.valid_len, size);
    }

    #[test]
    fn test_uncommitted_transaction_ignored() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("t.db");

        let mut log = LogWriter::create(&path).unwrap();
        log.append(&txn(1, &[(b"a", b"1")], &[]), true).unwrap();
        let mut partial = Vec::new();
        encode_record(&mut partial, 2, Operation::Put, b"b", b"2");
        log.append(&partial, true).unwrap();
        drop(log);

        let rec = recover(&path).unwrap();
        assert_eq!(rec.data.len(), 1);
        assert!(rec.data.contains_key(&b"a"[..]));
        assert_eq!(rec.discarded, 1);
        assert_eq!(rec.next_txn_id, 3);
    }

    #[test]
    fn test_corruption_recovery_skips_bad_transaction() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("t.db");

        let first = txn(1, &[(b"good1", b"val1")], &[]);
        let second = txn(2, &[(b"bad", b"val2")], &[]);
        let third = txn(3, &[(b"good3", b"val3")], &[]);
        let mut log = LogWriter::create(&path).unwrap();
        log.append(&first, true).unwrap();
        log.append(&second, true).unwrap();
        log.append(&third, true).unwrap();
        drop(log);

        // flip a byte in the payload of the second transaction's Put record
        let mut data = std::fs::read(&path).unwrap();
        let target = FILE_HEADER_SIZE + first.len() + HEADER_SIZE + 2;
        data[target] ^= 0xFF;
        std::fs::write(&path, data).unwrap();

        let rec = recover(&path).unwrap();
        assert!(rec.data.contains_key(&b"good1"[..]));
        assert!(rec.data.contains_key(&b"good3"[..]));
        assert!(!rec.data.contains_key(&b"bad"[..]));
        assert!(rec.skipped >= 1);
    }

    #[test]
    fn test_torn_write_truncated_on_open() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("t.db");

        let mut log = LogWriter::create(&path).unwrap();
        log.append(&txn(1, &[(b"complete", b"entry")], &[]), true).unwrap();
        drop(log);

        let mut data = std::fs::read(&path).unwrap();
        let intact = data.len() as u64;
        data.extend_from_slice(&MAGIC_ARRAY);
        data.extend_from_slice(&[0xFF, 0x00, 0x00, 0x00]);
        std::fs::write(&path, data).unwrap();

        let mut log = LogWriter::open(&path).unwrap();
        let rec = recover(&path).unwrap();
        assert_eq!(rec.data.len(), 1);
        assert_eq!(rec.valid_len, intact);

        log.cut_tail(rec.valid_len).unwrap();
        assert_eq!(log.size(), intact);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), intact);
    }

    #[test]
    fn test_damaged_length_does_not_cut_later_commits() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("t.db");

        let mut log = LogWriter::create(&path).unwrap();
        log.append(&txn(1, &[(b"first", b"1")], &[]), true).unwrap();
        log.append(&txn(2, &[(b"second", b"2")], &[]), true).unwrap();
        log.append(&txn(3, &[(b"third", b"3")], &[]), true).unwrap();
        let full = log.size();
        drop(log);

        // high byte of the first record's length
        let mut data = std::fs::read(&path).unwrap();
        data[FILE_HEADER_SIZE + 7] = 0x7f;
        std::fs::write(&path, data).unwrap();

        let mut log = LogWriter::open(&path).unwrap();
        let rec = recover(&path).unwrap();
        assert!(!rec.data.contains_key(&b"first"[..]));
        assert_eq!(rec.data.get(&b"second"[..]).unwrap(), b"2");
        assert_eq!(rec.data.get(&b"third"[..]).unwrap(), b"3");
        assert_eq!(rec.valid_len, full);
        assert!(rec.skipped >= 1);

        log.cut_tail(rec.valid_len).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), full);
    }

    #[test]
    fn test_overlong_record_before_intact_one_is_skipped() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("t.db");

        // a header that passes its own checksum but claims more bytes than
        // the file has, followed by an intact transaction
        let mut bogus = ChunkHeader::new(1 << 20, 0, Operation::Put).to_bytes().to_vec();
        bogus.extend_from_slice(&[0u8; 8]);
        let mut log = LogWriter::create(&path).unwrap();
        log.append(&bogus, true).unwrap();
        log.append(&txn(1, &[(b"after", b"x")], &[]), true).unwrap();
        let full = log.size();
        drop(log);

        let rec = recover(&path).unwrap();
        assert_eq!(rec.data.get(&b"after"[..]).unwrap(), b"x");
        assert_eq!(rec.valid_len, full);
    }

    #[test]
    fn test_second_writer_is_refused() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("t.db");

        let first = LogWriter::create(&path).unwrap();
        assert!(matches!(LogWriter::open(&path), Err(EngineError::Locked { .. })));
        drop(first);
        assert!(LogWriter::open(&path).is_ok());
    }

    #[test]
    fn test_bad_file_header_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("t.db");
        std::fs::write(&path, b"definitely not a database file").unwrap();
        assert!(matches!(recover(&path), Err(EngineError::BadFileHeader { .. })));
    }

    #[test]
    fn test_empty_file_gets_header() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("t.db");
        std::fs::write(&path, b"").unwrap();

        assert!(recover(&path).unwrap().data.is_empty());
        let mut log = LogWriter::open(&path).unwrap();
        assert_eq!(log.size(), FILE_HEADER_SIZE as u64);

        let rec = recover(&path).unwrap();
        assert!(rec.data.is_empty());
        assert_eq!(rec.valid_len, FILE_HEADER_SIZE as u64);
        log.cut_tail(rec.valid_len).unwrap();
        assert_eq!(log.size(), FILE_HEADER_SIZE as u64);
    }
}
