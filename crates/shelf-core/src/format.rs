//! On-disk layout of a database file.
//!
//! A database file is a 16-byte file header followed by a sequence of log
//! records:
//!
//! ```text
//! FileHeader (16) | Record | Record | ...
//! Record = ChunkHeader (32) + txn_id(u64) + key_len(u32) + value_len(u32)
//!          + op(u8) + pad[3] + key + value
//! ```
//!
//! Records belonging to one transaction share a `txn_id`. A transaction's
//! records only take effect once a `Commit` record for that id follows them.

use crate::error::{EngineError, EngineResult};

/// First eight bytes of every database file
pub const FILE_MAGIC: [u8; 8] = *b"SHELFDB\0";

/// Current on-disk format version
pub const FORMAT_VERSION: u32 = 1;

/// File header size in bytes
pub const FILE_HEADER_SIZE: usize = 16;

/// Record magic: "SHLF"
pub const MAGIC_ARRAY: [u8; 4] = *b"SHLF";

/// Record header size in bytes
pub const HEADER_SIZE: usize = 32;

/// Bytes of the record header covered by its own checksum
const HEADER_CRC_AT: usize = 13;

/// Fixed part of a record payload before the key bytes
pub const PAYLOAD_PREFIX: usize = 8 + 4 + 4 + 1 + 3;

/// Record kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Operation {
    /// Insert or overwrite a key
    Put = 1,
    /// Remove a key
    Delete = 2,
    /// Make every earlier record of the transaction visible
    Commit = 3,
}

impl Operation {
    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Operation::Put),
            2 => Some(Operation::Delete),
            3 => Some(Operation::Commit),
            _ => None,
        }
    }
}

/// Encode the file header.
pub fn file_header() -> [u8; FILE_HEADER_SIZE] {
    let mut buf = [0u8; FILE_HEADER_SIZE];
    buf[0..8].copy_from_slice(&FILE_MAGIC);
    buf[8..12].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    buf
}

/// Check a file header, returning a description of the problem if any.
pub fn check_file_header(bytes: &[u8]) -> Result<(), String> {
    if bytes.len() < FILE_HEADER_SIZE {
        return Err(format!("file too short for header: {} bytes", bytes.len()));
    }
    if bytes[0..8] != FILE_MAGIC {
        return Err("bad magic".to_string());
    }
    let version = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
    if version != FORMAT_VERSION {
        return Err(format!("unsupported format version {}", version));
    }
    Ok(())
}

/// Fixed-size header for each record
///
/// Layout:
///   [0..4]   magic:      [u8;4] - "SHLF"
///   [4..8]   length:     u32    - payload length in bytes
///   [8..12]  checksum:   u32    - CRC32C of payload bytes
///   [12]     entry_type: u8     - operation
///   [13..17] header_crc: u32    - CRC32C of bytes [0..13]
///   [17..32] zero
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub magic: [u8; 4],
    pub length: u32,
    pub checksum: u32,
    pub entry_type: u8,
}

impl ChunkHeader {
    pub fn new(length: u32, checksum: u32, op: Operation) -> Self {
        Self {
            magic: MAGIC_ARRAY,
            length,
            checksum,
            entry_type: op as u8,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..8].copy_from_slice(&self.length.to_le_bytes());
        buf[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        buf[12] = self.entry_type;
        let header_crc = crc32c::crc32c(&buf[..HEADER_CRC_AT]);
        buf[HEADER_CRC_AT..HEADER_CRC_AT + 4].copy_from_slice(&header_crc.to_le_bytes());
        buf
    }

    /// True if the magic, length and type bytes match their checksum.
    pub fn is_intact(bytes: &[u8; HEADER_SIZE]) -> bool {
        let stored = u32::from_le_bytes([bytes[13], bytes[14], bytes[15], bytes[16]]);
        stored == crc32c::crc32c(&bytes[..HEADER_CRC_AT])
    }

    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        Self {
            magic: [bytes[0], bytes[1], bytes[2], bytes[3]],
            length: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            checksum: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            entry_type: bytes[12],
        }
    }
}

/// A decoded log record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub txn_id: u64,
    pub op: Operation,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Append the encoded form of one record to `out`.
pub fn encode_record(out: &mut Vec<u8>, txn_id: u64, op: Operation, key: &[u8], value: &[u8]) {
    let payload_len = PAYLOAD_PREFIX + key.len() + value.len();
    let header_at = out.len();
    out.resize(header_at + HEADER_SIZE, 0);

    let payload_at = out.len();
    out.reserve(payload_len);
    out.extend_from_slice(&txn_id.to_le_bytes());
    out.extend_from_slice(&(key.len() as u32).to_le_bytes());
    out.extend_from_slice(&(value.len() as u32).to_le_bytes());
    out.push(op as u8);
    out.extend_from_slice(&[0u8; 3]);
    out.extend_from_slice(key);
    out.extend_from_slice(value);

    let checksum = crc32c::crc32c(&out[payload_at..]);
    let header = ChunkHeader::new(payload_len as u32, checksum, op);
    out[header_at..payload_at].copy_from_slice(&header.to_bytes());
}

/// Encoded size of one record.
pub fn record_size(key: &[u8], value: &[u8]) -> usize {
    HEADER_SIZE + PAYLOAD_PREFIX + key.len() + value.len()
}

/// Decode one record from the start of `data`.
///
/// `offset` is only used for error reporting. On success returns the record
/// and the number of bytes it occupied.
pub fn decode_record(data: &[u8], offset: u64) -> EngineResult<(Record, usize)> {
    if data.len() < HEADER_SIZE {
        return Err(EngineError::TornWrite {
            expected_size: HEADER_SIZE as u32,
            available_bytes: data.len() as u64,
            offset,
        });
    }

    let mut header_bytes = [0u8; HEADER_SIZE];
    header_bytes.copy_from_slice(&data[..HEADER_SIZE]);
    let header = ChunkHeader::from_bytes(&header_bytes);

    if header.magic != MAGIC_ARRAY {
        return Err(EngineError::Corrupted {
            offset,
            reason: format!("no record magic, found {:02x?}", header.magic),
        });
    }
    // A damaged length must not pass for a record cut off by end of file.
    if !ChunkHeader::is_intact(&header_bytes) {
        return Err(EngineError::Corrupted {
            offset,
            reason: "record header checksum mismatch".to_string(),
        });
    }

    let total = HEADER_SIZE + header.length as usize;
    if data.len() < total {
        return Err(EngineError::TornWrite {
            expected_size: header.length,
            available_bytes: (data.len() - HEADER_SIZE) as u64,
            offset,
        });
    }

    let payload = &data[HEADER_SIZE..total];
    let actual = crc32c::crc32c(payload);
    if actual != header.checksum {
        return Err(EngineError::ChecksumMismatch {
            expected: header.checksum,
            actual,
            offset,
        });
    }

    if payload.len() < PAYLOAD_PREFIX {
        return Err(EngineError::Corrupted {
            offset,
            reason: "payload too short for record fields".to_string(),
        });
    }

    let mut txn = [0u8; 8];
    txn.copy_from_slice(&payload[0..8]);
    let txn_id = u64::from_le_bytes(txn);
    let key_len = u32::from_le_bytes([payload[8], payload[9], payload[10], payload[11]]) as usize;
    let value_len = u32::from_le_bytes([payload[12], payload[13], payload[14], payload[15]]) as usize;
    let op = Operation::from_u8(payload[16]).ok_or_else(|| EngineError::Corrupted {
        offset,
        reason: format!("invalid operation {}", payload[16]),
    })?;
    if op as u8 != header.entry_type {
        return Err(EngineError::Corrupted {
            offset,
            reason: "operation disagrees with record header".to_string(),
        });
    }

    let key_end = PAYLOAD_PREFIX + key_len;
    let value_end = key_end + value_len;
    if value_end != payload.len() {
        return Err(EngineError::Corrupted {
            offset,
            reason: format!(
                "payload is {} bytes, fields need {} (key {}, value {})",
                payload.len(), value_end, key_len, value_len
            ),
        });
    }

    let record = Record {
        txn_id,
        op,
        key: payload[PAYLOAD_PREFIX..key_end].to_vec(),
        value: payload[key_end..value_end].to_vec(),
    };
    Ok((record, total))
}

/// Position of the next record magic at or after `from`, if any.
pub fn find_next_magic(data: &[u8], from: usize) -> Option<usize> {
    if from >= data.len() {
        return None;
    }
    data[from..]
        .windows(MAGIC_ARRAY.len())
        .position(|w| w == MAGIC_ARRAY)
        .map(|p| from + p)
}
