//! Internal error types for the engine's log and file handling.
//!
//! These carry the context needed for diagnostics (paths, offsets, checksums).
//! They never cross the engine boundary as-is: `EngineError::status` folds
//! each one into a `Status` code after it has been logged.

use std::path::PathBuf;

use thiserror::Error;

use crate::status::Status;

/// Engine error types with detailed context
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// I/O operation failed
    #[error("I/O error{}: {message} ({kind})", path_suffix(.path))]
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// The file does not start with a valid database header
    #[error("not a shelf database: {}: {reason}", .path.display())]
    BadFileHeader {
        /// File being opened
        path: PathBuf,
        /// What was wrong with the header
        reason: String,
    },

    /// A log record is structurally invalid
    #[error("log record corrupted at offset {offset}: {reason}")]
    Corrupted {
        /// Byte offset of the record
        offset: u64,
        /// Description of the corruption
        reason: String,
    },

    /// Checksum verification failed
    #[error("checksum mismatch at offset {offset}: expected 0x{expected:08x}, got 0x{actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum value
        expected: u32,
        /// Actual checksum computed
        actual: u32,
        /// Byte offset of the corrupted record
        offset: u64,
    },

    /// Partial record at the end of the log
    #[error("torn write at offset {offset}: expected {expected_size} bytes, only {available_bytes} available")]
    TornWrite {
        /// Expected record size
        expected_size: u32,
        /// Actual bytes available
        available_bytes: u64,
        /// Offset where the torn record begins
        offset: u64,
    },

    /// Another connection holds the database file
    #[error("database file {path} is locked by another connection")]
    Locked {
        /// The locked file
        path: PathBuf,
    },

    /// Entry size exceeds the configured maximum
    #[error("entry {component} too large: {entry_size} bytes exceeds limit of {max_size} bytes")]
    OversizedEntry {
        /// Size of the oversized entry
        entry_size: u64,
        /// Maximum allowed size
        max_size: u64,
        /// Whether it's the key or value that's oversized
        component: &'static str,
    },
}

fn path_suffix(path: &Option<PathBuf>) -> String {
    match path {
        Some(p) => format!(" in {}", p.display()),
        None => String::new(),
    }
}

impl EngineError {
    /// Build an `Io` variant with a path and a short description.
    pub fn io(path: impl Into<PathBuf>, err: &std::io::Error, what: &str) -> Self {
        EngineError::Io {
            path: Some(path.into()),
            kind: err.kind(),
            message: format!("{}: {}", what, err),
        }
    }

    /// Fold this error into the status code reported across the boundary.
    pub fn status(&self) -> Status {
        match self {
            EngineError::Io { kind, .. } => match kind {
                std::io::ErrorKind::PermissionDenied => Status::PERM,
                std::io::ErrorKind::OutOfMemory => Status::NOMEM,
                std::io::ErrorKind::WouldBlock => Status::BUSY,
                _ => Status::IOERR,
            },
            EngineError::BadFileHeader { .. }
            | EngineError::Corrupted { .. }
            | EngineError::ChecksumMismatch { .. }
            | EngineError::TornWrite { .. } => Status::CORRUPT,
            EngineError::Locked { .. } => Status::BUSY,
            EngineError::OversizedEntry { .. } => Status::LIMIT,
        }
    }
}

/// Convert std::io::Error to EngineError::Io
impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for engine internals
pub type EngineResult<T> = Result<T, EngineError>;
