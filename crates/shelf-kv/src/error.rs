//! Error types for the access layer.
//!
//! Engine status codes are translated once, at the call site, into an
//! [`ErrorKind`]. Callers match on kinds, never on raw numbers.

use std::fmt;

use shelf_core::Status;
use thiserror::Error;

/// Boxed error produced by a marshal or unmarshal function
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure category reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    LockError,
    ReadOnly,
    CantOpen,
    Full,
    Corrupt,
    NoSuchMethod,
    Permission,
    EndOfInput,
    NotImplemented,
    Busy,
    Locked,
    UnknownConfig,
    Exists,
    Abort,
    Invalid,
    Limit,
    NotFound,
    Empty,
    IoError,
    OutOfMemory,
    /// Iteration finished. Not a failure; cursors turn it into success.
    Done,
    /// A code this version does not know about
    Unknown(i32),
}

impl ErrorKind {
    /// Translate an engine status.
    pub fn from_status(status: Status) -> Self {
        match status {
            Status::LOCKERR => ErrorKind::LockError,
            Status::READ_ONLY => ErrorKind::ReadOnly,
            Status::CANTOPEN => ErrorKind::CantOpen,
            Status::FULL => ErrorKind::Full,
            Status::CORRUPT => ErrorKind::Corrupt,
            Status::NOOP => ErrorKind::NoSuchMethod,
            Status::PERM => ErrorKind::Permission,
            Status::EOF => ErrorKind::EndOfInput,
            Status::NOTIMPLEMENTED => ErrorKind::NotImplemented,
            Status::BUSY => ErrorKind::Busy,
            Status::LOCKED => ErrorKind::Locked,
            Status::UNKNOWN => ErrorKind::UnknownConfig,
            Status::EXISTS => ErrorKind::Exists,
            Status::ABORT => ErrorKind::Abort,
            Status::INVALID => ErrorKind::Invalid,
            Status::LIMIT => ErrorKind::Limit,
            Status::NOTFOUND => ErrorKind::NotFound,
            Status::EMPTY => ErrorKind::Empty,
            Status::IOERR => ErrorKind::IoError,
            Status::NOMEM => ErrorKind::OutOfMemory,
            Status::DONE => ErrorKind::Done,
            other => ErrorKind::Unknown(other.code()),
        }
    }

    /// The engine status code for this kind.
    pub fn code(self) -> i32 {
        let status = match self {
            ErrorKind::LockError => Status::LOCKERR,
            ErrorKind::ReadOnly => Status::READ_ONLY,
            ErrorKind::CantOpen => Status::CANTOPEN,
            ErrorKind::Full => Status::FULL,
            ErrorKind::Corrupt => Status::CORRUPT,
            ErrorKind::NoSuchMethod => Status::NOOP,
            ErrorKind::Permission => Status::PERM,
            ErrorKind::EndOfInput => Status::EOF,
            ErrorKind::NotImplemented => Status::NOTIMPLEMENTED,
            ErrorKind::Busy => Status::BUSY,
            ErrorKind::Locked => Status::LOCKED,
            ErrorKind::UnknownConfig => Status::UNKNOWN,
            ErrorKind::Exists => Status::EXISTS,
            ErrorKind::Abort => Status::ABORT,
            ErrorKind::Invalid => Status::INVALID,
            ErrorKind::Limit => Status::LIMIT,
            ErrorKind::NotFound => Status::NOTFOUND,
            ErrorKind::Empty => Status::EMPTY,
            ErrorKind::IoError => Status::IOERR,
            ErrorKind::OutOfMemory => Status::NOMEM,
            ErrorKind::Done => Status::DONE,
            ErrorKind::Unknown(code) => return code,
        };
        status.code()
    }

    pub fn description(self) -> &'static str {
        match self {
            ErrorKind::LockError => "locking protocol error",
            ErrorKind::ReadOnly => "database is read-only",
            ErrorKind::CantOpen => "unable to open the database file",
            ErrorKind::Full => "database is full",
            ErrorKind::Corrupt => "database file is corrupt",
            ErrorKind::NoSuchMethod => "no such method",
            ErrorKind::Permission => "permission denied",
            ErrorKind::EndOfInput => "end of input",
            ErrorKind::NotImplemented => "not implemented by the storage engine",
            ErrorKind::Busy => "database file is locked",
            ErrorKind::Locked => "operation forbidden",
            ErrorKind::UnknownConfig => "unknown configuration option",
            ErrorKind::Exists => "record exists",
            ErrorKind::Abort => "connection was released by another thread",
            ErrorKind::Invalid => "invalid parameter",
            ErrorKind::Limit => "database limit reached",
            ErrorKind::NotFound => "no such record",
            ErrorKind::Empty => "empty record",
            ErrorKind::IoError => "I/O error",
            ErrorKind::OutOfMemory => "out of memory",
            ErrorKind::Done => "operation done",
            ErrorKind::Unknown(_) => "unknown engine error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Unknown(code) => write!(f, "unknown engine error (code {})", code),
            kind => f.write_str(kind.description()),
        }
    }
}

/// Access layer error
#[derive(Debug, Error)]
pub enum Error {
    /// The engine refused an operation
    #[error("{kind}")]
    Engine { kind: ErrorKind },

    /// The engine refused to open a database
    #[error("cannot open {path}: {kind}")]
    Open { path: String, kind: ErrorKind },

    /// Handle or cursor used in a state that does not allow the operation
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("cannot marshal value for key {key:?}")]
    Marshal {
        key: String,
        #[source]
        source: BoxError,
    },

    #[error("cannot unmarshal value for key {key:?}")]
    Unmarshal {
        key: String,
        #[source]
        source: BoxError,
    },

    /// An operation failed and the rollback that followed failed too
    #[error("{source} (rollback also failed: {rollback})")]
    Rollback {
        #[source]
        source: Box<Error>,
        rollback: ErrorKind,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Engine kind of the failure, if it came from the engine. For
    /// `Rollback` this is the kind of the original failure.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Error::Engine { kind } | Error::Open { kind, .. } => Some(*kind),
            Error::Rollback { source, .. } => source.kind(),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == Some(ErrorKind::NotFound)
    }

    pub(crate) fn open(path: &str, status: Status) -> Self {
        Error::Open {
            path: path.to_string(),
            kind: ErrorKind::from_status(status),
        }
    }
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        Error::Engine {
            kind: ErrorKind::from_status(status),
        }
    }
}

/// Result type alias for the access layer
pub type Result<T> = std::result::Result<T, Error>;
