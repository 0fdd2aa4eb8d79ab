//! Status codes returned across the engine boundary.
//!
//! Every fallible engine call reports one of these codes. The numbering is
//! stable and part of the public contract: bindings translate codes into
//! their own error types and must cope with codes they do not recognise.

use std::fmt;

/// Raw engine status code.
///
/// `Status::OK` is never carried inside an `Err`. `Status::DONE` is not an
/// error either; it reports that an iteration step ran off the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub i32);

impl Status {
    /// Success
    pub const OK: Status = Status(0);
    /// Out of memory
    pub const NOMEM: Status = Status(-1);
    /// I/O error
    pub const IOERR: Status = Status(-2);
    /// Empty record
    pub const EMPTY: Status = Status(-3);
    /// Operation forbidden in the current state
    pub const LOCKED: Status = Status(-4);
    /// No such record
    pub const NOTFOUND: Status = Status(-6);
    /// Engine limit reached
    pub const LIMIT: Status = Status(-7);
    /// Invalid parameter
    pub const INVALID: Status = Status(-9);
    /// The connection was released underneath the caller
    pub const ABORT: Status = Status(-10);
    /// Record exists
    pub const EXISTS: Status = Status(-11);
    /// Unknown configuration option
    pub const UNKNOWN: Status = Status(-13);
    /// The database file is locked
    pub const BUSY: Status = Status(-14);
    /// Method not implemented by this engine
    pub const NOTIMPLEMENTED: Status = Status(-17);
    /// End of input
    pub const EOF: Status = Status(-18);
    /// Permission error
    pub const PERM: Status = Status(-19);
    /// No such method
    pub const NOOP: Status = Status(-20);
    /// Corrupt pointer or corrupt storage
    pub const CORRUPT: Status = Status(-24);
    /// Operation done (not an error)
    pub const DONE: Status = Status(-28);
    /// Full database
    pub const FULL: Status = Status(-73);
    /// Unable to open the database file
    pub const CANTOPEN: Status = Status(-74);
    /// Read-only key/value store
    pub const READ_ONLY: Status = Status(-75);
    /// Locking protocol error
    pub const LOCKERR: Status = Status(-76);

    /// The raw numeric code.
    pub fn code(self) -> i32 {
        self.0
    }

    /// True for `OK`.
    pub fn is_ok(self) -> bool {
        self == Status::OK
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status {}", self.0)
    }
}

/// Result type for engine boundary calls.
pub type KvResult<T> = Result<T, Status>;
