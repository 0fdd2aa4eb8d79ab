//! Shelf Core: embedded transactional key-value engine
//!
//! An ordered, byte-keyed store where the working set lives in RAM and a
//! single append-only commit log per database file provides durability.
//!
//! # Architecture
//!
//! - **Reads**: served from an ordered in-memory map
//! - **Writes**: applied in memory inside a transaction, with an undo log
//! - **Commit**: one checksummed append per transaction, then `durable_sync`
//! - **Recovery**: replay committed transactions, skip corrupt records,
//!   cut off a torn tail
//!
//! # Boundary
//!
//! Every fallible call returns a [`Status`] code. Reads use a two-call
//! protocol: call once without a buffer to learn the length, then again
//! with a buffer of that size.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use tracing::debug;

pub mod config;
pub mod cursor;
pub mod engine;
pub mod error;
pub mod format;
pub mod platform_durability;
pub mod status;
pub mod wal;

pub use config::Config;
pub use cursor::{KvCursor, SeekMode};
pub use engine::{Connection, OpenFlags};
pub use error::{EngineError, EngineResult};
pub use status::{KvResult, Status};

/// Name that opens a private in-memory database
pub const MEMORY_DB: &str = ":mem:";

static INITIALIZED: AtomicBool = AtomicBool::new(false);
static THREAD_LEVEL: AtomicU8 = AtomicU8::new(ThreadLevel::Multi as u8);

/// Process-wide threading mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadLevel {
    /// Each connection may only be used by the thread that opened it
    Single = 1,
    /// Connections may be shared between threads
    Multi = 2,
}

/// Current threading mode.
pub fn thread_level() -> ThreadLevel {
    if THREAD_LEVEL.load(Ordering::Acquire) == ThreadLevel::Single as u8 {
        ThreadLevel::Single
    } else {
        ThreadLevel::Multi
    }
}

/// Choose the threading mode. Only allowed before the library is
/// initialised (or after `lib_shutdown`); otherwise `LOCKED`.
///
/// Affects connections opened afterwards.
pub fn lib_config(level: ThreadLevel) -> KvResult<()> {
    if INITIALIZED.load(Ordering::Acquire) {
        return Err(Status::LOCKED);
    }
    THREAD_LEVEL.store(level as u8, Ordering::Release);
    Ok(())
}

/// Initialise the library. Idempotent; `Connection::open` calls it.
pub fn lib_init() -> KvResult<()> {
    if !INITIALIZED.swap(true, Ordering::AcqRel) {
        debug!(thread_level = ?thread_level(), version = lib_version(), "engine library initialised");
    }
    Ok(())
}

/// Release process-wide state. Connections still open keep working; the
/// next open initialises the library again.
pub fn lib_shutdown() -> KvResult<()> {
    if INITIALIZED.swap(false, Ordering::AcqRel) {
        debug!("engine library shut down");
    }
    Ok(())
}

/// True when connections may be shared between threads.
pub fn lib_is_threadsafe() -> bool {
    thread_level() == ThreadLevel::Multi
}

/// Library version.
pub fn lib_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Library signature, as embedded in diagnostics.
pub fn lib_signature() -> &'static str {
    concat!("shelf-core/", env!("CARGO_PKG_VERSION"))
}

/// Identifier of the storage format this build reads and writes.
pub fn lib_ident() -> &'static str {
    "shelf-commit-log-v1"
}

/// Copyright notice.
pub fn lib_copyright() -> &'static str {
    "Copyright (c) the Shelf Project developers. Licensed under MIT OR Apache-2.0."
}
