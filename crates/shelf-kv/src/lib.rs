//! Shelf access layer
//!
//! Thread-safe database handles, cursors and typed object storage over the
//! `shelf-core` engine.
//!
//! # Architecture
//!
//! - A [`Registry`] maps normalised filenames to open handles, so opening the
//!   same file twice yields the same [`Database`]
//! - A [`Database`] wraps one engine connection behind a read/write lock and
//!   exposes raw byte records plus explicit transactions
//! - A [`Cursor`] walks the sorted key space as a small state machine
//! - The object layer (`set_object`, `get_object`, `delete_object`) marshals
//!   values through a pluggable codec (JSON by default) and commits every
//!   `commit_threshold` writes
//!
//! Engine failures surface as [`Error`] values carrying an [`ErrorKind`].

pub mod codec;
pub mod config;
pub mod cursor;
pub mod db;
pub mod error;
pub mod object;
pub mod registry;
pub mod tx;

pub use codec::{json_marshal, json_unmarshal, MarshalFn, UnmarshalFn};
pub use config::{Config, DEFAULT_COMMIT_THRESHOLD};
pub use cursor::{Cursor, CursorState, Walk};
pub use db::Database;
pub use error::{BoxError, Error, ErrorKind, Result};
pub use registry::Registry;
pub use shelf_core::MEMORY_DB;

/// Engine library version.
pub fn version() -> &'static str {
    shelf_core::lib_version()
}

/// Engine build signature.
pub fn signature() -> &'static str {
    shelf_core::lib_signature()
}

/// Storage format identifier.
pub fn ident() -> &'static str {
    shelf_core::lib_ident()
}

pub fn copyright() -> &'static str {
    shelf_core::lib_copyright()
}

/// True unless the engine was configured for single-thread use.
pub fn is_threadsafe() -> bool {
    shelf_core::lib_is_threadsafe()
}

/// Shut the engine library down. Handles still open keep working until
/// closed; prefer [`Registry::shutdown`], which closes them first.
pub fn shutdown() -> Result<()> {
    shelf_core::lib_shutdown().map_err(Error::from)
}
