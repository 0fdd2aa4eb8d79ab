//! Shared helpers for the access layer tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Once;

use shelf_kv::{Database, Registry};
use tempfile::TempDir;

static TRACING: Once = Once::new();

/// Route `tracing` output through the test harness. Honours `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A fresh database file in its own temp dir.
pub fn temp_db(registry: &Registry) -> (Database, TempDir, PathBuf) {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");
    let db = registry.open(path.to_str().unwrap()).unwrap();
    (db, dir, path)
}

/// Copy the file of a still-open database and open the copy in a fresh
/// registry, as if the process had died at this point.
pub fn crash_snapshot(path: &Path, dir: &TempDir) -> (Database, Registry) {
    let snapshot = dir.path().join("crash.db");
    std::fs::copy(path, &snapshot).unwrap();
    let registry = Registry::new();
    let db = registry.open(snapshot.to_str().unwrap()).unwrap();
    (db, registry)
}
