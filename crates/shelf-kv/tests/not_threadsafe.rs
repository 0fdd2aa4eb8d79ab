//! A registry cannot run on an engine configured for single-thread use.
//!
//! Lives in its own test binary: the threading mode is process-wide.

use shelf_core::{lib_config, ThreadLevel};
use shelf_kv::Registry;

#[test]
#[should_panic(expected = "not thread-safe")]
fn test_registry_refuses_single_thread_engine() {
    lib_config(ThreadLevel::Single).unwrap();
    assert!(!shelf_kv::is_threadsafe());
    let _registry = Registry::new();
}
