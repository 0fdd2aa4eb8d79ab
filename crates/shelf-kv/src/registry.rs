//! Registry of open database handles.
//!
//! Opening a file that already has a live handle in the same registry
//! returns that handle. Entries are weak: a handle leaves the registry when
//! it is closed or when its last clone is dropped.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use shelf_core::{lib_init, lib_is_threadsafe, lib_shutdown, Connection, MEMORY_DB};

use crate::config::Config;
use crate::db::{Database, Shared};
use crate::error::{Error, ErrorKind, Result};

pub(crate) struct RegistryInner {
    handles: Mutex<HashMap<String, Weak<Shared>>>,
}

impl RegistryInner {
    /// Drop the entry for `name` if it still refers to `handle`.
    pub(crate) fn remove(&self, name: &str, handle: *const Shared) {
        let mut handles = self.handles.lock();
        if handles.get(name).map_or(false, |w| std::ptr::eq(w.as_ptr(), handle)) {
            handles.remove(name);
        }
    }

    fn live(&self) -> Vec<Arc<Shared>> {
        self.handles.lock().values().filter_map(Weak::upgrade).collect()
    }
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        let live: Vec<Arc<Shared>> = self.handles.get_mut().values().filter_map(Weak::upgrade).collect();
        for shared in live {
            if let Err(e) = shared.close() {
                warn!(name = shared.name(), error = %e, "close during registry teardown failed");
            }
        }
    }
}

/// Maps database filenames to their open handles.
///
/// Cloning a registry shares it. Dropping the last clone closes every handle
/// still open through it.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    /// Initialise the engine library and create an empty registry.
    ///
    /// # Panics
    ///
    /// If the engine is configured for single-thread use: handles are shared
    /// between threads, so the layer cannot run on such an engine.
    pub fn new() -> Self {
        if let Err(status) = lib_init() {
            panic!("storage engine failed to initialise: {}", status);
        }
        if !lib_is_threadsafe() {
            panic!("storage engine is not thread-safe; database handles cannot be shared");
        }
        Self {
            inner: Arc::new(RegistryInner {
                handles: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Open `filename` with the default configuration.
    pub fn open(&self, filename: &str) -> Result<Database> {
        self.open_with(filename, Config::default())
    }

    /// Open `filename`, applying `config` if this is the first open.
    ///
    /// A live handle for the same file is returned as-is and `config` is
    /// ignored.
    pub fn open_with(&self, filename: &str, config: Config) -> Result<Database> {
        let name = normalize(filename)?;
        let mut handles = self.inner.handles.lock();

        if let Some(shared) = handles.get(&name).and_then(Weak::upgrade) {
            if !shared.is_closed() {
                return Ok(Database { inner: shared });
            }
        }

        config.validate()?;
        let conn = Connection::open(Path::new(&name), config.open_flags(), config.engine.clone())
            .map_err(|status| Error::open(&name, status))?;

        let shared = Arc::new(Shared::new(name.clone(), conn, Arc::downgrade(&self.inner), &config));
        handles.insert(name, Arc::downgrade(&shared));
        debug!(
            name = shared.name(),
            read_only = config.read_only,
            threshold = config.commit_threshold,
            "opened database handle"
        );
        Ok(Database { inner: shared })
    }

    /// True if `filename` has a live handle in this registry.
    pub fn is_open(&self, filename: &str) -> bool {
        let name = match normalize(filename) {
            Ok(name) => name,
            Err(_) => return false,
        };
        let entry = self.inner.handles.lock().get(&name).cloned();
        entry
            .and_then(|weak| weak.upgrade())
            .map_or(false, |shared| !shared.is_closed())
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.inner.live().iter().filter(|s| !s.is_closed()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every handle and shut the engine library down.
    ///
    /// All handles are closed even if some fail; the first failure is
    /// returned.
    pub fn shutdown(&self) -> Result<()> {
        let mut first_err = None;
        for shared in self.inner.live() {
            if let Err(e) = shared.close() {
                warn!(name = shared.name(), error = %e, "close during shutdown failed");
                first_err.get_or_insert(e);
            }
        }
        lib_shutdown()?;
        debug!("registry shut down");
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("open", &self.len()).finish()
    }
}

/// Registry key for a filename: an absolute path with the parent directory
/// canonicalised, or `:mem:` as-is.
fn normalize(filename: &str) -> Result<String> {
    if filename == MEMORY_DB {
        return Ok(filename.to_string());
    }
    if filename.is_empty() {
        return Err(Error::Open {
            path: String::new(),
            kind: ErrorKind::CantOpen,
        });
    }

    let path = Path::new(filename);
    let absolute: PathBuf = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|_| Error::Open {
                path: filename.to_string(),
                kind: ErrorKind::CantOpen,
            })?
            .join(path)
    };

    let normalized = match (absolute.parent(), absolute.file_name()) {
        (Some(parent), Some(file)) => match parent.canonicalize() {
            Ok(dir) => dir.join(file),
            Err(_) => absolute,
        },
        _ => absolute,
    };
    Ok(normalized.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_normalize_memory_and_relative() {
        assert_eq!(normalize(MEMORY_DB).unwrap(), ":mem:");
        let rel = normalize("some.db").unwrap();
        assert!(Path::new(&rel).is_absolute());
        assert!(rel.ends_with("some.db"));
        assert!(normalize("").is_err());
    }

    #[test]
    fn test_normalize_resolves_dot_segments() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let direct = dir.path().join("x.db");
        let roundabout = dir.path().join("sub").join("..").join("x.db");
        assert_eq!(
            normalize(direct.to_str().unwrap()).unwrap(),
            normalize(roundabout.to_str().unwrap()).unwrap()
        );
    }

    #[test]
    fn test_same_file_same_handle() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reg.db");
        let registry = Registry::new();

        let a = registry.open(path.to_str().unwrap()).unwrap();
        let b = registry.open(path.to_str().unwrap()).unwrap();
        assert!(a.same_handle(&b));
        assert_eq!(registry.len(), 1);
        assert!(registry.is_open(path.to_str().unwrap()));

        a.close().unwrap();
        assert!(!registry.is_open(path.to_str().unwrap()));
        assert!(registry.is_empty());

        let c = registry.open(path.to_str().unwrap()).unwrap();
        assert!(!c.same_handle(&a));
    }

    #[test]
    fn test_dropped_handle_leaves_registry() {
        let registry = Registry::new();
        let db = registry.open(MEMORY_DB).unwrap();
        assert_eq!(registry.len(), 1);
        drop(db);
        assert_eq!(registry.len(), 0);
        assert!(!registry.is_open(MEMORY_DB));
    }

    #[test]
    fn test_open_failure_not_registered() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::new();
        let missing = dir.path().join("missing.db");
        let err = registry
            .open_with(missing.to_str().unwrap(), Config::default().with_create(false))
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::CantOpen));
        assert!(registry.is_empty());
    }
}
