//! Typed object storage with batched auto-commit.
//!
//! Values are converted to a [`serde_json::Value`] and then to bytes by the
//! handle's marshal function (JSON text unless replaced). Every successful
//! `set_object`/`delete_object` counts towards the commit threshold; reaching
//! it commits the batch and resets the counter.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::codec::{Codec, MarshalFn, UnmarshalFn};
use crate::db::{Batch, Database};
use crate::error::{BoxError, Error, Result};

impl Database {
    /// Store `value` under `key`.
    ///
    /// A marshal failure stores nothing and leaves the counter as it was.
    /// A failed store or auto-commit rolls back the pending batch.
    pub fn set_object<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = self.marshal_object(key, value)?;
        let mut batch = self.inner.batch.lock();
        if let Err(e) = self.store(key.as_bytes(), &bytes) {
            return Err(self.rollback_locked(&mut batch, e));
        }
        self.count_change(&mut batch)
    }

    /// Load the value under `key`. A missing key is `Ok(None)`.
    pub fn get_object<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let bytes = match self.fetch(key.as_bytes()) {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };

        let unmarshal = self.inner.codec.read().unmarshal.clone();
        let value = unmarshal(&bytes).map_err(|source| unmarshal_failed(key, bytes.len(), source))?;
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| unmarshal_failed(key, bytes.len(), Box::new(e)))
    }

    /// Load the value under `key` into `out`.
    ///
    /// Returns whether the key existed; `out` is untouched when it did not.
    pub fn get_object_into<T: DeserializeOwned>(&self, key: &str, out: &mut T) -> Result<bool> {
        match self.get_object(key)? {
            Some(value) => {
                *out = value;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Delete the value under `key`.
    ///
    /// Unlike `get_object`, a missing key is an error: it triggers the same
    /// rollback as any other failed write and `NotFound` is returned.
    pub fn delete_object(&self, key: &str) -> Result<()> {
        let mut batch = self.inner.batch.lock();
        if let Err(e) = self.delete(key.as_bytes()) {
            return Err(self.rollback_locked(&mut batch, e));
        }
        self.count_change(&mut batch)
    }

    /// Commit the pending batch now.
    pub fn flush(&self) -> Result<()> {
        let mut batch = self.inner.batch.lock();
        if let Err(e) = self.commit_locked(&mut batch) {
            return Err(self.rollback_locked(&mut batch, e));
        }
        Ok(())
    }

    /// Object writes per auto-commit. Zero or less commits every write.
    pub fn set_commit_threshold(&self, threshold: i64) {
        self.inner.batch.lock().threshold = threshold;
    }

    pub fn commit_threshold(&self) -> i64 {
        self.inner.batch.lock().threshold
    }

    /// Object writes since the last commit.
    pub fn uncommitted_changes(&self) -> usize {
        self.inner.batch.lock().uncommitted
    }

    pub fn set_marshal<F>(&self, f: F)
    where
        F: Fn(&Value) -> std::result::Result<Vec<u8>, BoxError> + Send + Sync + 'static,
    {
        self.inner.codec.write().marshal = std::sync::Arc::new(f);
    }

    pub fn set_unmarshal<F>(&self, f: F)
    where
        F: Fn(&[u8]) -> std::result::Result<Value, BoxError> + Send + Sync + 'static,
    {
        self.inner.codec.write().unmarshal = std::sync::Arc::new(f);
    }

    /// Current marshal function.
    pub fn marshal(&self) -> MarshalFn {
        self.inner.codec.read().marshal.clone()
    }

    /// Current unmarshal function.
    pub fn unmarshal(&self) -> UnmarshalFn {
        self.inner.codec.read().unmarshal.clone()
    }

    /// Go back to the JSON codec.
    pub fn reset_codec(&self) {
        *self.inner.codec.write() = Codec::default();
    }

    fn marshal_object<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<Vec<u8>> {
        let value = serde_json::to_value(value).map_err(|e| Error::Marshal {
            key: key.to_string(),
            source: Box::new(e),
        })?;
        let marshal = self.marshal();
        marshal(&value).map_err(|source| Error::Marshal {
            key: key.to_string(),
            source,
        })
    }

    fn count_change(&self, batch: &mut Batch) -> Result<()> {
        batch.uncommitted += 1;
        if batch.uncommitted >= batch.effective_threshold() {
            if let Err(e) = self.commit_locked(batch) {
                return Err(self.rollback_locked(batch, e));
            }
        }
        Ok(())
    }
}

fn unmarshal_failed(key: &str, size: usize, source: BoxError) -> Error {
    warn!(key, size, error = %source, "cannot unmarshal stored value");
    Error::Unmarshal {
        key: key.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Config, ErrorKind, Registry};
    use serde::Deserialize;
    use shelf_core::MEMORY_DB;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Point {
        x: i32,
        y: i32,
    }

    #[test]
    fn test_object_roundtrip() {
        let registry = Registry::new();
        let db = registry.open(MEMORY_DB).unwrap();
        db.set_object("p", &Point { x: 1, y: -2 }).unwrap();
        assert_eq!(db.get_object::<Point>("p").unwrap(), Some(Point { x: 1, y: -2 }));
        assert_eq!(db.fetch(b"p").unwrap(), br#"{"x":1,"y":-2}"#);
    }

    #[test]
    fn test_absent_leaves_output_untouched() {
        let registry = Registry::new();
        let db = registry.open(MEMORY_DB).unwrap();
        let mut out = Point { x: 9, y: 9 };
        assert!(!db.get_object_into("nope", &mut out).unwrap());
        assert_eq!(out, Point { x: 9, y: 9 });
        assert_eq!(db.get_object::<Point>("nope").unwrap(), None);
    }

    #[test]
    fn test_threshold_counts_and_commits() {
        let registry = Registry::new();
        let db = registry
            .open_with(MEMORY_DB, Config::default().with_commit_threshold(3))
            .unwrap();
        assert_eq!(db.commit_threshold(), 3);

        db.set_object("a", &1).unwrap();
        db.set_object("b", &2).unwrap();
        assert_eq!(db.uncommitted_changes(), 2);
        db.delete_object("a").unwrap();
        assert_eq!(db.uncommitted_changes(), 0);

        db.set_commit_threshold(0);
        db.set_object("c", &3).unwrap();
        assert_eq!(db.uncommitted_changes(), 0);
    }

    #[test]
    fn test_delete_missing_rolls_back_batch() {
        let registry = Registry::new();
        let db = registry.open(MEMORY_DB).unwrap();
        db.set_commit_threshold(10);
        db.set_object("pending", &"value").unwrap();
        assert_eq!(db.uncommitted_changes(), 1);

        let err = db.delete_object("missing").unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(db.uncommitted_changes(), 0);
        assert_eq!(db.get_object::<String>("pending").unwrap(), None);
    }

    #[test]
    fn test_failed_auto_commit_rolls_back_to_last_commit() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("objects.db");
        let registry = Registry::new();
        let db = registry
            .open_with(path.to_str().unwrap(), Config::default().with_commit_threshold(2))
            .unwrap();

        db.set_object("a", &1).unwrap();
        db.set_object("b", &2).unwrap();
        assert_eq!(db.uncommitted_changes(), 0);

        db.with_conn(|conn| conn.fail_commits()).unwrap();
        db.set_object("a", &10).unwrap();
        assert_eq!(db.uncommitted_changes(), 1);
        let err = db.set_object("c", &3).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::IoError));
        assert!(matches!(err, Error::Engine { .. }));

        // the rollback succeeded, so the whole batch is gone
        assert_eq!(db.uncommitted_changes(), 0);
        assert_eq!(db.get_object::<i32>("a").unwrap(), Some(1));
        assert_eq!(db.get_object::<i32>("b").unwrap(), Some(2));
        assert_eq!(db.get_object::<i32>("c").unwrap(), None);

        let snapshot = dir.path().join("crash.db");
        std::fs::copy(&path, &snapshot).unwrap();
        let other = Registry::new();
        let recovered = other.open(snapshot.to_str().unwrap()).unwrap();
        assert_eq!(recovered.get_object::<i32>("a").unwrap(), Some(1));
        assert_eq!(recovered.get_object::<i32>("b").unwrap(), Some(2));
        assert_eq!(recovered.get_object::<i32>("c").unwrap(), None);
    }

    #[test]
    fn test_marshal_failure_changes_nothing() {
        let registry = Registry::new();
        let db = registry.open(MEMORY_DB).unwrap();
        db.set_commit_threshold(10);
        db.set_object("ok", &1).unwrap();
        db.set_marshal(|_| Err("refusing".into()));

        let err = db.set_object("bad", &2).unwrap_err();
        assert!(matches!(err, Error::Marshal { ref key, .. } if key == "bad"));
        assert_eq!(db.uncommitted_changes(), 1);
        assert!(db.fetch(b"bad").unwrap_err().is_not_found());

        db.reset_codec();
        db.set_object("bad", &2).unwrap();
        assert_eq!(db.get_object::<i32>("bad").unwrap(), Some(2));
    }

    #[test]
    fn test_unmarshal_failure() {
        let registry = Registry::new();
        let db = registry.open(MEMORY_DB).unwrap();
        db.store(b"raw", b"not json").unwrap();
        let err = db.get_object::<Point>("raw").unwrap_err();
        assert!(matches!(err, Error::Unmarshal { ref key, .. } if key == "raw"));

        db.set_object("num", &5).unwrap();
        assert!(matches!(db.get_object::<Point>("num"), Err(Error::Unmarshal { .. })));
    }

    #[test]
    fn test_custom_codec() {
        let registry = Registry::new();
        let db = registry.open(MEMORY_DB).unwrap();
        db.set_marshal(|v| Ok(v.to_string().into_bytes().into_iter().rev().collect()));
        db.set_unmarshal(|b| {
            let text: Vec<u8> = b.iter().rev().copied().collect();
            serde_json::from_slice(&text).map_err(BoxError::from)
        });

        db.set_object("k", &vec![1, 2, 3]).unwrap();
        assert_eq!(db.fetch(b"k").unwrap(), b"]3,2,1[");
        assert_eq!(db.get_object::<Vec<i32>>("k").unwrap(), Some(vec![1, 2, 3]));

        let marshal = db.marshal();
        assert_eq!(marshal(&Value::Bool(true)).unwrap(), b"eurt");
        let unmarshal = db.unmarshal();
        assert_eq!(unmarshal(b"eslaf").unwrap(), Value::Bool(false));
    }
}
