use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Errors raised while loading or flushing a [`DiskMap`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error on {path}: {source}")]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// A string-keyed map mirrored to a JSON file.
///
/// Reads take the shared lock. Every mutation takes the exclusive lock,
/// rewrites the file, and only then releases the lock. If the flush fails
/// the in-memory change is rolled back and the error returned, so memory
/// and disk never disagree about a mutation the caller saw succeed.
#[derive(Debug)]
pub struct DiskMap<V> {
    path: PathBuf,
    map: RwLock<HashMap<String, V>>,
}

impl<V> DiskMap<V>
where
    V: Serialize + DeserializeOwned + Clone,
{
    /// Open (or create) the map backed by `path`.
    ///
    /// The parent directory is created if missing. Existing contents are
    /// read fully into memory and immediately written back, which both
    /// validates the file and normalises its formatting.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let map = read_file(&path)?;
        tracing::debug!(path = %path.display(), records = map.len(), "Loaded disk map");

        let store = Self {
            path,
            map: RwLock::new(map),
        };
        store.write_back(&store.read())?;
        Ok(store)
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Insert `value` and flush. Returns the previous value, if any.
    pub fn put(&self, key: impl Into<String>, value: V) -> Result<Option<V>, StoreError> {
        let key = key.into();
        let mut map = self.write();
        let previous = map.insert(key.clone(), value);
        if let Err(e) = self.write_back(&map) {
            match previous {
                Some(old) => map.insert(key, old),
                None => map.remove(&key),
            };
            return Err(e);
        }
        Ok(previous)
    }

    /// Remove `key` and flush. Absent keys are a no-op that does not touch
    /// the file.
    pub fn remove(&self, key: &str) -> Result<Option<V>, StoreError> {
        let mut map = self.write();
        let Some(previous) = map.remove(key) else {
            return Ok(None);
        };
        if let Err(e) = self.write_back(&map) {
            map.insert(key.to_string(), previous);
            return Err(e);
        }
        Ok(Some(previous))
    }

    /// Run `f` against the map under the writer lock.
    ///
    /// The file is rewritten only when `f` returns `true`. On flush failure
    /// the map is restored to its state before `f` ran.
    pub fn update<F>(&self, f: F) -> Result<bool, StoreError>
    where
        F: FnOnce(&mut HashMap<String, V>) -> bool,
    {
        let mut map = self.write();
        let before = map.clone();
        if !f(&mut map) {
            return Ok(false);
        }
        if let Err(e) = self.write_back(&map) {
            *map = before;
            return Err(e);
        }
        Ok(true)
    }

    /// A point-in-time copy of the whole map.
    pub fn snapshot(&self) -> HashMap<String, V> {
        self.read().clone()
    }

    // ---- private helpers ----

    // A poisoned lock still guards a structurally valid map; every mutation
    // either completed its flush or was rolled back before unwinding.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, V>> {
        self.map.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, V>> {
        self.map.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Serialize `map` to a sibling temp file, fsync it, then rename over
    /// the real file. Caller must hold a lock on `self.map`.
    fn write_back(&self, map: &HashMap<String, V>) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(map).map_err(|source| StoreError::Serialization {
            path: self.path.clone(),
            source,
        })?;

        let tmp = self.path.with_extension("tmp");
        let io_err = |source| StoreError::Io {
            path: tmp.clone(),
            source,
        };
        let mut file = File::create(&tmp).map_err(io_err)?;
        file.write_all(&bytes).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        drop(file);

        fs::rename(&tmp, &self.path).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

fn read_file<V: DeserializeOwned>(path: &Path) -> Result<HashMap<String, V>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(HashMap::new());
    }
    serde_json::from_slice(&bytes).map_err(|source| StoreError::Serialization {
        path: path.to_path_buf(),
        source,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
