//! Content-addressed on-disk artifact store.
//!
//! Artifacts are JSON files at `root/<kind>/<hash>.json`. Publication writes a
//! temp file next to the target and renames it into place, so readers either
//! see a complete artifact or none. Writers of the same key within a process
//! are serialized by a per-path lock; the first writer computes, later ones
//! find the published file.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::hash::ContentHash;

/// Artifact families, one directory each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Settings,
    Circuit,
    Witness,
    ProvingKey,
    VerifyingKey,
}

impl ArtifactKind {
    pub fn dir_name(&self) -> &'static str {
        match self {
            ArtifactKind::Settings => "settings",
            ArtifactKind::Circuit => "circuit",
            ArtifactKind::Witness => "witness",
            ArtifactKind::ProvingKey => "pk",
            ArtifactKind::VerifyingKey => "vk",
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt {kind} artifact {path}: {source}")]
    Corrupt {
        kind: ArtifactKind,
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode {kind} artifact: {source}")]
    Encode {
        kind: ArtifactKind,
        #[source]
        source: serde_json::Error,
    },
}

/// Process-wide per-path write locks, shared by every store instance.
fn path_lock(path: &Path) -> Arc<Mutex<()>> {
    static LOCKS: OnceLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();
    let mut locks = LOCKS
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    Arc::clone(locks.entry(path.to_path_buf()).or_default())
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// JSON artifacts addressed by `(kind, content hash)`.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, kind: ArtifactKind, key: &ContentHash) -> PathBuf {
        self.root
            .join(kind.dir_name())
            .join(format!("{}.json", key.to_hex()))
    }

    pub fn contains(&self, kind: ArtifactKind, key: &ContentHash) -> bool {
        self.path(kind, key).is_file()
    }

    /// Read an artifact, `None` when absent.
    pub fn get<T: DeserializeOwned>(
        &self,
        kind: ArtifactKind,
        key: &ContentHash,
    ) -> Result<Option<T>, CacheError> {
        let path = self.path(kind, key);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CacheError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| CacheError::Corrupt {
                kind,
                path: path.display().to_string(),
                source,
            })
    }

    /// Publish an artifact atomically.
    pub fn put<T: Serialize>(
        &self,
        kind: ArtifactKind,
        key: &ContentHash,
        value: &T,
    ) -> Result<(), CacheError> {
        let path = self.path(kind, key);
        let lock = path_lock(&path);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.write_atomic(kind, &path, value)
    }

    fn write_atomic<T: Serialize>(
        &self,
        kind: ArtifactKind,
        path: &Path,
        value: &T,
    ) -> Result<(), CacheError> {
        let io_err = |source| CacheError::Io {
            path: path.display().to_string(),
            source,
        };
        let encoded =
            serde_json::to_vec(value).map_err(|source| CacheError::Encode { kind, source })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp = path.with_extension(format!(
            "tmp.{}.{}",
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        {
            let mut file = std::fs::File::create(&tmp).map_err(io_err)?;
            file.write_all(&encoded).map_err(io_err)?;
            file.sync_all().map_err(io_err)?;
        }
        std::fs::rename(&tmp, path).map_err(io_err)?;
        debug!(kind = %kind, path = %path.display(), bytes = encoded.len(), "published artifact");
        Ok(())
    }

    /// Return the stored artifact, or compute, publish and return it.
    ///
    /// The flag is `true` on a cache hit. When `compute` fails nothing is
    /// written.
    pub fn get_or_insert_with<T, E, F>(
        &self,
        kind: ArtifactKind,
        key: &ContentHash,
        compute: F,
    ) -> Result<(T, bool), E>
    where
        T: Serialize + DeserializeOwned,
        E: From<CacheError>,
        F: FnOnce() -> Result<T, E>,
    {
        let path = self.path(kind, key);
        let lock = path_lock(&path);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(hit) = self.get(kind, key)? {
            debug!(kind = %kind, key = %key.short(), "cache hit");
            return Ok((hit, true));
        }
        let value = compute()?;
        self.write_atomic(kind, &path, &value)?;
        Ok((value, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_json;
    use std::sync::atomic::AtomicUsize;

    fn temp_store(tag: &str) -> ArtifactStore {
        let dir =
            std::env::temp_dir().join(format!("zkinfer-cache-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        ArtifactStore::new(dir)
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Blob {
        n: u32,
        s: String,
    }

    #[test]
    fn test_put_get() {
        let store = temp_store("putget");
        let key = hash_json("test", &1u32).unwrap();
        assert!(!store.contains(ArtifactKind::Settings, &key));
        assert_eq!(store.get::<Blob>(ArtifactKind::Settings, &key).unwrap(), None);

        let blob = Blob {
            n: 7,
            s: "x".into(),
        };
        store.put(ArtifactKind::Settings, &key, &blob).unwrap();
        assert!(store.contains(ArtifactKind::Settings, &key));
        assert!(!store.contains(ArtifactKind::Circuit, &key));
        assert_eq!(
            store.get::<Blob>(ArtifactKind::Settings, &key).unwrap(),
            Some(blob)
        );
        std::fs::remove_dir_all(store.root()).ok();
    }

    #[test]
    fn test_get_or_insert_hit_and_miss() {
        let store = temp_store("getor");
        let key = hash_json("test", &2u32).unwrap();
        let calls = AtomicUsize::new(0);
        let compute = || -> Result<Blob, CacheError> {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Blob {
                n: 1,
                s: "a".into(),
            })
        };
        let (_, hit) = store
            .get_or_insert_with(ArtifactKind::Circuit, &key, compute)
            .unwrap();
        assert!(!hit);
        let (value, hit) = store
            .get_or_insert_with(ArtifactKind::Circuit, &key, compute)
            .unwrap();
        assert!(hit);
        assert_eq!(value.n, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        std::fs::remove_dir_all(store.root()).ok();
    }

    #[test]
    fn test_failed_compute_publishes_nothing() {
        #[derive(Debug)]
        struct Failed;
        impl From<CacheError> for Failed {
            fn from(_: CacheError) -> Self {
                Failed
            }
        }

        let store = temp_store("fail");
        let key = hash_json("test", &3u32).unwrap();
        let result: Result<(Blob, bool), Failed> =
            store.get_or_insert_with(ArtifactKind::Witness, &key, || Err(Failed));
        assert!(result.is_err());
        assert!(!store.contains(ArtifactKind::Witness, &key));
    }

    #[test]
    fn test_corrupt_artifact() {
        let store = temp_store("corrupt");
        let key = hash_json("test", &4u32).unwrap();
        let path = store.path(ArtifactKind::VerifyingKey, &key);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(
            store.get::<Blob>(ArtifactKind::VerifyingKey, &key),
            Err(CacheError::Corrupt { .. })
        ));
        std::fs::remove_dir_all(store.root()).ok();
    }

    #[test]
    fn test_concurrent_writers_compute_once() {
        let store = temp_store("concurrent");
        let key = hash_json("test", &5u32).unwrap();
        let calls = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    let (blob, _) = store
                        .get_or_insert_with(ArtifactKind::ProvingKey, &key, || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok::<_, CacheError>(Blob {
                                n: 9,
                                s: "k".into(),
                            })
                        })
                        .unwrap();
                    assert_eq!(blob.n, 9);
                });
            }
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        std::fs::remove_dir_all(store.root()).ok();
    }
}
