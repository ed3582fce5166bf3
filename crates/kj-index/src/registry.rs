use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::artifact::{artifact_path, is_artifact_file};
use crate::{IndexBuilder, IndexError, IndexSpec, KeyIndex};

/// Built indexes for one orchestrating caller, keyed by artifact path.
///
/// Requesting the same source twice returns the cached index. Builds that
/// target the same artifact are serialized by a per-artifact lock.
#[derive(Debug, Default)]
pub struct IndexRegistry {
    entries: Mutex<HashMap<PathBuf, Arc<KeyIndex>>>,
    build_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl IndexRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_build(
        &self,
        builder: &IndexBuilder<'_>,
        spec: &IndexSpec,
    ) -> Result<Arc<KeyIndex>, IndexError> {
        let key = artifact_path(&builder.policy().artifact_dir, &spec.path);
        let lock = self.build_lock(&key)?;
        let _guard = lock.lock().map_err(|_| IndexError::LockPoisoned)?;

        if let Some(cached) = self.cached(&key)? {
            if cached.serves(spec, builder.policy().projection_mode) {
                #[cfg(feature = "tracing")]
                tracing::debug!(source = %spec.label, "index registry hit");
                return Ok(cached);
            }
        }

        let index = Arc::new(builder.build(spec)?);
        self.entries
            .lock()
            .map_err(|_| IndexError::LockPoisoned)?
            .insert(key, Arc::clone(&index));
        Ok(index)
    }

    /// Drops the cached index for `source`; the next request rebuilds it.
    pub fn invalidate(&self, artifact_dir: &Path, source: &Path) -> Result<bool, IndexError> {
        let key = artifact_path(artifact_dir, source);
        let removed = self
            .entries
            .lock()
            .map_err(|_| IndexError::LockPoisoned)?
            .remove(&key)
            .is_some();
        Ok(removed)
    }

    pub fn len(&self) -> Result<usize, IndexError> {
        Ok(self
            .entries
            .lock()
            .map_err(|_| IndexError::LockPoisoned)?
            .len())
    }

    pub fn is_empty(&self) -> Result<bool, IndexError> {
        self.len().map(|len| len == 0)
    }

    /// Deletes every index artifact in `dir` and clears the registry.
    /// Returns the number of files removed.
    pub fn purge_artifacts(&self, dir: &Path) -> Result<usize, IndexError> {
        self.entries
            .lock()
            .map_err(|_| IndexError::LockPoisoned)?
            .clear();

        let read = match fs::read_dir(dir) {
            Ok(read) => read,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(source) => {
                return Err(IndexError::Io {
                    path: dir.to_path_buf(),
                    source,
                });
            }
        };

        let mut removed = 0;
        for entry in read.filter_map(Result::ok) {
            let path = entry.path();
            if path.is_file() && is_artifact_file(&path) {
                fs::remove_file(&path).map_err(|source| IndexError::Io {
                    path: path.clone(),
                    source,
                })?;
                removed += 1;
            }
        }
        #[cfg(feature = "tracing")]
        tracing::info!(dir = %dir.display(), removed, "purged index artifacts");
        Ok(removed)
    }

    fn cached(&self, key: &Path) -> Result<Option<Arc<KeyIndex>>, IndexError> {
        Ok(self
            .entries
            .lock()
            .map_err(|_| IndexError::LockPoisoned)?
            .get(key)
            .cloned())
    }

    fn build_lock(&self, key: &Path) -> Result<Arc<Mutex<()>>, IndexError> {
        let mut locks = self
            .build_locks
            .lock()
            .map_err(|_| IndexError::LockPoisoned)?;
        Ok(Arc::clone(locks.entry(key.to_path_buf()).or_default()))
    }
}
