//! Cache Registry Module
//!
//! Maps resolved base paths to live cache handles so one process reuses
//! a single engine per database file. The registry is a plain object
//! owned by the embedding application, not a process-wide global.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::cache::CacheEngine;
use crate::config::CacheConfig;

// == Cache Registry ==
/// Create-or-reuse registry of cache handles keyed by resolved path.
#[derive(Default)]
pub struct CacheRegistry {
    caches: Mutex<HashMap<PathBuf, Arc<CacheEngine>>>,
}

impl CacheRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    // == Get Or Create ==
    /// Returns the live handle for `base_path`, creating one on first
    /// use. Two calls with paths resolving to the same location return
    /// the same handle; `config` only applies when the handle is created
    /// here.
    pub fn get_or_create(
        &self,
        base_path: &Path,
        config: Option<CacheConfig>,
    ) -> Arc<CacheEngine> {
        let resolved = resolve_path(base_path);
        let mut caches = self.caches.lock().unwrap();

        if let Some(existing) = caches.get(&resolved) {
            return Arc::clone(existing);
        }

        debug!("creating cache handle for {}", resolved.display());
        let engine = Arc::new(CacheEngine::new(&resolved, config));
        caches.insert(resolved, Arc::clone(&engine));
        engine
    }

    // == Dispose ==
    /// Evicts the handle for `base_path` and shuts its pool down.
    /// Returns whether a handle existed. The next `get_or_create` for
    /// the same path builds a fresh instance.
    pub fn dispose(&self, base_path: &Path) -> bool {
        let resolved = resolve_path(base_path);
        let removed = self.caches.lock().unwrap().remove(&resolved);

        match removed {
            Some(engine) => {
                engine.shutdown();
                true
            }
            None => false,
        }
    }
}

/// Canonicalizes the directory part of `path` so spellings of the same
/// location share one handle. The file itself may not exist yet, so only
/// the parent is resolved.
fn resolve_path(path: &Path) -> PathBuf {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .and_then(|p| p.canonicalize().ok());

    match (parent, path.file_name()) {
        (Some(parent), Some(name)) => parent.join(name),
        _ => path.to_path_buf(),
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_path_returns_same_handle() {
        let dir = tempfile::tempdir().unwrap();
        let registry = CacheRegistry::new();
        let base = dir.path().join("instance");

        let first = registry.get_or_create(&base, None);
        let second = registry.get_or_create(&base, None);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_path_spellings_resolve_to_one_handle() {
        let dir = tempfile::tempdir().unwrap();
        let registry = CacheRegistry::new();

        let plain = dir.path().join("instance");
        let dotted = dir.path().join(".").join("instance");

        let first = registry.get_or_create(&plain, None);
        let second = registry.get_or_create(&dotted, None);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_dispose_evicts_handle() {
        let dir = tempfile::tempdir().unwrap();
        let registry = CacheRegistry::new();
        let base = dir.path().join("instance");

        let first = registry.get_or_create(&base, None);
        assert!(registry.dispose(&base));
        assert!(!registry.dispose(&base));

        let fresh = registry.get_or_create(&base, None);
        assert!(!Arc::ptr_eq(&first, &fresh));
    }
}
