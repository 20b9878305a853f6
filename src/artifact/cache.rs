//! In-memory cache of artifact file contents.
//!
//! Gate steps and the `merge` skill read artifacts that were just validated;
//! the cache saves a second read. It is dropped wholesale under memory
//! pressure.

use crate::pressure::Purgeable;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
pub struct ContentCache {
    entries: Mutex<HashMap<PathBuf, Arc<str>>>,
}

impl ContentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &Path) -> Option<Arc<str>> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .cloned()
    }

    pub fn insert(&self, path: &Path, content: Arc<str>) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_path_buf(), content);
    }

    /// Read through the cache.
    pub fn read(&self, path: &Path) -> std::io::Result<Arc<str>> {
        if let Some(hit) = self.get(path) {
            return Ok(hit);
        }
        let content: Arc<str> = std::fs::read_to_string(path)?.into();
        self.insert(path, content.clone());
        Ok(content)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Purgeable for ContentCache {
    fn name(&self) -> &str {
        "artifact-content"
    }

    fn purge(&self) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let dropped = entries.len();
        entries.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_through_and_purge() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.md");
        std::fs::write(&path, "v1").unwrap();

        let cache = ContentCache::new();
        assert_eq!(&*cache.read(&path).unwrap(), "v1");

        // Served from memory until purged.
        std::fs::write(&path, "v2").unwrap();
        assert_eq!(&*cache.read(&path).unwrap(), "v1");

        assert_eq!(cache.purge(), 1);
        assert!(cache.is_empty());
        assert_eq!(&*cache.read(&path).unwrap(), "v2");
    }

    #[test]
    fn test_missing_file_is_not_cached() {
        let cache = ContentCache::new();
        assert!(cache.read(Path::new("/nonexistent/file")).is_err());
        assert!(cache.is_empty());
    }
}
