//! Rating cache keyed by plan content hash and rubric id.
//!
//! Entries never expire on time. A changed plan hashes differently and
//! misses; the whole cache is dropped under memory pressure.

use super::ProviderResult;
use crate::pressure::Purgeable;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub content_hash: String,
    pub rubric_id: String,
}

impl CacheKey {
    pub fn new(content: &str, rubric_id: &str) -> Self {
        Self {
            content_hash: crate::util::sha256_hex(content.as_bytes()),
            rubric_id: rubric_id.to_string(),
        }
    }
}

/// What is kept per key: the provider answers and their aggregate. Pass/fail
/// is recomputed on every hit, since the threshold may differ.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedRating {
    pub provider_results: BTreeMap<String, ProviderResult>,
    pub overall_score: f64,
}

#[derive(Debug, Default)]
pub struct RatingCache {
    entries: Mutex<HashMap<CacheKey, CachedRating>>,
}

impl RatingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CacheKey) -> Option<CachedRating> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    pub fn insert(&self, key: CacheKey, rating: CachedRating) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, rating);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Purgeable for RatingCache {
    fn name(&self) -> &str {
        "rating"
    }

    fn purge(&self) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let dropped = entries.len();
        entries.clear();
        dropped
    }
}
