//! Candidate-list cache owned by the reconciler.
//!
//! Entries live for `ttl_secs` at most. Any match creation or unlink
//! invalidates everything, since a claim changes which items are eligible
//! in every cached list. A generation counter keeps a list ranked before an
//! invalidation from being stored after it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;

use crate::config::CacheConfig;
use crate::model::MatchCandidate;

pub struct CandidateCache {
    cache: Option<Cache<String, Arc<Vec<MatchCandidate>>>>,
    generation: AtomicU64,
}

impl CandidateCache {
    pub fn new(config: &CacheConfig) -> Self {
        let cache = config.enabled.then(|| {
            Cache::builder()
                .max_capacity(config.max_entries)
                .time_to_live(Duration::from_secs(config.ttl_secs))
                .build()
        });
        Self {
            cache,
            generation: AtomicU64::new(0),
        }
    }

    fn key(item_id: &str, pool_source: &str) -> String {
        format!("{item_id}\u{1f}{pool_source}")
    }

    /// Read before loading the pool; pass to `insert` with the result.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn get(&self, item_id: &str, pool_source: &str) -> Option<Arc<Vec<MatchCandidate>>> {
        self.cache.as_ref()?.get(&Self::key(item_id, pool_source))
    }

    /// Store a list ranked at `generation`. Returns false, storing nothing,
    /// when an invalidation happened since.
    pub fn insert(
        &self,
        item_id: &str,
        pool_source: &str,
        generation: u64,
        candidates: Arc<Vec<MatchCandidate>>,
    ) -> bool {
        let Some(cache) = &self.cache else {
            return false;
        };
        if self.generation() != generation {
            return false;
        }
        let key = Self::key(item_id, pool_source);
        cache.insert(key.clone(), candidates);
        // An invalidation may land between the check and the insert
        if self.generation() != generation {
            cache.invalidate(&key);
            return false;
        }
        true
    }

    pub fn invalidate(&self, item_id: &str, pool_source: &str) {
        if let Some(cache) = &self.cache {
            cache.invalidate(&Self::key(item_id, pool_source));
        }
    }

    /// Drop every entry. Called after each create / unlink.
    pub fn invalidate_all(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(cache) = &self.cache {
            cache.invalidate_all();
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.cache.is_some()
    }
}
