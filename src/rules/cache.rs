//! Bounded in-process cache of rules per dataset.
//!
//! The cache is owned by the [`RuleRepository`](super::RuleRepository) and
//! passed around by reference; there is no module-level cache. Entries
//! expire after a TTL and the least recently used entry is evicted when the
//! cache is full. Writes to a dataset's rules invalidate its entries.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use tracing::debug;

use super::model::BusinessRule;
use crate::dataset::DatasetId;

/// Configuration for [`RuleCache`].
#[derive(Debug, Clone)]
pub struct RuleCacheConfig {
    /// Maximum number of cached listings.
    pub capacity: usize,
    /// Entries older than this are treated as missing.
    pub ttl: Duration,
}

impl Default for RuleCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            ttl: Duration::from_secs(300),
        }
    }
}

impl RuleCacheConfig {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self { capacity, ttl }
    }
}

/// Hit/miss counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
}

impl RuleCacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Cache key: a dataset plus whether the listing is filtered to active rules.
type CacheKey = (DatasetId, bool);

#[derive(Debug)]
struct CacheEntry {
    rules: Vec<BusinessRule>,
    created_at: Instant,
    last_accessed: Instant,
}

/// Capacity- and TTL-bounded cache of rule listings keyed by dataset.
#[derive(Debug)]
pub struct RuleCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    /// Bumped by every invalidation; always locked after `entries`.
    generations: RwLock<HashMap<DatasetId, u64>>,
    stats: RwLock<RuleCacheStats>,
    config: RuleCacheConfig,
}

impl Default for RuleCache {
    fn default() -> Self {
        Self::new(RuleCacheConfig::default())
    }
}

impl RuleCache {
    pub fn new(config: RuleCacheConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            generations: RwLock::new(HashMap::new()),
            stats: RwLock::new(RuleCacheStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &RuleCacheConfig {
        &self.config
    }

    /// Returns the cached listing if present and fresh.
    pub fn get(&self, dataset_id: DatasetId, active_only: bool) -> Option<Vec<BusinessRule>> {
        let key = (dataset_id, active_only);
        let mut entries = self.write_entries();
        let hit = match entries.get_mut(&key) {
            Some(entry) if entry.created_at.elapsed() < self.config.ttl => {
                entry.last_accessed = Instant::now();
                Some(entry.rules.clone())
            }
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        };
        drop(entries);

        let mut stats = self.write_stats();
        if hit.is_some() {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }
        hit
    }

    /// Invalidation counter for a dataset. Read it before loading a listing
    /// and hand it to [`put_if_current`](Self::put_if_current).
    pub fn generation(&self, dataset_id: DatasetId) -> u64 {
        self.generations
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&dataset_id)
            .copied()
            .unwrap_or(0)
    }

    /// Stores a listing, evicting the least recently used entry when full.
    pub fn put(&self, dataset_id: DatasetId, active_only: bool, rules: Vec<BusinessRule>) {
        let mut entries = self.write_entries();
        self.insert_entry(&mut entries, (dataset_id, active_only), rules);
    }

    /// Stores a listing only if the dataset has not been invalidated since
    /// `generation` was read. Returns whether it was stored.
    pub fn put_if_current(
        &self,
        dataset_id: DatasetId,
        active_only: bool,
        generation: u64,
        rules: Vec<BusinessRule>,
    ) -> bool {
        let mut entries = self.write_entries();
        if self.generation(dataset_id) != generation {
            debug!(dataset_id, "Discarding listing loaded before an invalidation");
            return false;
        }
        self.insert_entry(&mut entries, (dataset_id, active_only), rules);
        true
    }

    fn insert_entry(
        &self,
        entries: &mut HashMap<CacheKey, CacheEntry>,
        key: CacheKey,
        rules: Vec<BusinessRule>,
    ) {
        if self.config.capacity == 0 {
            return;
        }
        if !entries.contains_key(&key) && entries.len() >= self.config.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.last_accessed)
                .map(|(k, _)| *k);
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
                self.write_stats().evictions += 1;
            }
        }
        let now = Instant::now();
        entries.insert(
            key,
            CacheEntry {
                rules,
                created_at: now,
                last_accessed: now,
            },
        );
    }

    /// Drops every listing for a dataset.
    pub fn invalidate(&self, dataset_id: DatasetId) {
        let mut entries = self.write_entries();
        *self
            .generations
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(dataset_id)
            .or_insert(0) += 1;
        let before = entries.len();
        entries.retain(|(id, _), _| *id != dataset_id);
        let removed = before - entries.len();
        drop(entries);
        if removed > 0 {
            debug!(dataset_id, removed, "Invalidated cached rules");
        }
        self.write_stats().invalidations += 1;
    }

    pub fn clear(&self) {
        self.write_entries().clear();
    }

    pub fn len(&self) -> usize {
        self.read_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> RuleCacheStats {
        self.stats
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn read_entries(&self) -> RwLockReadGuard<'_, HashMap<CacheKey, CacheEntry>> {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_entries(&self) -> RwLockWriteGuard<'_, HashMap<CacheKey, CacheEntry>> {
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_stats(&self) -> RwLockWriteGuard<'_, RuleCacheStats> {
        self.stats
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
