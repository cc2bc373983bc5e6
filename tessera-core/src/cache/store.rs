//! Content Cache
//!
//! Stores node outputs by validity hash. Besides the entries themselves the
//! cache maintains a dependency index (node id → hashes of entries that
//! recorded that node in `depends_on`) so invalidating one node touches only
//! the entries that actually depend on it.
//!
//! # Eviction
//!
//! Entries leave the cache in four ways:
//!
//! 1. LRU: when an insert pushes the size over capacity, the entry with the
//!    oldest access is evicted.
//! 2. Invalidation: [`ContentCache::invalidate`] drops every dependent entry.
//! 3. Staleness: a hit whose recorded input hashes disagree with the
//!    caller's current ones is dropped and reported as a miss.
//! 4. Age: [`ContentCache::prune`] sweeps entries older than a threshold.
//!
//! A missing entry is never an error; lookups report a miss and the caller
//! recomputes.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::key::{build_key, CacheKey, KeyMaterial};
use crate::graph::NodeId;
use crate::value::{ContentHash, ValueMap};

/// One cached node result.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub validity_hash: ContentHash,

    /// Shared output; entries created by [`ContentCache::fork`] own a
    /// separate map.
    pub output: Arc<ValueMap>,

    pub input_hashes: IndexMap<String, ContentHash>,

    pub depends_on: BTreeSet<NodeId>,

    /// When the entry was inserted.
    pub created_at: Instant,

    /// Logical access clock. Strictly increasing across the cache, so the
    /// LRU victim is unambiguous even when two accesses share an `Instant`.
    pub last_access: u64,

    pub access_count: u64,
}

/// Counters describing cache behaviour since creation or the last reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub stale: u64,
}

impl CacheStats {
    /// Fraction of lookups that hit, `0.0` before the first lookup.
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<ContentHash, CacheEntry>,
    index: HashMap<NodeId, HashSet<ContentHash>>,
    versions: HashMap<NodeId, u64>,
    clock: u64,
    forks: u64,
    stats: CacheStats,
}

impl CacheInner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn insert(&mut self, entry: CacheEntry) {
        let hash = entry.validity_hash;
        self.remove(&hash);

        for node_id in &entry.depends_on {
            self.index.entry(*node_id).or_default().insert(hash);
        }
        self.entries.insert(hash, entry);
        self.stats.insertions += 1;
    }

    fn remove(&mut self, hash: &ContentHash) -> Option<CacheEntry> {
        let entry = self.entries.remove(hash)?;
        for node_id in &entry.depends_on {
            if let Some(hashes) = self.index.get_mut(node_id) {
                hashes.remove(hash);
                if hashes.is_empty() {
                    self.index.remove(node_id);
                }
            }
        }
        Some(entry)
    }

    fn evict_to(&mut self, capacity: usize) {
        while self.entries.len() > capacity {
            let Some(victim) = self
                .entries
                .values()
                .min_by_key(|entry| entry.last_access)
                .map(|entry| entry.validity_hash)
            else {
                break;
            };
            self.remove(&victim);
            self.stats.evictions += 1;
            debug!(hash = %victim.short(), "evicted least recently used cache entry");
        }
    }

    fn touch(&mut self, hash: &ContentHash) -> Option<Arc<ValueMap>> {
        let now = self.tick();
        let entry = self.entries.get_mut(hash)?;
        entry.last_access = now;
        entry.access_count += 1;
        Some(Arc::clone(&entry.output))
    }
}

/// Content-addressed store of node outputs.
///
/// Interior mutability keeps the API `&self` so the cache can be shared
/// between a scheduler and the cook-on-demand layer behind one `Arc`.
#[derive(Debug)]
pub struct ContentCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

impl ContentCache {
    /// Create a cache holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Derive the key for a node in its current state.
    pub fn compute_key(&self, material: KeyMaterial<'_>) -> CacheKey {
        let version = self.version(material.node_id);
        build_key(material, version)
    }

    /// Logical version of a node, bumped by every invalidation.
    pub fn version(&self, node_id: NodeId) -> u64 {
        self.inner
            .lock()
            .versions
            .get(&node_id)
            .copied()
            .unwrap_or_default()
    }

    /// Look up the output stored under `key`.
    ///
    /// A hit whose recorded input hashes differ from `key.input_hashes` is
    /// treated as stale: it is evicted and reported as a miss.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<ValueMap>> {
        let mut inner = self.inner.lock();

        let Some(consistent) = inner
            .entries
            .get(&key.validity_hash)
            .map(|entry| entry.input_hashes == key.input_hashes)
        else {
            inner.stats.misses += 1;
            trace!(hash = %key.validity_hash.short(), "cache miss");
            return None;
        };

        if !consistent {
            inner.remove(&key.validity_hash);
            inner.stats.stale += 1;
            inner.stats.misses += 1;
            debug!(hash = %key.validity_hash.short(), "evicted stale cache entry");
            return None;
        }

        inner.stats.hits += 1;
        trace!(hash = %key.validity_hash.short(), "cache hit");
        inner.touch(&key.validity_hash)
    }

    /// Look up an entry by hash alone, without input revalidation. This is
    /// the only way to reach entries created by [`fork`](Self::fork).
    pub fn get_by_hash(&self, hash: &ContentHash) -> Option<Arc<ValueMap>> {
        let mut inner = self.inner.lock();
        match inner.touch(hash) {
            Some(output) => {
                inner.stats.hits += 1;
                Some(output)
            }
            None => {
                inner.stats.misses += 1;
                None
            }
        }
    }

    /// Store `output` under `key`, replacing any previous entry with the
    /// same hash, then evict down to capacity.
    pub fn put(&self, key: &CacheKey, output: impl Into<Arc<ValueMap>>) -> Arc<ValueMap> {
        let output = output.into();
        let mut inner = self.inner.lock();
        let now = inner.tick();

        inner.insert(CacheEntry {
            validity_hash: key.validity_hash,
            output: Arc::clone(&output),
            input_hashes: key.input_hashes.clone(),
            depends_on: key.depends_on.clone(),
            created_at: Instant::now(),
            last_access: now,
            access_count: 0,
        });
        inner.evict_to(self.capacity);

        output
    }

    /// Bump the node's version and evict every entry that recorded it as a
    /// dependency. Returns the number of entries removed.
    pub fn invalidate(&self, node_id: NodeId) -> usize {
        let mut inner = self.inner.lock();
        *inner.versions.entry(node_id).or_default() += 1;

        let hashes = inner.index.remove(&node_id).unwrap_or_default();
        let mut removed = 0;
        for hash in hashes {
            if inner.remove(&hash).is_some() {
                removed += 1;
            }
        }

        inner.stats.invalidations += removed as u64;
        if removed > 0 {
            debug!(node = %node_id, removed, "invalidated cache entries");
        }
        removed
    }

    /// Insert a copy-on-write sibling of `original` holding `mutated`.
    ///
    /// The new entry inherits the original's input hashes and dependencies
    /// (so invalidation still reaches it) but its hash is derived from the
    /// original hash and a fork counter, not from content. Recomputing the
    /// same inputs therefore never lands on it; only the returned hash does.
    /// Returns `None` when the original is not cached.
    pub fn fork(&self, original: &ContentHash, mutated: ValueMap) -> Option<ContentHash> {
        let mut inner = self.inner.lock();
        let source = inner.entries.get(original)?.clone();

        inner.forks += 1;
        let hash = ContentHash::builder("fork")
            .hash(*original)
            .u64(inner.forks)
            .finish();
        let now = inner.tick();

        inner.insert(CacheEntry {
            validity_hash: hash,
            output: Arc::new(mutated),
            input_hashes: source.input_hashes,
            depends_on: source.depends_on,
            created_at: Instant::now(),
            last_access: now,
            access_count: 0,
        });
        inner.evict_to(self.capacity);

        Some(hash)
    }

    /// Remove every entry older than `max_age`, regardless of access order.
    pub fn prune(&self, max_age: Duration) -> usize {
        let mut inner = self.inner.lock();
        let expired: Vec<ContentHash> = inner
            .entries
            .values()
            .filter(|entry| entry.created_at.elapsed() > max_age)
            .map(|entry| entry.validity_hash)
            .collect();

        for hash in &expired {
            inner.remove(hash);
        }
        inner.stats.evictions += expired.len() as u64;

        if !expired.is_empty() {
            debug!(removed = expired.len(), ?max_age, "pruned aged cache entries");
        }
        expired.len()
    }

    /// Drop every entry. Versions are kept so previously invalidated nodes
    /// stay invalidated.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.index.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.inner.lock().entries.contains_key(hash)
    }

    /// Snapshot of an entry's metadata, without touching its access time.
    pub fn entry(&self, hash: &ContentHash) -> Option<CacheEntry> {
        self.inner.lock().entries.get(hash).cloned()
    }

    /// Number of entries that recorded `node_id` as a dependency.
    pub fn dependents_of(&self, node_id: NodeId) -> usize {
        self.inner
            .lock()
            .index
            .get(&node_id)
            .map_or(0, HashSet::len)
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats
    }

    pub fn reset_stats(&self) {
        self.inner.lock().stats = CacheStats::default();
    }
}

impl Default for ContentCache {
    fn default() -> Self {
        Self::new(256)
    }
}
