//! Read-through query cache with tag-based invalidation.
//!
//! Keys are SHA-256 digests of (operation, tenant scope, canonical JSON
//! arguments). Every entry lists the tags it depends on; a write invalidates
//! the tags of the ids it touched plus the tenant's `queries:` tag.

use std::any::Any;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use kgraph_core::Result;

#[must_use]
pub fn entity_tag(scope: &str, id: &str) -> String {
    format!("entity:{scope}:{id}")
}

#[must_use]
pub fn relation_tag(scope: &str, id: &str) -> String {
    format!("relation:{scope}:{id}")
}

/// Tag carried by every query result of a tenant.
#[must_use]
pub fn queries_tag(scope: &str) -> String {
    format!("queries:{scope}")
}

struct CacheEntry {
    value: Arc<dyn Any + Send + Sync>,
    inserted_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_fresh(&self) -> bool {
        self.inserted_at.elapsed() < self.ttl
    }
}

/// Hit/miss counters and current size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub tags: usize,
}

pub struct QueryCache {
    ttl: Duration,
    max_entries: usize,
    entries: DashMap<String, CacheEntry>,
    /// tag -> keys of entries depending on it
    tags: DashMap<String, HashSet<String>>,
    /// key -> its tags, so removing a key scrubs every tag set
    key_tags: DashMap<String, Vec<String>>,
    inflight: DashMap<String, Arc<AsyncMutex<()>>>,
    last_purge: Mutex<Instant>,
    /// Bumped by every invalidation; loads started before a bump are not stored.
    epoch: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Holds a key's load lock; drops the map slot once no other caller waits on it.
struct InflightSlot<'a> {
    inflight: &'a DashMap<String, Arc<AsyncMutex<()>>>,
    key: &'a str,
    lock: Arc<AsyncMutex<()>>,
}

impl Drop for InflightSlot<'_> {
    fn drop(&mut self) {
        // One reference is ours, one is the map's.
        self.inflight
            .remove_if(self.key, |_, lock| Arc::ptr_eq(lock, &self.lock) && Arc::strong_count(lock) <= 2);
    }
}

impl QueryCache {
    pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self::with_max_entries(ttl, Self::DEFAULT_MAX_ENTRIES)
    }

    #[must_use]
    pub fn with_max_entries(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            entries: DashMap::new(),
            tags: DashMap::new(),
            key_tags: DashMap::new(),
            inflight: DashMap::new(),
            last_purge: Mutex::new(Instant::now()),
            epoch: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cache key for an operation call.
    ///
    /// # Errors
    ///
    /// Returns [`kgraph_core::KgError::Serialization`] if `args` cannot be
    /// turned into JSON.
    pub fn key(operation: &str, scope: &str, args: &impl Serialize) -> Result<String> {
        // Round-trip through Value so object keys come out sorted.
        let canonical = serde_json::to_string(&serde_json::to_value(args)?)?;
        let mut hasher = Sha256::new();
        hasher.update(operation.as_bytes());
        hasher.update([0]);
        hasher.update(scope.as_bytes());
        hasher.update([0]);
        hasher.update(canonical.as_bytes());
        Ok(format!("{:x}", hasher.finalize()))
    }

    fn lookup<T: Clone + 'static>(&self, key: &str) -> Option<T> {
        let entry = self.entries.get(key)?;
        if !entry.is_fresh() {
            drop(entry);
            self.remove_key(key);
            return None;
        }
        entry.value.downcast_ref::<T>().cloned()
    }

    /// Remove one entry and unlink it from all of its tags.
    fn remove_key(&self, key: &str) -> bool {
        let existed = self.entries.remove(key).is_some();
        if let Some((_, tags)) = self.key_tags.remove(key) {
            for tag in tags {
                let emptied = match self.tags.get_mut(&tag) {
                    Some(mut keys) => {
                        keys.remove(key);
                        keys.is_empty()
                    }
                    None => false,
                };
                if emptied {
                    self.tags.remove_if(&tag, |_, keys| keys.is_empty());
                }
            }
        }
        existed
    }

    /// Purge expired entries at most once per TTL period.
    fn maybe_purge(&self) {
        let mut last = self.last_purge.lock();
        if last.elapsed() < self.ttl {
            return;
        }
        *last = Instant::now();
        drop(last);
        self.purge_expired();
    }

    /// Make room for one more entry, dropping expired entries first and then
    /// the oldest tenth of the cache.
    fn make_room(&self) {
        if self.entries.len() < self.max_entries {
            return;
        }
        self.purge_expired();
        let len = self.entries.len();
        if len < self.max_entries {
            return;
        }
        let mut by_age: Vec<(Instant, String)> = self
            .entries
            .iter()
            .map(|e| (e.inserted_at, e.key().clone()))
            .collect();
        by_age.sort_unstable();
        let evict = len + 1 - self.max_entries + self.max_entries / 10;
        for (_, key) in by_age.into_iter().take(evict) {
            self.remove_key(&key);
        }
        debug!(evicted = evict, "cache full, evicted oldest entries");
    }

    /// Fetch a fresh entry of type `T`, counting the hit or miss.
    pub fn get<T: Clone + 'static>(&self, key: &str) -> Option<T> {
        let found = self.lookup(key);
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Store `value` under `key`, registering it with each tag.
    pub fn insert<T: Send + Sync + 'static>(&self, key: String, value: T, tags: &[String]) {
        self.maybe_purge();
        self.remove_key(&key);
        self.make_room();
        for tag in tags {
            self.tags.entry(tag.clone()).or_default().insert(key.clone());
        }
        self.key_tags.insert(key.clone(), tags.to_vec());
        self.entries.insert(
            key,
            CacheEntry {
                value: Arc::new(value),
                inserted_at: Instant::now(),
                ttl: self.ttl,
            },
        );
    }

    /// Read-through lookup. Concurrent callers with the same key wait for a
    /// single `load`; errors are returned and never cached.
    ///
    /// # Errors
    ///
    /// Whatever `load` returns.
    pub async fn get_or_load<T, F, Fut>(&self, key: String, tags: impl FnOnce(&T) -> Vec<String>, load: F) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(hit) = self.get::<T>(&key) {
            return Ok(hit);
        }

        let slot = InflightSlot {
            inflight: &self.inflight,
            key: &key,
            lock: Arc::clone(
                self.inflight
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                    .value(),
            ),
        };
        let _held = slot.lock.lock().await;
        if let Some(hit) = self.lookup::<T>(&key) {
            return Ok(hit);
        }

        let epoch = self.epoch.load(Ordering::Acquire);
        let result = load().await;
        if let Ok(ref value) = result {
            if self.epoch.load(Ordering::Acquire) == epoch {
                let tags = tags(value);
                self.insert(key.clone(), value.clone(), &tags);
            } else {
                debug!("cache: write raced with load, not storing");
            }
        }
        result
    }

    /// Drop every entry that depends on any of `tags`.
    pub fn invalidate(&self, tags: &[String]) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        let mut removed = 0usize;
        for tag in tags {
            if let Some((_, keys)) = self.tags.remove(tag) {
                for key in keys {
                    if self.remove_key(&key) {
                        removed += 1;
                    }
                }
            }
        }
        if removed > 0 {
            debug!(removed, tags = tags.len(), "cache invalidated");
        }
    }

    pub fn clear(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.entries.clear();
        self.tags.clear();
        self.key_tags.clear();
    }

    /// Remove expired entries along with their tag links.
    pub fn purge_expired(&self) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| !e.is_fresh())
            .map(|e| e.key().clone())
            .collect();
        for key in &expired {
            self.remove_key(key);
        }
        expired.len()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.len(),
            tags: self.tags.len(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn key_is_canonical_and_scoped() {
        let a = QueryCache::key("search", "shared/acme", &serde_json::json!({"b": 1, "a": 2})).unwrap();
        let b = QueryCache::key("search", "shared/acme", &serde_json::json!({"a": 2, "b": 1})).unwrap();
        let other = QueryCache::key("search", "shared/globex", &serde_json::json!({"a": 2, "b": 1})).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, other);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn invalidation_by_tag_drops_dependents_only() {
        let cache = QueryCache::new(Duration::from_secs(60));
        cache.insert("k1".into(), 1_u32, &[entity_tag("shared/acme", "a")]);
        cache.insert("k2".into(), 2_u32, &[entity_tag("shared/acme", "b")]);
        cache.invalidate(&[entity_tag("shared/acme", "a")]);
        assert_eq!(cache.get::<u32>("k1"), None);
        assert_eq!(cache.get::<u32>("k2"), Some(2));
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries, stats.tags), (1, 1, 1, 1));
    }

    #[test]
    fn expired_entries_are_misses() {
        let cache = QueryCache::new(Duration::ZERO);
        cache.insert("k".into(), "v".to_string(), &[]);
        assert_eq!(cache.get::<String>("k"), None);
        assert_eq!(cache.purge_expired(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn expired_entries_and_their_tags_are_purged_on_insert() {
        let cache = QueryCache::new(Duration::from_millis(1));
        for i in 0..1_000 {
            cache.insert(format!("old{i}"), i, &[entity_tag("s", &i.to_string()), queries_tag("s")]);
        }
        std::thread::sleep(Duration::from_millis(20));
        for i in 0..1_000 {
            cache.insert(format!("new{i}"), i, &[entity_tag("s", &format!("n{i}")), queries_tag("s")]);
        }
        // Everything old is gone, including its entity tags.
        assert!(cache.len() <= 1_000);
        assert!(cache.stats().tags <= 1_001);
        assert!(cache.get::<i32>("old0").is_none());
    }

    #[test]
    fn invalidation_scrubs_keys_from_every_tag() {
        let cache = QueryCache::new(Duration::from_secs(60));
        for i in 0..100 {
            cache.insert(format!("k{i}"), i, &[entity_tag("s", &i.to_string()), queries_tag("s")]);
        }
        assert_eq!(cache.stats().tags, 101);
        cache.invalidate(&[queries_tag("s")]);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().tags, 0);
    }

    #[test]
    fn reinsert_replaces_old_tags() {
        let cache = QueryCache::new(Duration::from_secs(60));
        cache.insert("k".into(), 1_u32, &[entity_tag("s", "a")]);
        cache.insert("k".into(), 2_u32, &[entity_tag("s", "b")]);
        cache.invalidate(&[entity_tag("s", "a")]);
        assert_eq!(cache.get::<u32>("k"), Some(2));
        assert_eq!(cache.stats().tags, 1);
    }

    #[test]
    fn size_cap_evicts_oldest_entries() {
        let cache = QueryCache::with_max_entries(Duration::from_secs(60), 50);
        for i in 0..500_u32 {
            cache.insert(format!("k{i}"), i, &[queries_tag("s")]);
        }
        assert!(cache.len() <= 50);
        assert_eq!(cache.get::<u32>("k499"), Some(499));
        assert_eq!(cache.get::<u32>("k0"), None);
    }

    #[test]
    fn wrong_type_is_a_miss() {
        let cache = QueryCache::new(Duration::from_secs(60));
        cache.insert("k".into(), 7_u64, &[]);
        assert_eq!(cache.get::<String>("k"), None);
    }

    #[tokio::test]
    async fn concurrent_loads_are_single_flight() {
        let cache = Arc::new(QueryCache::new(Duration::from_secs(60)));
        let loads = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            let loads = Arc::clone(&loads);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_load(
                        "same".to_string(),
                        |_: &u32| vec![queries_tag("shared/acme")],
                        || async {
                            loads.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(42_u32)
                        },
                    )
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 42);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn load_locks_are_released_after_every_call() {
        let cache = Arc::new(QueryCache::new(Duration::from_secs(60)));
        let mut handles = Vec::new();
        for i in 0..32 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_load(
                        format!("key{}", i % 4),
                        |_: &u32| Vec::new(),
                        || async {
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            Ok(1_u32)
                        },
                    )
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        let _: Result<u32> = cache
            .get_or_load("bad".into(), |_| Vec::new(), || async {
                Err(kgraph_core::KgError::TransientBackend("busy".into()))
            })
            .await;
        assert!(cache.inflight.is_empty());
    }

    #[tokio::test]
    async fn failed_loads_are_not_cached() {
        let cache = QueryCache::new(Duration::from_secs(60));
        let err: Result<u32> = cache
            .get_or_load("k".into(), |_| Vec::new(), || async {
                Err(kgraph_core::KgError::TransientBackend("busy".into()))
            })
            .await;
        assert!(err.is_err());
        assert!(cache.is_empty());
    }
}
