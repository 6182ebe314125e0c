// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! L1: bounded in-memory store with per-entry TTL and true LRU eviction.
//!
//! # Structure
//!
//! ```text
//! ┌───────────────────────── Mutex<Inner> ─────────────────────────┐
//! │ entries:  key → CacheEntry<V>        (value, created_at, ttl)  │
//! │ order:    key → seq, seq → key       (LRU, min seq = victim)   │
//! │ tags:     tag → {key}                (bulk invalidation)       │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All three structures change together under one lock, so every operation
//! leaves them consistent. The lock is never held across an `.await`.
//!
//! Expired entries are removed lazily by `get`/`has` and eagerly by
//! [`ExpiringStore::sweep_expired`], which the owner runs on a
//! [`PeriodicTask`] via [`ExpiringStore::start_sweeper`].

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::pattern::glob_match;
use super::tag_index::TagIndex;
use crate::entry::CacheEntry;
use crate::task::PeriodicTask;

/// Key → access sequence, plus the reverse ordered index used to find the
/// least recently used key in O(log n).
#[derive(Debug, Default)]
struct AccessOrder {
    by_key: HashMap<String, u64>,
    by_seq: BTreeMap<u64, String>,
    next_seq: u64,
}

impl AccessOrder {
    fn touch(&mut self, key: &str) {
        let seq = self.next_seq;
        self.next_seq += 1;
        if let Some(old) = self.by_key.insert(key.to_string(), seq) {
            self.by_seq.remove(&old);
        }
        self.by_seq.insert(seq, key.to_string());
    }

    fn remove(&mut self, key: &str) {
        if let Some(seq) = self.by_key.remove(key) {
            self.by_seq.remove(&seq);
        }
    }

    fn oldest(&self) -> Option<&String> {
        self.by_seq.values().next()
    }

    fn len(&self) -> usize {
        self.by_key.len()
    }

    fn clear(&mut self) {
        self.by_key.clear();
        self.by_seq.clear();
    }
}

struct Inner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    order: AccessOrder,
    tags: TagIndex,
}

impl<V> Inner<V> {
    /// The single removal path: entry, LRU slot and tag memberships.
    fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.order.remove(key);
        self.tags.remove_key(key, &entry.tags);
        Some(entry)
    }
}

/// Point-in-time statistics for an [`ExpiringStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    /// Number of distinct tags currently indexed
    pub tags: usize,
}

impl StoreStats {
    /// Hit rate (0.0 - 1.0)
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Bounded TTL + LRU store, the L1 tier.
pub struct ExpiringStore<V> {
    inner: Mutex<Inner<V>>,
    max_size: usize,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl<V: Clone + Send + 'static> ExpiringStore<V> {
    /// Create a store holding at most `max_size` entries.
    ///
    /// A zero `max_size` is treated as 1.
    pub fn new(max_size: usize, default_ttl: Duration) -> Self {
        let max_size = if max_size == 0 {
            warn!("ExpiringStore max_size is 0, clamping to 1");
            1
        } else {
            max_size
        };
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::with_capacity(max_size.min(4096)),
                order: AccessOrder::default(),
                tags: TagIndex::new(),
            }),
            max_size,
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Insert or overwrite `key`.
    ///
    /// A brand-new key arriving at capacity evicts the least recently used
    /// entry first. Overwriting replaces the previous tags. A zero TTL is
    /// logged and replaced by the store default.
    pub fn set<I>(&self, key: &str, value: V, ttl: Duration, tags: I)
    where
        I: IntoIterator<Item = String>,
    {
        let ttl = if ttl.is_zero() {
            warn!(key, "Zero TTL on set, using default");
            self.default_ttl
        } else {
            ttl
        };
        let entry = CacheEntry::new(key.to_string(), value, ttl, tags);

        let evicted = {
            let mut inner = self.inner.lock();
            let mut evicted = 0usize;

            if let Some(previous) = inner.entries.remove(key) {
                inner.tags.remove_key(key, &previous.tags);
            } else {
                while inner.entries.len() >= self.max_size {
                    let Some(victim) = inner.order.oldest().cloned() else {
                        break;
                    };
                    inner.remove(&victim);
                    evicted += 1;
                    trace!(key = %victim, "LRU eviction");
                }
            }

            for tag in &entry.tags {
                inner.tags.add(tag, key);
            }
            inner.entries.insert(key.to_string(), entry);
            inner.order.touch(key);
            debug_assert_eq!(inner.entries.len(), inner.order.len());
            crate::metrics::set_l1_items(inner.entries.len());
            evicted
        };

        if evicted > 0 {
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            crate::metrics::record_eviction(evicted);
        }
    }

    /// Return a clone of the live value for `key`, refreshing its LRU
    /// position. An expired entry is deleted and reported as absent.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let live = match inner.entries.get(key) {
            Some(entry) => entry.is_live_at(now),
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if live {
            inner.order.touch(key);
            self.hits.fetch_add(1, Ordering::Relaxed);
            inner.entries.get(key).map(|e| e.value.clone())
        } else {
            inner.remove(key);
            crate::metrics::set_l1_items(inner.entries.len());
            drop(inner);
            self.misses.fetch_add(1, Ordering::Relaxed);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_expiration(1);
            None
        }
    }

    /// Liveness check that leaves LRU order untouched. Deletes if expired.
    pub fn has(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        match inner.entries.get(key).map(|e| e.is_live_at(now)) {
            Some(true) => true,
            Some(false) => {
                inner.remove(key);
                crate::metrics::set_l1_items(inner.entries.len());
                drop(inner);
                self.expirations.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_expiration(1);
                false
            }
            None => false,
        }
    }

    /// Remaining TTL of a live entry.
    pub fn ttl_remaining(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let inner = self.inner.lock();
        inner
            .entries
            .get(key)
            .filter(|e| e.is_live_at(now))
            .map(|e| e.remaining_ttl(now))
    }

    /// Remove `key`; returns whether anything was removed.
    pub fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        let removed = inner.remove(key).is_some();
        if removed {
            crate::metrics::set_l1_items(inner.entries.len());
        }
        removed
    }

    /// Remove each of `keys`; returns how many were present.
    pub fn delete_many<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> usize {
        let mut inner = self.inner.lock();
        let removed = keys.into_iter().filter(|k| inner.remove(k).is_some()).count();
        if removed > 0 {
            crate::metrics::set_l1_items(inner.entries.len());
        }
        removed
    }

    /// Remove all entries, LRU tracking and tag associations.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
        inner.tags.clear();
        crate::metrics::set_l1_items(0);
    }

    /// Keys currently indexed under `tag`.
    pub fn keys_for_tag(&self, tag: &str) -> Vec<String> {
        self.inner.lock().tags.keys_for_tag(tag)
    }

    /// Delete every key carrying `tag`; returns the removed keys.
    pub fn invalidate_tag(&self, tag: &str) -> Vec<String> {
        let mut inner = self.inner.lock();
        let keys = inner.tags.keys_for_tag(tag);
        let removed: Vec<String> = keys.into_iter().filter(|k| inner.remove(k).is_some()).collect();
        if !removed.is_empty() {
            crate::metrics::set_l1_items(inner.entries.len());
        }
        removed
    }

    /// Keys matching a Redis-style glob pattern.
    ///
    /// This is a full scan; pattern invalidation is expected to be rare.
    pub fn keys_matching(&self, pattern: &str) -> Vec<String> {
        self.inner
            .lock()
            .entries
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect()
    }

    /// Delete every entry whose TTL has elapsed; returns how many.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let removed = {
            let mut inner = self.inner.lock();
            let expired: Vec<String> = inner
                .entries
                .values()
                .filter(|e| !e.is_live_at(now))
                .map(|e| e.key.clone())
                .collect();
            let removed = expired.iter().filter(|k| inner.remove(k).is_some()).count();
            crate::metrics::set_l1_items(inner.entries.len());
            removed
        };

        if removed > 0 {
            self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
            crate::metrics::record_expiration(removed);
            debug!(removed, "L1 sweep removed expired entries");
        }
        removed
    }

    /// Spawn the periodic expiry sweep for this store.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> PeriodicTask
    where
        V: Sync,
    {
        let store = Arc::clone(self);
        PeriodicTask::spawn("l1-sweep", interval, false, move || {
            let store = Arc::clone(&store);
            async move {
                store.sweep_expired();
            }
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn stats(&self) -> StoreStats {
        let (size, tags) = {
            let inner = self.inner.lock();
            (inner.entries.len(), inner.tags.tags_len())
        };
        StoreStats {
            size,
            max_size: self.max_size,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            tags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};

    const TTL: Duration = Duration::from_secs(60);

    fn store(max: usize) -> ExpiringStore<String> {
        ExpiringStore::new(max, TTL)
    }

    fn no_tags() -> Vec<String> {
        Vec::new()
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_boundary() {
        let s = store(10);
        s.set("k", "v".into(), Duration::from_millis(100), no_tags());

        tokio::time::advance(Duration::from_millis(99)).await;
        assert_eq!(s.get("k").as_deref(), Some("v"));

        tokio::time::advance(Duration::from_millis(2)).await;
        assert_eq!(s.get("k"), None);
        assert!(s.is_empty(), "expired entry should be deleted on access");
        assert_eq!(s.stats().expirations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_exact_bound_is_expired() {
        let s = store(10);
        s.set("get", "v".into(), Duration::from_millis(100), no_tags());
        s.set("has", "v".into(), Duration::from_millis(100), no_tags());

        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(s.get("get"), None, "an entry is gone once age == ttl");
        assert!(!s.has("has"));
        assert_eq!(s.ttl_remaining("get"), None);
    }

    fn l1_items_gauge(snapshotter: &Snapshotter) -> Option<f64> {
        snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .find_map(|(key, _, _, value)| match value {
                DebugValue::Gauge(v) if key.key().name() == "tiered_cache_l1_items" => Some(v.into_inner()),
                _ => None,
            })
    }

    #[tokio::test(start_paused = true)]
    async fn test_item_gauge_follows_every_removal() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let s = store(10);
        let short = Duration::from_millis(10);

        metrics::with_local_recorder(&recorder, || {
            s.set("a", "v".into(), TTL, vec!["x".to_string()]);
            s.set("b", "v".into(), TTL, no_tags());
            s.set("c", "v".into(), TTL, vec!["y".to_string()]);
            s.set("d", "v".into(), short, no_tags());
            s.set("e", "v".into(), short, no_tags());
        });
        assert_eq!(l1_items_gauge(&snapshotter), Some(5.0));

        metrics::with_local_recorder(&recorder, || s.delete("a"));
        assert_eq!(l1_items_gauge(&snapshotter), Some(4.0));

        metrics::with_local_recorder(&recorder, || s.delete_many(["b"]));
        assert_eq!(l1_items_gauge(&snapshotter), Some(3.0));

        metrics::with_local_recorder(&recorder, || s.invalidate_tag("y"));
        assert_eq!(l1_items_gauge(&snapshotter), Some(2.0));

        tokio::time::advance(Duration::from_millis(20)).await;
        metrics::with_local_recorder(&recorder, || s.get("d"));
        assert_eq!(l1_items_gauge(&snapshotter), Some(1.0));

        metrics::with_local_recorder(&recorder, || s.has("e"));
        assert_eq!(l1_items_gauge(&snapshotter), Some(0.0));
        assert_eq!(s.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lru_eviction_respects_access() {
        let s = store(2);
        s.set("A", "a".into(), TTL, no_tags());
        s.set("B", "b".into(), TTL, no_tags());
        assert!(s.get("A").is_some());
        s.set("C", "c".into(), TTL, no_tags());

        assert!(s.has("A"));
        assert!(!s.has("B"));
        assert!(s.has("C"));
        assert_eq!(s.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_has_does_not_refresh_lru() {
        let s = store(2);
        s.set("A", "a".into(), TTL, no_tags());
        s.set("B", "b".into(), TTL, no_tags());
        assert!(s.has("A"));
        s.set("C", "c".into(), TTL, no_tags());

        assert!(!s.has("A"), "has() must not protect A from eviction");
        assert!(s.has("B"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overwrite_at_capacity_does_not_evict() {
        let s = store(2);
        s.set("A", "a".into(), TTL, no_tags());
        s.set("B", "b".into(), TTL, no_tags());
        s.set("A", "a2".into(), TTL, no_tags());

        assert_eq!(s.len(), 2);
        assert_eq!(s.get("A").as_deref(), Some("a2"));
        assert!(s.has("B"));
        assert_eq!(s.stats().evictions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overwrite_refreshes_created_at() {
        let s = store(2);
        s.set("k", "v1".into(), Duration::from_millis(100), no_tags());
        tokio::time::advance(Duration::from_millis(80)).await;
        s.set("k", "v2".into(), Duration::from_millis(100), no_tags());
        tokio::time::advance(Duration::from_millis(80)).await;

        assert_eq!(s.get("k").as_deref(), Some("v2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overwrite_replaces_tags() {
        let s = store(10);
        s.set("k", "v".into(), TTL, vec!["old".to_string()]);
        s.set("k", "v".into(), TTL, vec!["new".to_string()]);

        assert!(s.keys_for_tag("old").is_empty());
        assert_eq!(s.keys_for_tag("new"), vec!["k".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_removes_tags() {
        let s = store(10);
        s.set("a", "v".into(), TTL, vec!["x".to_string()]);
        assert!(s.delete("a"));
        assert!(!s.delete("a"));
        assert!(s.keys_for_tag("x").is_empty());
        assert_eq!(s.stats().tags, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_tag() {
        let s = store(10);
        s.set("a", "v".into(), TTL, vec!["x".to_string()]);
        s.set("b", "v".into(), TTL, vec!["y".to_string()]);
        s.set("c", "v".into(), TTL, vec!["x".to_string(), "y".to_string()]);

        let mut removed = s.invalidate_tag("x");
        removed.sort();
        assert_eq!(removed, vec!["a".to_string(), "c".to_string()]);
        assert!(!s.has("a"));
        assert!(s.has("b"));
        assert!(!s.has("c"));
        assert_eq!(s.keys_for_tag("y"), vec!["b".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_cleans_tag_index() {
        let s = store(1);
        s.set("a", "v".into(), TTL, vec!["x".to_string()]);
        s.set("b", "v".into(), TTL, no_tags());
        assert!(s.keys_for_tag("x").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_only_expired() {
        let s = store(10);
        s.set("short", "v".into(), Duration::from_millis(10), vec!["t".to_string()]);
        s.set("long", "v".into(), Duration::from_secs(10), vec!["t".to_string()]);

        tokio::time::advance(Duration::from_millis(20)).await;
        assert_eq!(s.sweep_expired(), 1);
        assert_eq!(s.len(), 1);
        assert_eq!(s.keys_for_tag("t"), vec!["long".to_string()]);
        assert_eq!(s.sweep_expired(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweeper() {
        let s = Arc::new(store(10));
        s.set("k", "v".into(), Duration::from_millis(10), no_tags());
        let sweeper = s.start_sweeper(Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(s.len(), 0, "sweeper should remove the expired entry without access");
        sweeper.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_is_idempotent() {
        let s = store(10);
        s.set("a", "v".into(), TTL, vec!["x".to_string()]);
        s.clear();
        assert_eq!(s.stats().size, 0);
        s.clear();
        assert_eq!(s.stats().size, 0);
        assert_eq!(s.stats().tags, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ttl_uses_default() {
        let s = store(10);
        s.set("k", "v".into(), Duration::ZERO, no_tags());
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(s.has("k"));
        assert_eq!(s.ttl_remaining("k"), Some(Duration::from_secs(30)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_matching() {
        let s = store(10);
        s.set("company:CHE-1", "v".into(), TTL, no_tags());
        s.set("company:CHE-2", "v".into(), TTL, no_tags());
        s.set("plz:8001", "v".into(), TTL, no_tags());

        let mut keys = s.keys_matching("company:*");
        keys.sort();
        assert_eq!(keys, vec!["company:CHE-1".to_string(), "company:CHE-2".to_string()]);
        assert_eq!(s.delete_many(keys.iter().map(String::as_str)), 2);
        assert_eq!(s.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_hit_rate() {
        let s = store(10);
        s.set("k", "v".into(), TTL, no_tags());
        s.get("k");
        s.get("missing");

        let stats = s.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_zero_capacity_clamps() {
        let s: ExpiringStore<u8> = ExpiringStore::new(0, TTL);
        assert_eq!(s.max_size(), 1);
    }
}
