// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Two-tier cache orchestrator.
//!
//! [`TieredCache`] puts the L1 [`ExpiringStore`] in front of an optional L2
//! [`DistributedStore`] and answers `get(key, fallback, options)`:
//!
//! ```text
//! get ──► L1 hit? ──yes──► value
//!           │no
//!           ▼
//!         L2 hit? ──yes──► decode ──► populate L1 ──► value
//!           │no / error / circuit open
//!           ▼
//!         fallback() ──ok──► write L1 + L2 ──► value
//!           │err
//!           ▼
//!         caller's error, nothing cached
//! ```
//!
//! # Key layout
//!
//! | Tier | Key                 |
//! |------|---------------------|
//! | L1   | `key`               |
//! | L2   | `{region}:{key}`    |
//! | L2   | `tag:{tag}` (set of L2 keys) |
//!
//! L2 is strictly best effort: any L2 failure (store error, codec error,
//! open circuit) is logged, counted and treated as a miss. Only a fallback
//! error ever reaches the caller.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tiered_cache::{CacheConfig, CacheOptions, JsonCodec, RedisStore, TieredCache};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let redis = Arc::new(RedisStore::new("redis://localhost").await?);
//! let cache: TieredCache<Vec<String>> =
//!     TieredCache::new(CacheConfig::default(), Some(redis), Arc::new(JsonCodec::new()));
//! cache.start();
//!
//! let opts = CacheOptions::new().ttl(Duration::from_secs(3600)).tag("canton:ZH");
//! let plz: Result<Vec<String>, String> = cache
//!     .get("plz:ZH", || async { Ok(vec!["8001".to_string(), "8002".to_string()]) }, &opts)
//!     .await;
//!
//! cache.invalidate_tag("canton:ZH").await;
//! cache.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod coalesce;
mod invalidate;
mod lifecycle;
mod types;

pub use types::{CacheOptions, CacheState, CacheStats, InvalidationKind};

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::codec::Codec;
use crate::compression::{compress_with_stats, is_zstd, Compressor};
use crate::config::CacheConfig;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
use crate::store::{DistributedStore, ExpiringStore};
use crate::task::PeriodicTask;

#[derive(Debug, Default)]
struct Counters {
    l2_hits: AtomicU64,
    l2_misses: AtomicU64,
    l2_errors: AtomicU64,
    fallback_runs: AtomicU64,
    fallback_errors: AtomicU64,
    compression_saved_bytes: AtomicU64,
}

/// L1 + L2 cache with read-through, write-through and bulk invalidation.
///
/// `Send + Sync`; share it behind an `Arc`. The L1 lock is never held across
/// an `.await`, so suspension only happens at the L2 boundary and inside
/// caller fallbacks.
pub struct TieredCache<V> {
    pub(super) config: CacheConfig,
    pub(super) l1: Arc<ExpiringStore<V>>,
    pub(super) l2: Option<Arc<dyn DistributedStore>>,
    pub(super) codec: Arc<dyn Codec<V>>,
    pub(super) compressor: Option<Arc<dyn Compressor>>,
    pub(super) circuit: CircuitBreaker,
    /// Keys with a coalesced load running, and the channel its outcome lands on
    pub(super) in_flight: DashMap<String, coalesce::FlightHandle>,
    pub(super) next_flight: AtomicU64,
    counters: Counters,
    pub(super) sweeper: Mutex<Option<PeriodicTask>>,
    pub(super) state: watch::Sender<CacheState>,
}

impl<V> TieredCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Build a cache. `l2 = None` (or `l2_enabled = false`) gives an
    /// L1-only cache with the same API.
    pub fn new(config: CacheConfig, l2: Option<Arc<dyn DistributedStore>>, codec: Arc<dyn Codec<V>>) -> Self {
        let config = config.validated();
        let l2 = if config.l2_enabled {
            l2
        } else {
            if l2.is_some() {
                info!("L2 store attached but l2_enabled = false, running L1 only");
            }
            None
        };
        let l1 = Arc::new(ExpiringStore::new(config.max_size, config.default_ttl()));
        let (state, _) = watch::channel(CacheState::Created);

        Self {
            config,
            l1,
            l2,
            codec,
            compressor: default_compressor(),
            circuit: CircuitBreaker::new("l2", CircuitConfig::default()),
            in_flight: DashMap::new(),
            next_flight: AtomicU64::new(0),
            counters: Counters::default(),
            sweeper: Mutex::new(None),
            state,
        }
    }

    /// Replace the L2 payload compressor.
    #[must_use]
    pub fn with_compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    /// Replace the L2 circuit breaker settings.
    #[must_use]
    pub fn with_circuit_config(mut self, config: CircuitConfig) -> Self {
        self.circuit = CircuitBreaker::new("l2", config);
        self
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    #[must_use]
    pub fn has_l2(&self) -> bool {
        self.l2.is_some()
    }

    /// Direct access to the L1 store.
    #[must_use]
    pub fn l1(&self) -> &ExpiringStore<V> {
        &self.l1
    }

    // --- Read path ---

    /// Read through both tiers, running `fallback` on a full miss.
    ///
    /// A fallback error is returned unmodified and nothing is cached. With
    /// `coalesce_misses` configured this behaves like
    /// [`get_coalesced`](Self::get_coalesced).
    #[tracing::instrument(skip(self, fallback, options), fields(tier))]
    pub async fn get<F, Fut, E>(&self, key: &str, fallback: F, options: &CacheOptions) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: Clone + Send + Sync + 'static,
    {
        if let Some(value) = self.lookup(key, options).await {
            return Ok(value);
        }
        if self.config.coalesce_misses {
            return self.load_coalesced(key, fallback, options).await;
        }
        self.load(key, fallback, options).await
    }

    /// Tiers only; never runs a fallback.
    #[tracing::instrument(skip(self, options), fields(tier))]
    pub async fn peek(&self, key: &str, options: &CacheOptions) -> Option<V> {
        self.lookup(key, options).await
    }

    /// L1 then L2. An L2 hit is copied into L1 with the options' TTL/tags.
    pub(super) async fn lookup(&self, key: &str, options: &CacheOptions) -> Option<V> {
        let start = Instant::now();

        if let Some(value) = self.l1.get(key) {
            tracing::Span::current().record("tier", "L1");
            debug!("L1 hit");
            crate::metrics::record_operation("L1", "get", "hit");
            crate::metrics::record_latency("L1", "get", start.elapsed());
            return Some(value);
        }
        crate::metrics::record_operation("L1", "get", "miss");

        let value = self.l2_get(key, options).await?;
        self.l1.set(key, value.clone(), self.ttl_for(options), options.tags.iter().cloned());
        tracing::Span::current().record("tier", "L2");
        debug!("L2 hit, promoted to L1");
        crate::metrics::record_latency("L2", "get", start.elapsed());
        Some(value)
    }

    async fn l2_get(&self, key: &str, options: &CacheOptions) -> Option<V> {
        let l2 = self.l2.as_ref()?;
        let l2_key = l2_key(self.region_for(options), key);

        let bytes = match self.circuit.call(|| l2.get(&l2_key)).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                self.counters.l2_misses.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_operation("L2", "get", "miss");
                return None;
            }
            Err(e) => {
                self.record_l2_error("get", &e);
                return None;
            }
        };

        let raw = match &self.compressor {
            Some(compressor) if compressor.is_compressed(&bytes) => match compressor.decompress(&bytes) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(key = %l2_key, compressor = compressor.name(), error = %e, "L2 payload decompression failed, treating as miss");
                    self.count_l2_error("get", "decompress");
                    return None;
                }
            },
            None if is_zstd(&bytes) => {
                warn!(key = %l2_key, "Compressed L2 payload but no compressor configured, treating as miss");
                self.count_l2_error("get", "decompress");
                return None;
            }
            _ => bytes,
        };

        match self.codec.decode(&raw) {
            Ok(value) => {
                self.counters.l2_hits.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_operation("L2", "get", "hit");
                Some(value)
            }
            Err(e) => {
                warn!(key = %l2_key, error = %e, "L2 payload decode failed, treating as miss");
                self.count_l2_error("get", "decode");
                None
            }
        }
    }

    /// Run the fallback and write its value through on success.
    pub(super) async fn load<F, Fut, E>(&self, key: &str, fallback: F, options: &CacheOptions) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let start = Instant::now();
        self.counters.fallback_runs.fetch_add(1, Ordering::Relaxed);
        tracing::Span::current().record("tier", "fallback");

        match fallback().await {
            Ok(value) => {
                crate::metrics::record_operation("fallback", "get", "success");
                crate::metrics::record_latency("fallback", "get", start.elapsed());
                self.write_through(key, value.clone(), options).await;
                Ok(value)
            }
            Err(e) => {
                self.counters.fallback_errors.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_operation("fallback", "get", "error");
                debug!("Fallback failed, nothing cached");
                Err(e)
            }
        }
    }

    // --- Write path ---

    /// Unconditional write-through. L2 failure is logged, never returned.
    #[tracing::instrument(skip(self, value, options))]
    pub async fn set(&self, key: &str, value: V, options: &CacheOptions) {
        self.write_through(key, value, options).await;
    }

    async fn write_through(&self, key: &str, value: V, options: &CacheOptions) {
        let ttl = self.ttl_for(options);

        // Encode before the value moves into L1
        let encoded = self.l2.as_ref().map(|_| self.codec.encode(&value));

        self.l1.set(key, value, ttl, options.tags.iter().cloned());
        crate::metrics::record_operation("L1", "set", "success");

        let (Some(l2), Some(encoded)) = (self.l2.as_ref(), encoded) else {
            return;
        };
        let bytes = match encoded {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key, error = %e, "Encode for L2 failed, L1 only");
                self.count_l2_error("set", "encode");
                return;
            }
        };
        let Some((payload, compressed)) = self.maybe_compress(key, bytes, options) else {
            return;
        };

        let l2_key = l2_key(self.region_for(options), key);
        let ttl_secs = l2_ttl_secs(ttl);
        let len = payload.len();

        match self.circuit.call(|| l2.set_with_ttl(&l2_key, &payload, ttl_secs)).await {
            Ok(()) => {
                crate::metrics::record_operation("L2", "set", "success");
                crate::metrics::record_bytes_written(len, compressed);
            }
            Err(e) => {
                self.record_l2_error("set", &e);
                return;
            }
        }

        for tag in &options.tags {
            let set_key = tag_set_key(tag);
            if let Err(e) = self.circuit.call(|| l2.add_to_set(&set_key, &l2_key, ttl_secs)).await {
                self.record_l2_error("tag", &e);
            }
        }
    }

    fn maybe_compress(&self, key: &str, bytes: Vec<u8>, options: &CacheOptions) -> Option<(Vec<u8>, bool)> {
        let wanted = options.compress.unwrap_or(self.config.compress);
        if !wanted || bytes.len() < self.config.compress_threshold_bytes {
            return Some((bytes, false));
        }
        let Some(compressor) = self.compressor.as_ref() else {
            debug!(key, "Compression requested but no compressor configured");
            return Some((bytes, false));
        };
        match compress_with_stats(compressor.as_ref(), &bytes) {
            Ok((packed, stats)) => {
                let saved = stats.original_bytes.saturating_sub(stats.compressed_bytes);
                self.counters
                    .compression_saved_bytes
                    .fetch_add(saved as u64, Ordering::Relaxed);
                crate::metrics::record_compression(compressor.name(), stats.ratio);
                debug!(
                    key,
                    original = stats.original_bytes,
                    compressed = stats.compressed_bytes,
                    ratio = stats.ratio,
                    "L2 payload compressed"
                );
                Some((packed, true))
            }
            Err(e) => {
                warn!(key, error = %e, "L2 payload compression failed, skipping L2 write");
                self.count_l2_error("set", "compress");
                None
            }
        }
    }

    /// Remove `key` from both tiers. Returns whether either tier held it.
    ///
    /// The L2 key is resolved like on write, so pass the same `region`
    /// option the entry was stored with.
    #[tracing::instrument(skip(self, options))]
    pub async fn delete(&self, key: &str, options: &CacheOptions) -> bool {
        let in_l1 = self.l1.delete(key);

        let in_l2 = match self.l2.as_ref() {
            Some(l2) => {
                let keys = [l2_key(self.region_for(options), key)];
                match self.circuit.call(|| l2.delete_many(&keys)).await {
                    Ok(n) => n > 0,
                    Err(e) => {
                        self.record_l2_error("delete", &e);
                        false
                    }
                }
            }
            None => false,
        };

        crate::metrics::record_operation("all", "delete", if in_l1 || in_l2 { "hit" } else { "miss" });
        in_l1 || in_l2
    }

    /// Drop everything in L1. L2 is left to expire on its own TTLs.
    pub fn clear(&self) {
        self.l1.clear();
        info!("L1 cleared");
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            l1: self.l1.stats(),
            l2_hits: self.counters.l2_hits.load(Ordering::Relaxed),
            l2_misses: self.counters.l2_misses.load(Ordering::Relaxed),
            l2_errors: self.counters.l2_errors.load(Ordering::Relaxed),
            fallback_runs: self.counters.fallback_runs.load(Ordering::Relaxed),
            fallback_errors: self.counters.fallback_errors.load(Ordering::Relaxed),
            circuit_rejections: self.circuit.rejections(),
            compression_saved_bytes: self.counters.compression_saved_bytes.load(Ordering::Relaxed),
        }
    }

    // --- Helpers ---

    pub(super) fn ttl_for(&self, options: &CacheOptions) -> Duration {
        match options.ttl {
            Some(ttl) if !ttl.is_zero() => ttl,
            Some(_) => {
                warn!("Zero TTL in options, using default");
                self.config.default_ttl()
            }
            None => self.config.default_ttl(),
        }
    }

    pub(super) fn region_for<'a>(&'a self, options: &'a CacheOptions) -> &'a str {
        match options.region.as_deref() {
            Some(region) if is_valid_region(region) => region,
            Some(region) => {
                warn!(region, "Invalid region in options, using configured region");
                &self.config.region
            }
            None => &self.config.region,
        }
    }

    pub(super) fn record_l2_error(&self, operation: &str, error: &CircuitError<crate::store::StorageError>) {
        match error {
            CircuitError::Rejected => {
                debug!(operation, "L2 skipped, circuit open");
                self.count_l2_error(operation, "circuit_open");
            }
            CircuitError::Inner(e) => {
                warn!(operation, error = %e, "L2 call failed");
                let kind = match e {
                    crate::store::StorageError::Unavailable(_) => "unavailable",
                    crate::store::StorageError::Corrupt { .. } => "corrupt",
                    crate::store::StorageError::Backend(_) => "backend",
                };
                self.count_l2_error(operation, kind);
            }
        }
    }

    fn count_l2_error(&self, operation: &str, kind: &str) {
        self.counters.l2_errors.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_operation("L2", operation, "error");
        crate::metrics::record_error("L2", operation, kind);
    }
}

#[cfg(feature = "compression")]
fn default_compressor() -> Option<Arc<dyn Compressor>> {
    Some(Arc::new(crate::compression::ZstdCompressor::default()))
}

#[cfg(not(feature = "compression"))]
fn default_compressor() -> Option<Arc<dyn Compressor>> {
    None
}

fn is_valid_region(region: &str) -> bool {
    !region.is_empty() && !region.contains(':') && region != "tag"
}

/// `{region}:{key}`
#[inline]
pub(super) fn l2_key(region: &str, key: &str) -> String {
    format!("{region}:{key}")
}

/// `tag:{tag}`
#[inline]
pub(super) fn tag_set_key(tag: &str) -> String {
    format!("tag:{tag}")
}

/// Logical key of an L2 key: everything after the first `:`.
#[inline]
pub(super) fn logical_key(l2_key: &str) -> &str {
    l2_key.split_once(':').map_or(l2_key, |(_, key)| key)
}

/// Whole seconds, rounded up, at least 1.
#[inline]
pub(super) fn l2_ttl_secs(ttl: Duration) -> u64 {
    let ms = ttl.as_millis();
    (ms.div_ceil(1000) as u64).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::store::MemoryDistributedStore;
    use std::sync::atomic::AtomicUsize;

    type Cache = TieredCache<String>;

    fn cache_with(l2: Option<Arc<MemoryDistributedStore>>, config: CacheConfig) -> Cache {
        let l2 = l2.map(|s| s as Arc<dyn DistributedStore>);
        TieredCache::new(config, l2, Arc::new(JsonCodec::new()))
    }

    fn two_tier() -> (Cache, Arc<MemoryDistributedStore>) {
        let l2 = Arc::new(MemoryDistributedStore::new());
        (cache_with(Some(l2.clone()), CacheConfig::default()), l2)
    }

    fn counting_fallback(
        calls: &Arc<AtomicUsize>,
        value: &str,
    ) -> impl FnOnce() -> futures::future::Ready<Result<String, String>> {
        let calls = calls.clone();
        let value = value.to_string();
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Ok(value))
        }
    }

    #[test]
    fn test_key_helpers() {
        assert_eq!(l2_key("cache", "company:1"), "cache:company:1");
        assert_eq!(tag_set_key("canton:ZH"), "tag:canton:ZH");
        assert_eq!(logical_key("cache:company:1"), "company:1");
        assert_eq!(l2_ttl_secs(Duration::from_millis(1)), 1);
        assert_eq!(l2_ttl_secs(Duration::from_millis(1000)), 1);
        assert_eq!(l2_ttl_secs(Duration::from_millis(1001)), 2);
        assert_eq!(l2_ttl_secs(Duration::from_secs(300)), 300);
    }

    #[tokio::test]
    async fn test_cold_path_runs_fallback_once() {
        let (cache, l2) = two_tier();
        let calls = Arc::new(AtomicUsize::new(0));
        let opts = CacheOptions::new();

        let v = cache.get("k", counting_fallback(&calls, "v"), &opts).await.unwrap();
        assert_eq!(v, "v");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(l2.get("cache:k").await.unwrap(), Some(b"\"v\"".to_vec()));

        let v = cache.get("k", counting_fallback(&calls, "other"), &opts).await.unwrap();
        assert_eq!(v, "v");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_set_then_get_skips_fallback() {
        let (cache, _l2) = two_tier();
        let calls = Arc::new(AtomicUsize::new(0));
        cache.set("k", "written".into(), &CacheOptions::new()).await;

        let v = cache.get("k", counting_fallback(&calls, "fresh"), &CacheOptions::new()).await.unwrap();
        assert_eq!(v, "written");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_l2_hit_populates_l1() {
        let (cache, l2) = two_tier();
        l2.set_with_ttl("cache:k", b"\"from-l2\"", 60).await.unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let v = cache.get("k", counting_fallback(&calls, "x"), &CacheOptions::new()).await.unwrap();
        assert_eq!(v, "from-l2");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(cache.l1().has("k"));
        assert_eq!(cache.stats().l2_hits, 1);
    }

    #[tokio::test]
    async fn test_corrupt_l2_payload_is_miss() {
        let (cache, l2) = two_tier();
        l2.set_with_ttl("cache:k", b"{not json", 60).await.unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let v = cache.get("k", counting_fallback(&calls, "fresh"), &CacheOptions::new()).await.unwrap();
        assert_eq!(v, "fresh");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().l2_errors, 1);
        // Overwritten with a good payload
        assert_eq!(l2.get("cache:k").await.unwrap(), Some(b"\"fresh\"".to_vec()));
    }

    #[tokio::test]
    async fn test_fallback_error_propagates_and_caches_nothing() {
        let (cache, l2) = two_tier();
        let result: Result<String, &str> = cache
            .get("k", || async { Err("upstream down") }, &CacheOptions::new())
            .await;

        assert_eq!(result, Err("upstream down"));
        assert!(!cache.l1().has("k"));
        assert_eq!(l2.get("cache:k").await.unwrap(), None);
        assert_eq!(cache.stats().fallback_errors, 1);
    }

    #[tokio::test]
    async fn test_l2_unavailable_still_serves_fallback() {
        let (cache, l2) = two_tier();
        l2.set_available(false);
        let calls = Arc::new(AtomicUsize::new(0));

        let v = cache.get("k", counting_fallback(&calls, "v"), &CacheOptions::new()).await.unwrap();
        assert_eq!(v, "v");
        assert!(cache.l1().has("k"));
        assert!(cache.stats().l2_errors >= 2, "failed get and failed set are both counted");
    }

    #[tokio::test]
    async fn test_l1_only_cache() {
        let cache = cache_with(None, CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        assert!(!cache.has_l2());
        cache.get("k", counting_fallback(&calls, "v"), &CacheOptions::new()).await.unwrap();
        cache.get("k", counting_fallback(&calls, "v"), &CacheOptions::new()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_l2_disabled_by_config() {
        let l2 = Arc::new(MemoryDistributedStore::new());
        let config = CacheConfig {
            l2_enabled: false,
            ..CacheConfig::default()
        };
        let cache = cache_with(Some(l2.clone()), config);
        cache.set("k", "v".into(), &CacheOptions::new()).await;

        assert!(!cache.has_l2());
        assert!(l2.is_empty());
    }

    #[tokio::test]
    async fn test_region_and_tags_in_l2() {
        let (cache, l2) = two_tier();
        let opts = CacheOptions::new().region("zefix").tag("canton:ZH");
        cache.set("CHE-1", "AG".into(), &opts).await;

        assert!(l2.get("zefix:CHE-1").await.unwrap().is_some());
        assert_eq!(l2.members_of_set("tag:canton:ZH").await.unwrap(), vec!["zefix:CHE-1"]);
    }

    #[tokio::test]
    async fn test_invalid_region_option_falls_back() {
        let (cache, l2) = two_tier();
        cache.set("k", "v".into(), &CacheOptions::new().region("bad:region")).await;
        assert!(l2.get("cache:k").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_l2_ttl_rounds_up_to_seconds() {
        let (cache, l2) = two_tier();
        cache.set("k", "v".into(), &CacheOptions::new().ttl(Duration::from_millis(1500))).await;
        assert_eq!(l2.ttl_of("cache:k"), Some(Duration::from_secs(2)));
    }

    #[cfg(feature = "compression")]
    #[tokio::test]
    async fn test_compression_threshold() {
        let l2 = Arc::new(MemoryDistributedStore::new());
        let config = CacheConfig {
            compress: true,
            compress_threshold_bytes: 64,
            ..CacheConfig::default()
        };
        let cache = cache_with(Some(l2.clone()), config);

        cache.set("small", "tiny".into(), &CacheOptions::new()).await;
        cache.set("big", "x".repeat(1000), &CacheOptions::new()).await;

        let small = l2.get("cache:small").await.unwrap().unwrap();
        let big = l2.get("cache:big").await.unwrap().unwrap();
        assert!(!is_zstd(&small));
        assert!(is_zstd(&big));
        assert!(big.len() < 1000);

        cache.clear();
        let v = cache.peek("big", &CacheOptions::new()).await;
        assert_eq!(v, Some("x".repeat(1000)));
    }

    /// Run-length encoding behind a 4-byte marker; anything else passes through.
    struct RleCompressor;

    const RLE_MAGIC: &[u8] = b"RLE1";

    impl Compressor for RleCompressor {
        fn name(&self) -> &'static str {
            "rle"
        }

        fn compress(&self, data: &[u8]) -> Result<Vec<u8>, crate::compression::CompressionError> {
            let mut out = RLE_MAGIC.to_vec();
            let mut iter = data.iter().peekable();
            while let Some(&byte) = iter.next() {
                let mut run = 1u8;
                while run < u8::MAX && iter.peek() == Some(&&byte) {
                    iter.next();
                    run += 1;
                }
                out.extend_from_slice(&[run, byte]);
            }
            Ok(out)
        }

        fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, crate::compression::CompressionError> {
            let Some(body) = data.strip_prefix(RLE_MAGIC) else {
                return Ok(data.to_vec());
            };
            if body.len() % 2 != 0 {
                return Err(crate::compression::CompressionError::DecompressFailed("odd run table".into()));
            }
            Ok(body
                .chunks(2)
                .flat_map(|pair| std::iter::repeat(pair[1]).take(usize::from(pair[0])))
                .collect())
        }

        fn is_compressed(&self, data: &[u8]) -> bool {
            data.starts_with(RLE_MAGIC)
        }
    }

    #[tokio::test]
    async fn test_custom_compressor_reads_back_from_l2() {
        let l2 = Arc::new(MemoryDistributedStore::new());
        let config = CacheConfig {
            compress: true,
            compress_threshold_bytes: 16,
            ..CacheConfig::default()
        };
        let cache = cache_with(Some(l2.clone()), config).with_compressor(Arc::new(RleCompressor));
        let value = "x".repeat(100);

        cache.set("big", value.clone(), &CacheOptions::new()).await;
        let raw = l2.get("cache:big").await.unwrap().unwrap();
        assert!(raw.starts_with(RLE_MAGIC));
        assert!(!is_zstd(&raw));

        cache.clear();
        assert_eq!(cache.peek("big", &CacheOptions::new()).await, Some(value));

        let stats = cache.stats();
        assert_eq!(stats.l2_errors, 0);
        assert_eq!(stats.l2_hits, 1);
        // JSON string of 100 chars is 102 bytes before compression
        assert_eq!(stats.compression_saved_bytes, 102 - raw.len() as u64);
    }

    #[tokio::test]
    async fn test_custom_compressor_rejects_corrupt_frame() {
        let l2 = Arc::new(MemoryDistributedStore::new());
        l2.set_with_ttl("cache:k", b"RLE1\x03", 60).await.unwrap();
        let cache = cache_with(Some(l2), CacheConfig::default()).with_compressor(Arc::new(RleCompressor));

        assert_eq!(cache.peek("k", &CacheOptions::new()).await, None);
        assert_eq!(cache.stats().l2_errors, 1);
    }

    #[tokio::test]
    async fn test_delete_both_tiers() {
        let (cache, l2) = two_tier();
        cache.set("k", "v".into(), &CacheOptions::new()).await;

        assert!(cache.delete("k", &CacheOptions::new()).await);
        assert!(!cache.l1().has("k"));
        assert_eq!(l2.get("cache:k").await.unwrap(), None);
        assert!(!cache.delete("k", &CacheOptions::new()).await);
    }

    #[tokio::test]
    async fn test_delete_in_region_removes_l2_copy() {
        let (cache, l2) = two_tier();
        let zefix = CacheOptions::new().region("zefix");
        cache.set("k", "old".into(), &zefix).await;
        assert!(l2.get("zefix:k").await.unwrap().is_some());

        assert!(cache.delete("k", &zefix).await);
        assert_eq!(l2.get("zefix:k").await.unwrap(), None);

        let calls = Arc::new(AtomicUsize::new(0));
        let value = cache.get("k", counting_fallback(&calls, "fresh"), &zefix).await;
        assert_eq!(value.as_deref(), Ok("fresh"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tag_set_expires_with_entries() {
        let (cache, l2) = two_tier();
        let long = CacheOptions::new().ttl(Duration::from_secs(600)).tag("company");
        let short = CacheOptions::new().ttl(Duration::from_secs(60)).tag("company");

        cache.set("a", "1".into(), &long).await;
        cache.set("b", "2".into(), &short).await;
        assert_eq!(l2.ttl_of("tag:company"), Some(Duration::from_secs(600)));

        tokio::time::advance(Duration::from_secs(600)).await;
        assert!(l2.members_of_set("tag:company").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_is_l1_only_and_idempotent() {
        let (cache, l2) = two_tier();
        cache.set("k", "v".into(), &CacheOptions::new()).await;

        cache.clear();
        assert_eq!(cache.stats().l1.size, 0);
        cache.clear();
        assert_eq!(cache.stats().l1.size, 0);
        assert!(l2.get("cache:k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_peek_never_runs_fallback() {
        let (cache, _l2) = two_tier();
        assert_eq!(cache.peek("missing", &CacheOptions::new()).await, None);
        assert_eq!(cache.stats().fallback_runs, 0);
    }
}
