// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Tiered Cache
//!
//! A two-tier read-through cache for services that front slow upstream
//! lookups, plus the fixed-window rate limiter that usually sits next to it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 TieredCache::get(key, fallback)             │
//! │  • Optional miss coalescing (one fallback per cold key)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  L1: ExpiringStore (in-process)             │
//! │  • Per-entry TTL, true LRU at max_size                      │
//! │  • Tag index for bulk invalidation                          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ miss
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              L2: DistributedStore (Redis / memory)          │
//! │  • {region}:{key} payloads, tag:{tag} member sets           │
//! │  • Codec + zstd above a size threshold                      │
//! │  • Circuit breaker; every failure degrades to a miss        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ miss
//!                              ▼
//!                   caller's fallback, written through
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tiered_cache::{CacheConfig, CacheOptions, DistributedStore, JsonCodec, RedisStore, TieredCache};
//!
//! #[tokio::main]
//! async fn main() {
//!     let redis = RedisStore::new("redis://localhost:6379").await.expect("redis");
//!     let l2: Arc<dyn DistributedStore> = Arc::new(redis);
//!
//!     let cache: TieredCache<String> =
//!         TieredCache::new(CacheConfig::default(), Some(l2), Arc::new(JsonCodec::new()));
//!     cache.start();
//!
//!     let options = CacheOptions::new().ttl(Duration::from_secs(600)).tag("company");
//!     let name = cache
//!         .get("company:CHE-123", || async { Ok::<_, String>("Acme AG".to_string()) }, &options)
//!         .await
//!         .expect("lookup");
//!     println!("{name}");
//!
//!     cache.invalidate_tag("company").await;
//!     cache.shutdown().await;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`orchestrator`]: [`TieredCache`], read-through, write-through, invalidation
//! - [`store`]: L1 [`ExpiringStore`] and the L2 [`DistributedStore`] backends
//! - [`warming`]: [`CacheWarmer`] for scheduled preloading
//! - [`rate_limit`]: fixed-window [`RateLimiter`]
//! - [`resilience`]: circuit breaker and retry policies
//! - [`codec`], [`compression`]: L2 payload encoding

pub mod codec;
pub mod compression;
pub mod config;
pub mod entry;
pub mod metrics;
pub mod orchestrator;
pub mod rate_limit;
pub mod resilience;
pub mod store;
pub mod task;
pub mod warming;

pub use codec::{Codec, CodecError, JsonCodec};
#[cfg(feature = "compression")]
pub use compression::ZstdCompressor;
pub use compression::{compress_with_stats, CompressionError, CompressionStats, Compressor};
pub use config::{CacheConfig, RateLimitConfig, WarmingConfig};
pub use entry::CacheEntry;
pub use orchestrator::{CacheOptions, CacheState, CacheStats, InvalidationKind, TieredCache};
pub use rate_limit::{KeyedRateLimiter, RateLimitExceeded, RateLimitInfo, RateLimiter};
pub use resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
pub use resilience::retry::RetryConfig;
pub use store::{DistributedStore, ExpiringStore, MemoryDistributedStore, RedisStore, StorageError, StoreStats};
pub use task::PeriodicTask;
pub use warming::{BoxError, CacheWarmer, WarmReport, WarmTask};
