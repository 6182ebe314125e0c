// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the tiered cache.

use std::time::Duration;

use crate::store::StoreStats;

/// Per-call overrides for a read-through or write.
///
/// ```
/// use std::time::Duration;
/// use tiered_cache::CacheOptions;
///
/// let opts = CacheOptions::new()
///     .ttl(Duration::from_secs(3600))
///     .tag("canton:ZH")
///     .tag("companies")
///     .region("zefix");
/// assert_eq!(opts.tags.len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheOptions {
    /// Falls back to `CacheConfig::default_ttl_ms`
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
    /// L2 namespace; falls back to `CacheConfig::region`
    pub region: Option<String>,
    /// Falls back to `CacheConfig::compress`
    pub compress: Option<bool>,
}

impl CacheOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    #[must_use]
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    #[must_use]
    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = Some(compress);
        self
    }
}

/// How `invalidate` interprets its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationKind {
    /// Every key carrying the tag
    Tag,
    /// Every key matching a Redis-style glob
    Pattern,
}

impl InvalidationKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tag => "tag",
            Self::Pattern => "pattern",
        }
    }
}

impl std::fmt::Display for InvalidationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of the background sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Created,
    Running,
    Stopped,
}

impl std::fmt::Display for CacheState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Running => write!(f, "Running"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Snapshot of cache activity since construction.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub l1: StoreStats,
    pub l2_hits: u64,
    pub l2_misses: u64,
    /// L2 failures, decode failures and circuit rejections
    pub l2_errors: u64,
    pub fallback_runs: u64,
    pub fallback_errors: u64,
    /// Circuit breaker rejections, a subset of `l2_errors`
    pub circuit_rejections: u64,
    /// Bytes saved by compressing L2 payloads
    pub compression_saved_bytes: u64,
}

impl CacheStats {
    /// Fraction of lookups answered by either tier (0.0 - 1.0).
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let hits = self.l1.hits + self.l2_hits;
        let total = self.l1.hits + self.l1.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}
