// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the cache, the rate limiter and the warming scheduler.
//!
//! # Example
//!
//! ```
//! use tiered_cache::CacheConfig;
//!
//! // Minimal config (uses defaults)
//! let config = CacheConfig::default();
//! assert_eq!(config.max_size, 1_000);
//! assert_eq!(config.default_ttl_ms, 300_000); // 5 minutes
//!
//! // Per-service config
//! let config = CacheConfig {
//!     region: "zefix".into(),
//!     max_size: 5_000,
//!     compress: true,
//!     ..Default::default()
//! };
//! assert!(config.compress);
//! ```

use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

/// Configuration for a [`TieredCache`](crate::TieredCache).
///
/// All fields have sensible defaults. Invalid values are never fatal:
/// [`validated()`](Self::validated) swaps them for defaults and logs a warning.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Cache-wide TTL in milliseconds, overridable per entry (default: 5 min)
    #[serde(default = "default_ttl_ms")]
    pub default_ttl_ms: u64,

    /// L1 capacity in entries (default: 1000)
    #[serde(default = "default_max_size")]
    pub max_size: usize,

    /// L2 namespace prefix; L2 keys are `region:key` (default: "cache")
    #[serde(default = "default_region")]
    pub region: String,

    /// Interval of the L1 expiry sweep in milliseconds (default: 1 min)
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Compress large L2 payloads (default: off)
    #[serde(default)]
    pub compress: bool,

    /// Minimum encoded size before compression kicks in (default: 1 KB)
    #[serde(default = "default_compress_threshold_bytes")]
    pub compress_threshold_bytes: usize,

    /// Use the L2 tier when one is attached (default: on)
    #[serde(default = "default_true")]
    pub l2_enabled: bool,

    /// Coalesce concurrent cold misses for the same key (default: off)
    #[serde(default)]
    pub coalesce_misses: bool,
}

fn default_ttl_ms() -> u64 { 300_000 }
fn default_max_size() -> usize { 1_000 }
fn default_region() -> String { "cache".to_string() }
fn default_sweep_interval_ms() -> u64 { 60_000 }
fn default_compress_threshold_bytes() -> usize { 1024 }
fn default_true() -> bool { true }

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: default_ttl_ms(),
            max_size: default_max_size(),
            region: default_region(),
            sweep_interval_ms: default_sweep_interval_ms(),
            compress: false,
            compress_threshold_bytes: default_compress_threshold_bytes(),
            l2_enabled: true,
            coalesce_misses: false,
        }
    }
}

impl CacheConfig {
    /// Parse a config from JSON; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Replace invalid values with defaults, logging each substitution.
    #[must_use]
    pub fn validated(mut self) -> Self {
        if self.default_ttl_ms == 0 {
            warn!(default = default_ttl_ms(), "default_ttl_ms is 0, using default");
            self.default_ttl_ms = default_ttl_ms();
        }
        if self.max_size == 0 {
            warn!(default = default_max_size(), "max_size is 0, using default");
            self.max_size = default_max_size();
        }
        if self.region.is_empty() || self.region.contains(':') || self.region == "tag" {
            warn!(region = %self.region, "invalid cache region, using default");
            self.region = default_region();
        }
        if self.sweep_interval_ms == 0 {
            warn!("sweep_interval_ms is 0, using default");
            self.sweep_interval_ms = default_sweep_interval_ms();
        }
        self
    }

    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Configuration for a [`RateLimiter`](crate::RateLimiter).
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Window length in milliseconds (default: 1 min)
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Requests allowed per window (default: 100)
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,

    /// Interval of the expired-record sweep in milliseconds (default: 1 min)
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

fn default_window_ms() -> u64 { 60_000 }
fn default_max_requests() -> u32 { 100 }

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            max_requests: default_max_requests(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl RateLimitConfig {
    /// Parse a config from JSON; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Replace invalid values with defaults, logging each substitution.
    #[must_use]
    pub fn validated(mut self) -> Self {
        if self.window_ms == 0 {
            warn!(default = default_window_ms(), "window_ms is 0, using default");
            self.window_ms = default_window_ms();
        }
        if self.sweep_interval_ms == 0 {
            warn!("sweep_interval_ms is 0, using default");
            self.sweep_interval_ms = default_sweep_interval_ms();
        }
        self
    }

    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Configuration for a [`CacheWarmer`](crate::CacheWarmer).
#[derive(Debug, Clone, Deserialize)]
pub struct WarmingConfig {
    /// Re-warm interval in milliseconds (default: 1 hour)
    #[serde(default = "default_warm_interval_ms")]
    pub interval_ms: u64,

    /// Warm immediately when the scheduler starts (default: on)
    #[serde(default = "default_true")]
    pub warm_on_start: bool,
}

fn default_warm_interval_ms() -> u64 { 3_600_000 }

impl Default for WarmingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_warm_interval_ms(),
            warm_on_start: true,
        }
    }
}

impl WarmingConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        if self.interval_ms == 0 {
            warn!("warming interval_ms is 0, using default");
            return Duration::from_millis(default_warm_interval_ms());
        }
        Duration::from_millis(self.interval_ms)
    }
}
