// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fixed-window rate limiter.
//!
//! Each identity (IP, API key, tenant) gets a counter that resets when its
//! window elapses:
//!
//! ```text
//! no record, or now >= reset_at  →  count = 1, reset_at = now + window
//! otherwise                       →  count += 1
//! count > max_requests            →  RateLimitExceeded { retry_after = reset_at - now }
//! ```
//!
//! Up to twice the limit can pass across a window boundary; that is the
//! accepted cost of O(1) state per identity.
//!
//! Records live in a `DashMap`, so a check only contends with checks for
//! identities on the same shard. Expired records behave exactly like absent
//! ones and are dropped by [`RateLimiter::sweep_expired`], which
//! [`RateLimiter::start`] runs periodically.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::RateLimitConfig;
use crate::task::PeriodicTask;

#[derive(Debug, Clone, Copy)]
struct RateLimitRecord {
    count: u32,
    window_start: Instant,
    reset_at: Instant,
}

impl RateLimitRecord {
    fn open(now: Instant, window: Duration) -> Self {
        Self {
            count: 0,
            window_start: now,
            reset_at: now + window,
        }
    }
}

/// Quota state returned with every decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub limit: u32,
    pub remaining: u32,
    /// Time until the current window closes
    pub reset_after: Duration,
    /// Set only when the request was rejected
    pub retry_after: Option<Duration>,
}

impl RateLimitInfo {
    /// Standard response headers. Seconds are rounded up; `Retry-After` is
    /// at least 1 and only present on rejection.
    ///
    /// ```
    /// use std::time::Duration;
    /// use tiered_cache::RateLimitInfo;
    ///
    /// let info = RateLimitInfo {
    ///     limit: 100,
    ///     remaining: 0,
    ///     reset_after: Duration::from_millis(1500),
    ///     retry_after: Some(Duration::from_millis(1500)),
    /// };
    /// assert_eq!(
    ///     info.header_pairs(),
    ///     vec![
    ///         ("X-RateLimit-Limit", "100".to_string()),
    ///         ("X-RateLimit-Remaining", "0".to_string()),
    ///         ("X-RateLimit-Reset", "2".to_string()),
    ///         ("Retry-After", "2".to_string()),
    ///     ]
    /// );
    /// ```
    #[must_use]
    pub fn header_pairs(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", ceil_secs(self.reset_after).to_string()),
        ];
        if let Some(retry_after) = self.retry_after {
            headers.push(("Retry-After", retry_after_secs(&retry_after).to_string()));
        }
        headers
    }
}

fn ceil_secs(d: Duration) -> u64 {
    d.as_millis().div_ceil(1000) as u64
}

fn retry_after_secs(d: &Duration) -> u64 {
    ceil_secs(*d).max(1)
}

/// The request exceeded its identity's quota.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("rate limit of {} requests exceeded, retry after {}s", .info.limit, retry_after_secs(.retry_after))]
pub struct RateLimitExceeded {
    pub info: RateLimitInfo,
    pub retry_after: Duration,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    records: DashMap<String, RateLimitRecord>,
    sweeper: Mutex<Option<PeriodicTask>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config: config.validated(),
            records: DashMap::new(),
            sweeper: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Count one request for `identity` and decide.
    pub fn check(&self, identity: &str) -> Result<RateLimitInfo, RateLimitExceeded> {
        let now = Instant::now();
        let window = self.config.window();
        let limit = self.config.max_requests;

        let (count, reset_at) = {
            let mut record = self
                .records
                .entry(identity.to_string())
                .or_insert_with(|| RateLimitRecord::open(now, window));
            if now >= record.reset_at {
                *record = RateLimitRecord::open(now, window);
            }
            record.count = record.count.saturating_add(1);
            (record.count, record.reset_at)
        };

        let reset_after = reset_at.saturating_duration_since(now);
        if count > limit {
            crate::metrics::record_rate_limit(false);
            debug!(identity, count, limit, "Rate limit exceeded");
            let info = RateLimitInfo {
                limit,
                remaining: 0,
                reset_after,
                retry_after: Some(reset_after),
            };
            return Err(RateLimitExceeded {
                info,
                retry_after: reset_after,
            });
        }

        crate::metrics::record_rate_limit(true);
        Ok(RateLimitInfo {
            limit,
            remaining: limit - count,
            reset_after,
            retry_after: None,
        })
    }

    /// Forget `identity`; its next request opens a fresh window.
    pub fn reset(&self, identity: &str) -> bool {
        self.records.remove(identity).is_some()
    }

    /// Identities with a record, expired or not.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.records.len()
    }

    /// Start of the current window for `identity`, if it has a live record.
    #[must_use]
    pub fn window_start(&self, identity: &str) -> Option<Instant> {
        let now = Instant::now();
        self.records
            .get(identity)
            .filter(|r| now < r.reset_at)
            .map(|r| r.window_start)
    }

    /// Drop every record whose window has closed; returns how many.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.records.len();
        self.records.retain(|_, record| now < record.reset_at);
        let removed = before.saturating_sub(self.records.len());
        crate::metrics::set_rate_limit_records(self.records.len());
        if removed > 0 {
            debug!(removed, "Rate limit sweep removed expired records");
        }
        removed
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every `sweep_interval_ms`.
    pub fn start(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }
        let limiter: Weak<Self> = Arc::downgrade(self);
        *sweeper = Some(PeriodicTask::spawn(
            "rate-limit-sweep",
            self.config.sweep_interval(),
            false,
            move || {
                let limiter = limiter.clone();
                async move {
                    if let Some(limiter) = limiter.upgrade() {
                        limiter.sweep_expired();
                    }
                }
            },
        ));
        info!(
            window_ms = self.config.window_ms,
            max_requests = self.config.max_requests,
            "Rate limiter started"
        );
    }

    pub async fn shutdown(&self) {
        let task = self.sweeper.lock().take();
        if let Some(task) = task {
            task.stop().await;
        }
    }
}

type KeyGenerator<R> = Box<dyn Fn(&R) -> String + Send + Sync>;
type SkipPredicate<R> = Box<dyn Fn(&R) -> bool + Send + Sync>;

/// A [`RateLimiter`] that derives the identity from a request.
///
/// ```
/// use std::sync::Arc;
/// use tiered_cache::{KeyedRateLimiter, RateLimitConfig, RateLimiter};
///
/// struct Request { ip: String, path: String }
///
/// let limiter = KeyedRateLimiter::new(
///     Arc::new(RateLimiter::new(RateLimitConfig::default())),
///     |req: &Request| req.ip.clone(),
/// )
/// .skip_if(|req: &Request| req.path == "/health");
///
/// let health = Request { ip: "10.0.0.1".into(), path: "/health".into() };
/// assert_eq!(limiter.check(&health).unwrap(), None);
/// ```
pub struct KeyedRateLimiter<R> {
    limiter: Arc<RateLimiter>,
    key_generator: KeyGenerator<R>,
    skip: Option<SkipPredicate<R>>,
}

impl<R> KeyedRateLimiter<R> {
    pub fn new<K>(limiter: Arc<RateLimiter>, key_generator: K) -> Self
    where
        K: Fn(&R) -> String + Send + Sync + 'static,
    {
        Self {
            limiter,
            key_generator: Box::new(key_generator),
            skip: None,
        }
    }

    /// Requests matching `predicate` pass without being counted.
    #[must_use]
    pub fn skip_if<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&R) -> bool + Send + Sync + 'static,
    {
        self.skip = Some(Box::new(predicate));
        self
    }

    /// `Ok(None)` for skipped requests, otherwise the limiter's decision.
    pub fn check(&self, request: &R) -> Result<Option<RateLimitInfo>, RateLimitExceeded> {
        if self.skip.as_ref().is_some_and(|skip| skip(request)) {
            return Ok(None);
        }
        let identity = (self.key_generator)(request);
        self.limiter.check(&identity).map(Some)
    }

    #[must_use]
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }
}
