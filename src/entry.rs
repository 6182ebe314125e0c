// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache entry data structure.
//!
//! A [`CacheEntry`] owns its value exclusively. Values are cloned on the way
//! in and out of the store and serialized through a codec on the way to L2,
//! so no reference is ever shared between tiers.

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::time::Instant;

/// A single L1 entry with its TTL and tags.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use tiered_cache::CacheEntry;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let entry = CacheEntry::new("canton:ZH".to_string(), "Zürich", Duration::from_secs(60), vec![]);
/// assert!(entry.is_live_at(entry.created_at));
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    /// Instant of the last write
    pub created_at: Instant,
    pub ttl: Duration,
    pub tags: BTreeSet<String>,
}

impl<V> CacheEntry<V> {
    pub fn new(key: String, value: V, ttl: Duration, tags: impl IntoIterator<Item = String>) -> Self {
        Self {
            key,
            value,
            created_at: Instant::now(),
            ttl,
            tags: tags.into_iter().collect(),
        }
    }

    /// An entry is live iff `now - created_at < ttl`.
    #[inline]
    #[must_use]
    pub fn is_live_at(&self, now: Instant) -> bool {
        self.age(now) < self.ttl
    }

    #[inline]
    #[must_use]
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    /// Time left before expiry (zero once expired).
    #[must_use]
    pub fn remaining_ttl(&self, now: Instant) -> Duration {
        self.ttl.saturating_sub(self.age(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_liveness_boundary() {
        let entry = CacheEntry::new("k".into(), 1u32, Duration::from_millis(100), vec![]);
        let start = entry.created_at;

        assert!(entry.is_live_at(start));
        assert!(entry.is_live_at(start + Duration::from_millis(99)));
        assert!(!entry.is_live_at(start + Duration::from_millis(100)));
        assert!(!entry.is_live_at(start + Duration::from_millis(101)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_ttl_saturates() {
        let entry = CacheEntry::new("k".into(), (), Duration::from_millis(100), vec![]);
        let start = entry.created_at;

        assert_eq!(entry.remaining_ttl(start + Duration::from_millis(40)), Duration::from_millis(60));
        assert_eq!(entry.remaining_ttl(start + Duration::from_secs(5)), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tags_are_deduplicated() {
        let entry = CacheEntry::new(
            "k".into(),
            (),
            Duration::from_secs(1),
            vec!["swiss".to_string(), "swiss".to_string(), "post".to_string()],
        );
        assert_eq!(entry.tags.len(), 2);
    }
}
