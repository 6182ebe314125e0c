// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bulk invalidation by tag or key pattern.
//!
//! Both tiers are searched and both are cleared. The L2 side goes first so
//! keys written by other instances (present in the L2 tag set but missing
//! from this instance's tag index) are also dropped from L1. An L2 failure
//! is logged and the L1 side still runs.

use std::collections::HashSet;

use tracing::{info, warn};

use super::{l2_key, logical_key, tag_set_key, CacheOptions, InvalidationKind, TieredCache};

impl<V> TieredCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Invalidate every key carrying tag `target`, or matching glob
    /// `target`, in both tiers.
    ///
    /// Returns the number of distinct logical keys found in either tier.
    pub async fn invalidate(&self, target: &str, kind: InvalidationKind) -> usize {
        self.invalidate_with(target, kind, &CacheOptions::new()).await
    }

    /// [`invalidate`](Self::invalidate) with per-call options. A pattern is
    /// scanned under `options.region`; tag sets are shared by all regions.
    #[tracing::instrument(skip(self, options))]
    pub async fn invalidate_with(&self, target: &str, kind: InvalidationKind, options: &CacheOptions) -> usize {
        let mut keys: HashSet<String> = HashSet::new();

        let from_l2 = match kind {
            InvalidationKind::Tag => self.invalidate_l2_tag(target).await,
            InvalidationKind::Pattern => self.invalidate_l2_pattern(target, self.region_for(options)).await,
        };
        self.l1.delete_many(from_l2.iter().map(String::as_str));
        keys.extend(from_l2);

        let from_l1 = match kind {
            InvalidationKind::Tag => self.l1.invalidate_tag(target),
            InvalidationKind::Pattern => {
                let matched = self.l1.keys_matching(target);
                self.l1.delete_many(matched.iter().map(String::as_str));
                matched
            }
        };
        keys.extend(from_l1);

        let count = keys.len();
        crate::metrics::record_invalidation(kind.as_str(), count);
        info!(kind = %kind, target, keys = count, "Cache invalidated");
        count
    }

    /// [`invalidate`](Self::invalidate) by tag.
    pub async fn invalidate_tag(&self, tag: &str) -> usize {
        self.invalidate(tag, InvalidationKind::Tag).await
    }

    /// [`invalidate`](Self::invalidate) by Redis-style glob.
    pub async fn invalidate_pattern(&self, pattern: &str) -> usize {
        self.invalidate(pattern, InvalidationKind::Pattern).await
    }

    /// Delete the tag's members and the tag set itself; returns logical keys.
    async fn invalidate_l2_tag(&self, tag: &str) -> Vec<String> {
        let Some(l2) = self.l2.as_ref() else {
            return Vec::new();
        };
        let set_key = tag_set_key(tag);

        let members = match self.circuit.call(|| l2.members_of_set(&set_key)).await {
            Ok(members) => members,
            Err(e) => {
                self.record_l2_error("invalidate", &e);
                return Vec::new();
            }
        };

        let logical: Vec<String> = members.iter().map(|m| logical_key(m).to_string()).collect();
        let mut doomed = members;
        doomed.push(set_key);
        if let Err(e) = self.circuit.call(|| l2.delete_many(&doomed)).await {
            warn!(tag, "L2 tag invalidation incomplete, entries will expire by TTL");
            self.record_l2_error("invalidate", &e);
        }
        logical
    }

    /// Delete every L2 key under `{region}:{pattern}`; returns logical keys.
    async fn invalidate_l2_pattern(&self, pattern: &str, region: &str) -> Vec<String> {
        let Some(l2) = self.l2.as_ref() else {
            return Vec::new();
        };
        let namespaced = l2_key(region, pattern);

        let found = match self.circuit.call(|| l2.scan_by_pattern(&namespaced)).await {
            Ok(found) => found,
            Err(e) => {
                self.record_l2_error("invalidate", &e);
                return Vec::new();
            }
        };
        if found.is_empty() {
            return Vec::new();
        }

        if let Err(e) = self.circuit.call(|| l2.delete_many(&found)).await {
            warn!(pattern, "L2 pattern invalidation incomplete, entries will expire by TTL");
            self.record_l2_error("invalidate", &e);
        }
        found.iter().map(|k| logical_key(k).to_string()).collect()
    }
}
