// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process [`DistributedStore`] for tests and single-node deployments.
//!
//! Mirrors the Redis semantics the orchestrator relies on: string values
//! and sets with an expiry, and glob scans over both. An availability
//! switch makes every call fail with [`StorageError::Unavailable`] so
//! degraded-L2 behaviour can be exercised without a real outage.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use super::pattern::glob_match;
use super::traits::{DistributedStore, StorageError};

#[derive(Debug, Clone)]
enum Slot {
    Value { bytes: Vec<u8>, expires_at: Instant },
    Set { members: HashSet<String>, expires_at: Instant },
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        match self {
            Slot::Value { expires_at, .. } => now < *expires_at,
            Slot::Set { members, expires_at } => !members.is_empty() && now < *expires_at,
        }
    }
}

pub struct MemoryDistributedStore {
    data: DashMap<String, Slot>,
    available: AtomicBool,
    operations: AtomicU64,
}

impl MemoryDistributedStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
            available: AtomicBool::new(true),
            operations: AtomicU64::new(0),
        }
    }

    /// Toggle simulated availability.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Number of trait calls made, including rejected ones.
    #[must_use]
    pub fn operations(&self) -> u64 {
        self.operations.load(Ordering::SeqCst)
    }

    /// Number of live keys (values and sets).
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.data.iter().filter(|e| e.value().is_live(now)).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys present regardless of liveness, sorted. Test helper.
    #[must_use]
    pub fn raw_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.data.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Remaining TTL of a live value or set.
    #[must_use]
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let slot = self.data.get(key)?;
        if !slot.is_live(now) {
            return None;
        }
        match slot.value() {
            Slot::Value { expires_at, .. } | Slot::Set { expires_at, .. } => Some(*expires_at - now),
        }
    }

    pub fn clear(&self) {
        self.data.clear();
    }

    fn enter(&self, op: &str) -> Result<(), StorageError> {
        self.operations.fetch_add(1, Ordering::SeqCst);
        if self.is_available() {
            Ok(())
        } else {
            Err(StorageError::Unavailable(format!("memory store offline ({op})")))
        }
    }
}

impl Default for MemoryDistributedStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DistributedStore for MemoryDistributedStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.enter("get")?;
        let now = Instant::now();

        let expired = match self.data.get(key).as_deref() {
            None => return Ok(None),
            Some(Slot::Value { bytes, expires_at }) if now < *expires_at => return Ok(Some(bytes.clone())),
            Some(Slot::Value { .. }) => true,
            Some(Slot::Set { .. }) => {
                return Err(StorageError::Backend(format!("WRONGTYPE '{key}' holds a set")));
            }
        };
        if expired {
            self.data.remove(key);
        }
        Ok(None)
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl_secs: u64) -> Result<(), StorageError> {
        self.enter("set")?;
        let expires_at = Instant::now() + Duration::from_secs(ttl_secs.max(1));
        self.data.insert(
            key.to_string(),
            Slot::Value {
                bytes: value.to_vec(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64, StorageError> {
        self.enter("delete")?;
        let now = Instant::now();
        let removed = keys
            .iter()
            .filter_map(|k| self.data.remove(k))
            .filter(|(_, slot)| slot.is_live(now))
            .count();
        Ok(removed as u64)
    }

    async fn members_of_set(&self, set_key: &str) -> Result<Vec<String>, StorageError> {
        self.enter("smembers")?;
        let now = Instant::now();
        let expired = match self.data.get(set_key).as_deref() {
            None => return Ok(Vec::new()),
            Some(Slot::Set { members, expires_at }) if now < *expires_at => {
                return Ok(members.iter().cloned().collect());
            }
            Some(Slot::Set { .. }) => true,
            Some(Slot::Value { .. }) => {
                return Err(StorageError::Backend(format!("WRONGTYPE '{set_key}' holds a value")));
            }
        };
        if expired {
            self.data.remove(set_key);
        }
        Ok(Vec::new())
    }

    async fn add_to_set(&self, set_key: &str, member: &str, ttl_secs: u64) -> Result<(), StorageError> {
        self.enter("sadd")?;
        let now = Instant::now();
        let until = now + Duration::from_secs(ttl_secs.max(1));
        let mut slot = self.data.entry(set_key.to_string()).or_insert_with(|| Slot::Set {
            members: HashSet::new(),
            expires_at: until,
        });
        match slot.value_mut() {
            Slot::Set { members, expires_at } => {
                if now >= *expires_at {
                    members.clear();
                }
                members.insert(member.to_string());
                *expires_at = (*expires_at).max(until);
                Ok(())
            }
            Slot::Value { .. } => Err(StorageError::Backend(format!("WRONGTYPE '{set_key}' holds a value"))),
        }
    }

    async fn scan_by_pattern(&self, pattern: &str) -> Result<Vec<String>, StorageError> {
        self.enter("scan")?;
        let now = Instant::now();
        Ok(self
            .data
            .iter()
            .filter(|e| e.value().is_live(now) && glob_match(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect())
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.enter("ping")
    }
}
