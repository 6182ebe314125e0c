// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt value for '{key}': {reason}")]
    Corrupt { key: String, reason: String },
}

/// The narrow contract the orchestrator needs from an L2 key-value service.
///
/// Keys handed to an implementation are already namespaced
/// (`region:key`, `tag:{tag}`). Values are opaque bytes.
#[async_trait]
pub trait DistributedStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Write `value` expiring after `ttl_secs` (at least 1).
    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl_secs: u64) -> Result<(), StorageError>;

    /// Delete `keys`; returns how many existed.
    async fn delete_many(&self, keys: &[String]) -> Result<u64, StorageError>;

    async fn members_of_set(&self, set_key: &str) -> Result<Vec<String>, StorageError>;

    /// Add `member` and keep the set alive for at least `ttl_secs` (at
    /// least 1). An existing longer expiry is never shortened.
    async fn add_to_set(&self, set_key: &str, member: &str, ttl_secs: u64) -> Result<(), StorageError>;

    /// All keys matching a Redis-style glob. Implementations iterate with a
    /// cursor rather than blocking the server.
    async fn scan_by_pattern(&self, pattern: &str) -> Result<Vec<String>, StorageError>;

    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
