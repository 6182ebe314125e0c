// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis implementation of the L2 [`DistributedStore`].
//!
//! | Operation         | Command                          |
//! |-------------------|----------------------------------|
//! | `get`             | `GET key`                        |
//! | `set_with_ttl`    | `SET key value EX ttl`           |
//! | `delete_many`     | `DEL k1 k2 ...`                  |
//! | `members_of_set`  | `SMEMBERS tag:{tag}`             |
//! | `add_to_set`      | `SADD` + `EXPIRE` (Lua, see below) |
//! | `scan_by_pattern` | `SCAN cursor MATCH p COUNT 500`  |
//! | `ping`            | `PING`                           |
//!
//! `KEYS` is never used; pattern scans iterate with a cursor so a large
//! keyspace does not block the server.
//!
//! `add_to_set` runs as one script so the tag set's expiry can only grow:
//! it is raised to the new member's TTL when that is longer and left alone
//! otherwise. A tag that is never invalidated is dropped once its longest
//! lived member has expired.
//!
//! Every command runs under [`RetryConfig::query`]; the orchestrator's
//! circuit breaker sits on top of that.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{cmd, AsyncCommands, Client, Script};
use tracing::{debug, info};

use super::traits::{DistributedStore, StorageError};
use crate::resilience::retry::{retry, RetryConfig};

/// `SADD`, then extend the expiry if the set would outlive its members.
/// `TTL` is -1 for a set without expiry, so the first call always sets one.
const ADD_TO_SET_SCRIPT: &str = r"
redis.call('SADD', KEYS[1], ARGV[1])
local ttl = redis.call('TTL', KEYS[1])
if ttl < tonumber(ARGV[2]) then
    redis.call('EXPIRE', KEYS[1], ARGV[2])
end
return 1
";

/// Keys fetched per `SCAN` round trip.
const SCAN_COUNT: usize = 500;

pub struct RedisStore {
    connection: ConnectionManager,
    /// Prepended to every key, for sharing one Redis between deployments
    prefix: String,
    retry: RetryConfig,
}

impl RedisStore {
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        Self::with_prefix(connection_string, None).await
    }

    /// Connect with an optional key prefix.
    ///
    /// ```rust,no_run
    /// # use tiered_cache::RedisStore;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// // "cache:company:CHE-1" is stored as "cis:cache:company:CHE-1"
    /// let store = RedisStore::with_prefix("redis://localhost", Some("cis:")).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_prefix(connection_string: &str, prefix: Option<&str>) -> Result<Self, StorageError> {
        let client = Client::open(connection_string).map_err(|e| StorageError::Backend(e.to_string()))?;

        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Unavailable(e.to_string()))?;

        info!(prefix = prefix.unwrap_or(""), "Connected to Redis");
        Ok(Self {
            connection,
            prefix: prefix.unwrap_or("").to_string(),
            retry: RetryConfig::query(),
        })
    }

    /// Override the per-command retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    #[inline]
    fn prefixed_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}", self.prefix, key)
        }
    }

    #[inline]
    fn strip_prefix<'a>(&self, key: &'a str) -> &'a str {
        if self.prefix.is_empty() {
            key
        } else {
            key.strip_prefix(&self.prefix).unwrap_or(key)
        }
    }

    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

fn map_redis_err(e: redis::RedisError) -> StorageError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
        StorageError::Unavailable(e.to_string())
    } else {
        StorageError::Backend(e.to_string())
    }
}

#[async_trait]
impl DistributedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        retry("redis_get", &self.retry, || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let data: Option<Vec<u8>> = conn.get(&key).await?;
                Ok(data)
            }
        })
        .await
        .map_err(map_redis_err)
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl_secs: u64) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);
        let ttl = ttl_secs.max(1);

        retry("redis_set", &self.retry, || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let _: () = conn.set_ex(&key, value, ttl).await?;
                Ok(())
            }
        })
        .await
        .map_err(map_redis_err)
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64, StorageError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let conn = self.connection.clone();
        let keys: Vec<String> = keys.iter().map(|k| self.prefixed_key(k)).collect();

        retry("redis_del", &self.retry, || {
            let mut conn = conn.clone();
            let keys = keys.clone();
            async move {
                let removed: u64 = cmd("DEL").arg(&keys).query_async(&mut conn).await?;
                Ok(removed)
            }
        })
        .await
        .map_err(map_redis_err)
    }

    async fn members_of_set(&self, set_key: &str) -> Result<Vec<String>, StorageError> {
        let conn = self.connection.clone();
        let set_key = self.prefixed_key(set_key);

        let members: Vec<String> = retry("redis_smembers", &self.retry, || {
            let mut conn = conn.clone();
            let set_key = set_key.clone();
            async move {
                let members: Vec<String> = conn.smembers(&set_key).await?;
                Ok(members)
            }
        })
        .await
        .map_err(map_redis_err)?;

        // Members are stored prefixed so DEL can use them directly
        Ok(members.iter().map(|m| self.strip_prefix(m).to_string()).collect())
    }

    async fn add_to_set(&self, set_key: &str, member: &str, ttl_secs: u64) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        let set_key = self.prefixed_key(set_key);
        let member = self.prefixed_key(member);
        let ttl = ttl_secs.max(1);
        let script = Script::new(ADD_TO_SET_SCRIPT);

        retry("redis_sadd", &self.retry, || {
            let mut conn = conn.clone();
            let (script, set_key, member) = (&script, set_key.clone(), member.clone());
            async move {
                let _: i64 = script.key(&set_key).arg(&member).arg(ttl).invoke_async(&mut conn).await?;
                Ok(())
            }
        })
        .await
        .map_err(map_redis_err)
    }

    async fn scan_by_pattern(&self, pattern: &str) -> Result<Vec<String>, StorageError> {
        let conn = self.connection.clone();
        let pattern = self.prefixed_key(pattern);

        let keys: Vec<String> = retry("redis_scan", &self.retry, || {
            let mut conn = conn.clone();
            let pattern = pattern.clone();
            async move {
                let mut cursor: u64 = 0;
                let mut found = Vec::new();
                loop {
                    let (next, batch): (u64, Vec<String>) = cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(SCAN_COUNT)
                        .query_async(&mut conn)
                        .await?;
                    found.extend(batch);
                    if next == 0 {
                        break;
                    }
                    cursor = next;
                }
                Ok(found)
            }
        })
        .await
        .map_err(map_redis_err)?;

        debug!(pattern = %pattern, matched = keys.len(), "Redis pattern scan");
        // SCAN may return a key more than once across iterations
        let mut keys: Vec<String> = keys.iter().map(|k| self.strip_prefix(k).to_string()).collect();
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let pong: String = cmd("PING").query_async(&mut conn).await.map_err(map_redis_err)?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(StorageError::Backend(format!("unexpected PING reply: {pong}")))
        }
    }
}
