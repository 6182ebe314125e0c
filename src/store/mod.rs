// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage tiers.
//!
//! - [`expiring`]: the L1 in-process store (TTL + LRU + tags)
//! - [`traits`]: the L2 contract, [`DistributedStore`]
//! - [`redis`] and [`memory`]: L2 implementations

pub mod expiring;
pub mod memory;
pub mod pattern;
pub mod redis;
pub mod tag_index;
pub mod traits;

pub use expiring::{ExpiringStore, StoreStats};
pub use memory::MemoryDistributedStore;
pub use redis::RedisStore;
pub use traits::{DistributedStore, StorageError};
