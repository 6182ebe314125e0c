// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Miss coalescing (stampede protection).
//!
//! The first caller with a cold miss for a key becomes the leader: it
//! registers a `watch` channel under the key, runs the fallback, and
//! publishes the outcome. Every concurrent caller for that key waits on the
//! channel and receives a clone of the same `Result`, success or error, so
//! the fallback runs once per burst.
//!
//! If the leader is cancelled before publishing, its channel closes; waiters
//! re-check the tiers and one of them takes over with its own fallback.

use std::any::Any;
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::debug;

use super::{CacheOptions, TieredCache};

/// Outcome slot of one coalesced load.
#[derive(Clone)]
pub(crate) enum Flight {
    Pending,
    /// Type-erased `Result<V, E>`; `E` is chosen per call site.
    Done(Arc<dyn Any + Send + Sync>),
}

/// Flight id plus a receiver new waiters clone.
pub(crate) type FlightHandle = (u64, watch::Receiver<Flight>);

enum Role {
    Leader(u64, watch::Sender<Flight>),
    Waiter(watch::Receiver<Flight>),
}

/// Unregisters the leader's flight on every exit path, cancellation included.
struct FlightGuard<'a> {
    map: &'a DashMap<String, FlightHandle>,
    key: &'a str,
    id: u64,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.map.remove_if(self.key, |_, (id, _)| *id == self.id);
    }
}

impl<V> TieredCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Like [`get`](Self::get), but concurrent cold misses for the same key
    /// share one fallback run and all receive its outcome.
    #[tracing::instrument(skip(self, fallback, options), fields(tier))]
    pub async fn get_coalesced<F, Fut, E>(&self, key: &str, fallback: F, options: &CacheOptions) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: Clone + Send + Sync + 'static,
    {
        if let Some(value) = self.lookup(key, options).await {
            return Ok(value);
        }
        self.load_coalesced(key, fallback, options).await
    }

    pub(super) async fn load_coalesced<F, Fut, E>(&self, key: &str, fallback: F, options: &CacheOptions) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: Clone + Send + Sync + 'static,
    {
        loop {
            let role = match self.in_flight.entry(key.to_string()) {
                Entry::Occupied(flight) => Role::Waiter(flight.get().1.clone()),
                Entry::Vacant(slot) => {
                    let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = watch::channel(Flight::Pending);
                    slot.insert((id, rx));
                    Role::Leader(id, tx)
                }
            };

            match role {
                Role::Leader(id, tx) => {
                    let _guard = FlightGuard {
                        map: &self.in_flight,
                        key,
                        id,
                    };
                    let outcome = match self.lookup(key, options).await {
                        Some(value) => Ok(value),
                        None => self.load(key, fallback, options).await,
                    };
                    tx.send_replace(Flight::Done(Arc::new(outcome.clone())));
                    return outcome;
                }
                Role::Waiter(mut rx) => {
                    let shared = rx
                        .wait_for(|flight| matches!(flight, Flight::Done(_)))
                        .await
                        .ok()
                        .and_then(|flight| match &*flight {
                            Flight::Done(outcome) => Some(outcome.clone()),
                            Flight::Pending => None,
                        });

                    let Some(shared) = shared else {
                        debug!("Coalesced leader went away, re-checking tiers");
                        if let Some(value) = self.lookup(key, options).await {
                            return Ok(value);
                        }
                        continue;
                    };

                    crate::metrics::record_operation("fallback", "get", "coalesced");
                    match shared.downcast::<Result<V, E>>() {
                        Ok(outcome) => {
                            debug!(ok = outcome.is_ok(), "Coalesced miss served by shared load");
                            return (*outcome).clone();
                        }
                        Err(_) => {
                            debug!("Coalesced load used another error type, loading separately");
                            return self.load(key, fallback, options).await;
                        }
                    }
                }
            }
        }
    }

    /// Keys with a coalesced load in progress.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}
