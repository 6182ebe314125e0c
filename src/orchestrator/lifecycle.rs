// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Background sweep lifecycle and health probing.

use tokio::sync::watch;
use tracing::{info, warn};

use super::{CacheState, TieredCache};

impl<V> TieredCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Start the periodic L1 expiry sweep. Calling it again while running
    /// is a no-op. Must be called from within a tokio runtime.
    #[tracing::instrument(skip(self))]
    pub fn start(&self) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }
        *sweeper = Some(self.l1.start_sweeper(self.config.sweep_interval()));
        drop(sweeper);

        self.state.send_replace(CacheState::Running);
        info!(
            region = %self.config.region,
            max_size = self.config.max_size,
            sweep_interval_ms = self.config.sweep_interval_ms,
            l2 = self.l2.is_some(),
            "Tiered cache started"
        );
    }

    /// Stop the sweep and wait for it to finish. Idempotent.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        let task = self.sweeper.lock().take();
        if let Some(task) = task {
            task.stop().await;
            info!("Tiered cache stopped");
        }
        self.state.send_replace(CacheState::Stopped);
    }

    #[must_use]
    pub fn state(&self) -> CacheState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<CacheState> {
        self.state.subscribe()
    }

    /// Probe L2 with `PING`. `None` when no L2 is configured.
    pub async fn l2_healthy(&self) -> Option<bool> {
        let l2 = self.l2.as_ref()?;
        let healthy = match l2.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "L2 health probe failed");
                false
            }
        };
        crate::metrics::set_backend_healthy("l2", healthy);
        Some(healthy)
    }
}
