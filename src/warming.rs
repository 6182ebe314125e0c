// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache warming scheduler.
//!
//! Hot keys (canton lists, postal code tables, popular company profiles) are
//! registered once with a loader. [`CacheWarmer::warm_all`] runs every loader
//! concurrently and writes each success through the cache; a failing or
//! panicking loader is logged and reported without affecting the others.
//! [`CacheWarmer::start`] repeats that on start (optionally) and then every
//! `interval_ms`.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::WarmingConfig;
use crate::orchestrator::{CacheOptions, TieredCache};
use crate::task::PeriodicTask;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type Loader<V> = Arc<dyn Fn() -> BoxFuture<'static, Result<V, BoxError>> + Send + Sync>;

/// A key to keep warm and how to compute it.
pub struct WarmTask<V> {
    key: String,
    options: CacheOptions,
    loader: Loader<V>,
}

impl<V> Clone for WarmTask<V> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            options: self.options.clone(),
            loader: Arc::clone(&self.loader),
        }
    }
}

impl<V: Send + 'static> WarmTask<V> {
    /// ```
    /// use std::time::Duration;
    /// use tiered_cache::{CacheOptions, WarmTask};
    ///
    /// let task = WarmTask::new(
    ///     "cantons",
    ///     CacheOptions::new().ttl(Duration::from_secs(86_400)).tag("reference"),
    ///     || async { Ok::<_, std::io::Error>(vec!["ZH".to_string(), "BE".to_string()]) },
    /// );
    /// assert_eq!(task.key(), "cantons");
    /// ```
    pub fn new<F, Fut, E>(key: impl Into<String>, options: CacheOptions, loader: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let loader: Loader<V> = Arc::new(move || -> BoxFuture<'static, Result<V, BoxError>> {
            let fut = loader();
            Box::pin(async move { fut.await.map_err(Into::into) })
        });
        Self {
            key: key.into(),
            options,
            loader,
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Outcome of one warming run.
#[derive(Debug, Clone, Default)]
pub struct WarmReport {
    pub succeeded: Vec<String>,
    /// `(key, error)` for every loader that failed or panicked
    pub failed: Vec<(String, String)>,
    pub duration: Duration,
}

impl WarmReport {
    #[must_use]
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct CacheWarmer<V> {
    cache: Arc<TieredCache<V>>,
    config: WarmingConfig,
    tasks: RwLock<Vec<WarmTask<V>>>,
    schedule: Mutex<Option<PeriodicTask>>,
}

impl<V> CacheWarmer<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(cache: Arc<TieredCache<V>>, config: WarmingConfig) -> Self {
        Self {
            cache,
            config,
            tasks: RwLock::new(Vec::new()),
            schedule: Mutex::new(None),
        }
    }

    /// Add a task. A task with the same key replaces the earlier one.
    pub fn register(&self, task: WarmTask<V>) {
        let mut tasks = self.tasks.write();
        if let Some(existing) = tasks.iter_mut().find(|t| t.key == task.key) {
            debug!(key = %task.key, "Replacing warm task");
            *existing = task;
        } else {
            tasks.push(task);
        }
    }

    #[must_use]
    pub fn task_count(&self) -> usize {
        self.tasks.read().len()
    }

    /// Run every registered loader concurrently and write successes through.
    #[tracing::instrument(skip(self))]
    pub async fn warm_all(&self) -> WarmReport {
        let start = Instant::now();
        let tasks: Vec<WarmTask<V>> = self.tasks.read().clone();
        let mut report = WarmReport::default();

        if tasks.is_empty() {
            return report;
        }

        let mut set = JoinSet::new();
        for (idx, task) in tasks.iter().enumerate() {
            let fut = (task.loader)();
            set.spawn(async move { (idx, AssertUnwindSafe(fut).catch_unwind().await) });
        }

        while let Some(joined) = set.join_next().await {
            let (idx, outcome) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    // Only reachable if the runtime cancels the task
                    error!(error = %e, "Warm task aborted");
                    continue;
                }
            };
            let task = &tasks[idx];

            match outcome {
                Ok(Ok(value)) => {
                    self.cache.set(&task.key, value, &task.options).await;
                    crate::metrics::record_warm(true);
                    report.succeeded.push(task.key.clone());
                }
                Ok(Err(e)) => {
                    warn!(key = %task.key, error = %e, "Warm task failed");
                    crate::metrics::record_warm(false);
                    report.failed.push((task.key.clone(), e.to_string()));
                }
                Err(_) => {
                    error!(key = %task.key, "Warm task panicked");
                    crate::metrics::record_warm(false);
                    report.failed.push((task.key.clone(), "loader panicked".to_string()));
                }
            }
        }

        report.duration = start.elapsed();
        crate::metrics::record_warm_duration(report.duration);
        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            duration_ms = report.duration.as_millis() as u64,
            "Cache warming finished"
        );
        report
    }

    /// Schedule warming: immediately if `warm_on_start`, then every
    /// `interval_ms`. No-op if already scheduled.
    pub fn start(self: &Arc<Self>) {
        let mut schedule = self.schedule.lock();
        if schedule.is_some() {
            return;
        }

        let warmer: Weak<Self> = Arc::downgrade(self);
        *schedule = Some(PeriodicTask::spawn(
            "cache-warming",
            self.config.interval(),
            self.config.warm_on_start,
            move || {
                let warmer = warmer.clone();
                async move {
                    if let Some(warmer) = warmer.upgrade() {
                        warmer.warm_all().await;
                    }
                }
            },
        ));
        info!(
            interval_ms = self.config.interval().as_millis() as u64,
            warm_on_start = self.config.warm_on_start,
            tasks = self.task_count(),
            "Cache warming scheduled"
        );
    }

    /// Stop the schedule, letting an in-progress run finish.
    pub async fn shutdown(&self) {
        let task = self.schedule.lock().take();
        if let Some(task) = task {
            task.stop().await;
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.schedule.lock().as_ref().is_some_and(PeriodicTask::is_running)
    }
}
