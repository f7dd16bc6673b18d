//! Periodic write-back of dirty cache entries
//!
//! The flusher owns two schedules: a flush tick that saves every dirty entry
//! through the cache's repository and evicts expired offline entries, and a
//! keep-alive tick that runs pool maintenance. On shutdown the background
//! task is stopped and one final drain pass is made.

use std::{fmt, sync::Arc};

use futures_util::{StreamExt, stream};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    config::FlushConfig,
    error::AppError,
    logging::OperationTimer,
    repositories::{
        base::{Entity, Repository},
        cache::{DirtyEntry, EntityCache},
    },
    storage::{ConnectionPool, MaintenanceReport},
};

/// Outcome of one flush pass
#[derive(Debug, Default)]
pub struct FlushReport {
    /// Dirty entries found by the pass
    pub attempted: usize,
    /// Saved and marked clean
    pub saved: usize,
    /// Saved, but mutated again before the save finished; still dirty
    pub superseded: usize,
    /// Save failed; still dirty
    pub failed: usize,
    /// Keys whose save failed, rendered for logging
    pub failed_keys: Vec<String>,
}

impl FlushReport {
    /// Whether every attempted entry was persisted
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }
}

impl fmt::Display for FlushReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "attempted={}, saved={}, superseded={}, failed={}",
            self.attempted, self.saved, self.superseded, self.failed
        )
    }
}

/// Saves dirty entries of one cache and keeps the pool healthy
pub struct Flusher<T: Entity, R: Repository<T>> {
    cache: EntityCache<T, R>,
    pool: ConnectionPool,
    config: FlushConfig,
}

impl<T, R> Flusher<T, R>
where
    T: Entity,
    R: Repository<T>,
{
    pub fn new(cache: EntityCache<T, R>, pool: ConnectionPool, config: FlushConfig) -> Self {
        Self { cache, pool, config }
    }

    pub fn cache(&self) -> &EntityCache<T, R> {
        &self.cache
    }

    /// Save every entry that is dirty right now.
    ///
    /// Each entry is saved from a copy taken under its read lock, so the
    /// live instance is never overwritten. Failures are logged and left
    /// dirty for the next pass.
    #[instrument(skip(self), fields(kind = T::KIND))]
    pub async fn flush_once(&self) -> FlushReport {
        let entries = self.cache.dirty_entries();
        let mut report = FlushReport {
            attempted: entries.len(),
            ..FlushReport::default()
        };
        if entries.is_empty() {
            return report;
        }

        let repository = self.cache.repository();
        let results: Vec<_> = stream::iter(entries)
            .map(|entry: DirtyEntry<T>| {
                let repository = Arc::clone(repository);
                async move {
                    let snapshot = entry.value.read().await.clone();
                    let result = repository.save(&snapshot).await;
                    (entry, result)
                }
            })
            .buffer_unordered(self.config.concurrency)
            .collect()
            .await;

        for (entry, result) in results {
            match result {
                Ok(()) => {
                    if self.cache.mark_clean(&entry.key, entry.generation) {
                        report.saved += 1;
                    } else {
                        debug!("{} {} changed during its save", T::KIND, entry.key);
                        report.superseded += 1;
                    }
                }
                Err(e) => {
                    AppError::persist_failed(&entry.key, e).log();
                    report.failed += 1;
                    report.failed_keys.push(entry.key.to_string());
                }
            }
        }

        report
    }

    /// One scheduled tick: flush, then evict entries past their grace period
    pub async fn tick(&self) -> FlushReport {
        let timer = OperationTimer::start("flush");
        let report = self.flush_once().await;
        let evicted = self.cache.evict_expired(self.cache.config().eviction_grace);

        if report.attempted > 0 || evicted > 0 {
            timer.finish(format_args!("{}, evicted={}", report, evicted));
        }
        if report.failed > 0 {
            warn!("{} {} entries left dirty, retrying next tick", report.failed, T::KIND);
        }
        report
    }

    /// One keep-alive tick: validate, retire and replenish pool connections
    pub async fn keep_alive_once(&self) -> MaintenanceReport {
        let report = self.pool.maintain().await;
        debug!("Pool keep-alive: {} ({})", report, self.pool.stats());
        report
    }

    /// Final pass at shutdown.
    ///
    /// Every dirty entry is attempted once; entries that still fail are
    /// reported as potential data loss.
    #[instrument(skip(self), fields(kind = T::KIND))]
    pub async fn drain(&self) -> FlushReport {
        let timer = OperationTimer::start_at("drain", tracing::Level::INFO);
        let report = self.flush_once().await;

        if !report.failed_keys.is_empty() {
            error!(
                "Potential data loss: {} {} entries could not be saved at shutdown: {}",
                report.failed,
                T::KIND,
                report.failed_keys.join(", ")
            );
        }
        timer.finish(&report);
        report
    }

    /// Run the flush and keep-alive schedules on a background task
    pub fn start(self) -> FlusherHandle<T, R> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let flusher = Arc::new(self);
        let worker = Arc::clone(&flusher);

        let task = tokio::spawn(async move {
            let flush_every = worker.config.interval;
            let keep_alive_every = worker.config.keep_alive_interval;
            let mut flush_timer = time::interval_at(Instant::now() + flush_every, flush_every);
            flush_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut keep_alive_timer = time::interval_at(Instant::now() + keep_alive_every, keep_alive_every);
            keep_alive_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                "Flusher started: flush every {:?}, keep-alive every {:?}",
                flush_every, keep_alive_every
            );

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = flush_timer.tick() => {
                        worker.tick().await;
                    }
                    _ = keep_alive_timer.tick() => {
                        worker.keep_alive_once().await;
                    }
                }
            }

            debug!("Flusher task stopped");
        });

        FlusherHandle {
            flusher,
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Handle to a running flusher
pub struct FlusherHandle<T: Entity, R: Repository<T>> {
    flusher: Arc<Flusher<T, R>>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl<T, R> FlusherHandle<T, R>
where
    T: Entity,
    R: Repository<T>,
{
    /// Stop the schedules, wait for a tick in progress, then drain
    pub async fn shutdown(self) -> FlushReport {
        self.shutdown.send_replace(true);
        if let Err(e) = self.task.await {
            error!("Flusher task ended abnormally: {}", e);
        }
        self.flusher.drain().await
    }
}
