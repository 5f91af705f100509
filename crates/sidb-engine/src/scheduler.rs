//! Periodic background work for the daemon

use chrono::Utc;
use sidb_core::{Config, StoreId};
use sidb_storage::PruneOptions;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::engine::Engine;

/// How often the pruning loop looks for stores whose sweep interval elapsed
const PRUNE_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Handles of the spawned loops; dropping it leaves them running
pub struct Scheduler {
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawn every loop the engine config enables
    pub fn start(engine: Arc<Engine>) -> Self {
        let config = engine.config().clone();
        let mut handles = Vec::new();

        if config.prune.enabled {
            handles.push(spawn_pruning(engine.clone()));
        } else {
            info!("Scheduled pruning disabled");
        }

        if config.verify.enabled {
            let every = Duration::from_secs(config.verify.interval_hours * 3600);
            info!(
                "Scheduled verification enabled, running every {} hours",
                config.verify.interval_hours
            );
            let (scope, depth) = (config.verify.scope, config.verify.depth);
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(every);
                // Skip the first immediate tick
                interval.tick().await;
                loop {
                    interval.tick().await;
                    for store in engine.stores() {
                        match engine.run_verification(store, scope, depth).await
                        {
                            Ok(job) => info!(
                                "Scheduled verification of store {}: {} good, {} bad",
                                store, job.chunks_good, job.chunks_bad
                            ),
                            Err(e) => error!("Scheduled verification of store {} failed: {}", store, e),
                        }
                    }
                }
            }));
        }

        if config.data_aging.enabled {
            let every = Duration::from_secs(config.data_aging.interval_hours * 3600);
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(every);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    match engine.run_data_aging(Utc::now()).await {
                        Ok(result) => {
                            info!("Data aging: {} jobs aged", result.jobs_aged);
                            if !result.errors.is_empty() {
                                warn!("Data aging errors: {:?}", result.errors);
                            }
                        }
                        Err(e) => error!("Data aging failed: {}", e),
                    }
                }
            }));
        }

        let every = Duration::from_secs(config.persist_interval_secs);
        let saver = engine.clone();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = saver.save().await {
                    error!("Failed to save state: {}", e);
                }
            }
        }));

        Self { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Abort every loop
    pub fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}

/// Last pruning run per store. A store is first due one sweep interval
/// after it is first seen.
#[derive(Debug, Default)]
struct PruneSchedule {
    last_run: HashMap<StoreId, Instant>,
}

impl PruneSchedule {
    /// Stores whose sweep interval elapsed at `now`; they count as run
    fn due(&mut self, stores: &[StoreId], settings: &Config, now: Instant) -> Vec<StoreId> {
        self.last_run.retain(|store, _| stores.contains(store));
        let mut due = Vec::new();
        for store in stores {
            let last = *self.last_run.entry(*store).or_insert(now);
            if now.duration_since(last) >= settings.sweep_interval(*store) {
                self.last_run.insert(*store, now);
                due.push(*store);
            }
        }
        due
    }
}

/// One loop for every store, including stores created after start. The
/// store list and sweep intervals are re-read on every poll so overrides
/// apply on the next cycle.
fn spawn_pruning(engine: Arc<Engine>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut schedule = PruneSchedule::default();
        let mut interval = tokio::time::interval(PRUNE_POLL_INTERVAL);
        loop {
            interval.tick().await;
            let settings = engine.settings().await;
            let stores = engine.stores();
            for store in schedule.due(&stores, &settings, Instant::now()) {
                if !settings.pruning_enabled(store) {
                    debug!("Pruning disabled for store {}, skipping cycle", store);
                    continue;
                }
                prune_store(&engine, store).await;
            }
        }
    })
}

async fn prune_store(engine: &Engine, store: StoreId) {
    match engine.run_pruning(store, &PruneOptions::default()).await {
        Ok(cycle) => {
            info!(
                "Scheduled pruning of store {}: {} chunks deleted, {} bytes freed",
                store, cycle.physical.chunks_deleted, cycle.physical.bytes_freed
            );
            let errors = cycle.logical.errors.len() + cycle.physical.errors.len();
            if errors > 0 {
                warn!("Pruning of store {} reported {} errors", store, errors);
            }
        }
        Err(e) => error!("Scheduled pruning of store {} failed: {}", store, e),
    }
}
