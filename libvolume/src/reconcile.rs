//! Periodic drift correction.
//!
//! Every `reconcile_period` the loop visits each created volume: it polls
//! running rebuilds, removes replicas that stayed faulted past the grace
//! period, restores the requested replica count and resumes rebuilds that
//! were deferred.  Every `cache_period` it also refreshes replica health from
//! the engine.  Failures are logged and retried on the next tick; one volume
//! failing never stops the others.

use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{Instrument, debug, error, info, info_span};

use crate::controller::VolumeController;

/// Summary of one reconcile tick across all volumes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub volumes: usize,
    pub rebuilds_completed: usize,
    pub rebuilds_failed: usize,
    pub faulted_removed: usize,
    pub replicas_added: usize,
    pub rebuilds_resumed: usize,
    pub orphans_collected: usize,
    pub errors: usize,
}

/// Drives [`VolumeController`] towards the desired state.
#[derive(Debug, Clone)]
pub struct ReconcileLoop {
    controller: Arc<VolumeController>,
}

impl ReconcileLoop {
    pub fn new(controller: Arc<VolumeController>) -> Self {
        Self { controller }
    }

    /// Run one reconcile pass over every volume, then collect orphans.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        for id in self.controller.volume_ids() {
            let volume = self.controller.reconcile_volume(&id).await;
            report.volumes += 1;
            report.rebuilds_completed += volume.rebuilds_completed;
            report.rebuilds_failed += volume.rebuilds_failed;
            report.faulted_removed += volume.faulted_removed;
            report.replicas_added += volume.replicas_added;
            report.rebuilds_resumed += volume.rebuilds_resumed;
            report.errors += volume.errors;
        }
        report.orphans_collected = self.controller.collect_orphans().await;
        debug!(?report, "reconcile tick");
        report
    }

    /// Refresh replica health from the engine.  Returns replicas faulted.
    pub async fn refresh(&self) -> usize {
        self.controller.refresh_health().await
    }

    /// Spawn the loop on the current runtime.
    pub fn start(self) -> ReconcileHandle {
        let shutdown = Arc::new(Notify::new());
        let stop = Arc::clone(&shutdown);
        let config = self.controller.config();
        let mut reconcile = time::interval(config.reconcile_period);
        let mut refresh = time::interval(config.cache_period);
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            reconcile_period = ?config.reconcile_period,
            cache_period = ?config.cache_period,
            "reconcile loop started"
        );

        let task = tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        _ = stop.notified() => break,
                        _ = refresh.tick() => {
                            self.refresh().await;
                        }
                        _ = reconcile.tick() => {
                            self.tick().await;
                        }
                    }
                }
                info!("reconcile loop stopped");
            }
            .instrument(info_span!("reconcile")),
        );
        ReconcileHandle { shutdown, task }
    }
}

/// Handle to a running [`ReconcileLoop`].
#[derive(Debug)]
pub struct ReconcileHandle {
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

impl ReconcileHandle {
    /// Stop the loop and wait for the in-flight pass to finish.
    pub async fn stop(self) {
        self.shutdown.notify_one();
        if let Err(error) = self.task.await {
            error!(%error, "reconcile loop panicked");
        }
    }
}
