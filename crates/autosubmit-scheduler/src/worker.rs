use std::time::Duration;

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{error, info};

use crate::{
    claim::ClaimEngine,
    dispatch::{DispatchOutcome, Dispatcher},
    error::Result,
    reconcile::{ReconcileReport, Reconciler},
};

/// Tally of one claim + dispatch tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    pub claimed: usize,
    pub completed: usize,
    pub retrying: usize,
    pub failed: usize,
    /// Deleted or reclaimed while in flight.
    pub discarded: usize,
    /// Status writes that hit a store error; left for the reconciler.
    pub errors: usize,
}

/// Claims due jobs on a fixed cadence and dispatches them concurrently.
pub struct DispatchWorker {
    claim: ClaimEngine,
    dispatcher: Dispatcher,
    batch_size: u32,
    concurrency: usize,
    interval: Duration,
}

impl DispatchWorker {
    pub fn new(
        claim: ClaimEngine,
        dispatcher: Dispatcher,
        config: &autosubmit_core::SchedulerConfig,
    ) -> Self {
        Self {
            claim,
            dispatcher,
            batch_size: config.batch_size,
            concurrency: config.dispatch_concurrency.max(1),
            interval: Duration::from_secs(config.poll_interval_secs),
        }
    }

    /// One claim + dispatch round. Safe to call from any external scheduler.
    pub async fn tick(&self) -> Result<TickSummary> {
        let jobs = self.claim.claim_batch(self.batch_size)?;
        let summary = Mutex::new(TickSummary {
            claimed: jobs.len(),
            ..TickSummary::default()
        });

        stream::iter(jobs)
            .for_each_concurrent(self.concurrency, |job| {
                let summary = &summary;
                async move {
                    let outcome = self.dispatcher.dispatch(&job).await;
                    let mut s = summary.lock().await;
                    match outcome {
                        Ok(DispatchOutcome::Completed) => s.completed += 1,
                        Ok(DispatchOutcome::Retrying { .. }) => s.retrying += 1,
                        Ok(DispatchOutcome::Failed { .. }) => s.failed += 1,
                        Ok(DispatchOutcome::Cancelled | DispatchOutcome::Superseded) => {
                            s.discarded += 1
                        }
                        Err(e) => {
                            error!(job_id = %job.id, "status write failed: {e}");
                            s.errors += 1;
                        }
                    }
                }
            })
            .await;

        Ok(summary.into_inner())
    }

    /// Main loop. Ticks every `poll_interval_secs` until `shutdown` broadcasts `true`.
    ///
    /// A tick in progress always runs to completion, so every claimed job
    /// gets its status written before the worker exits.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "dispatch worker started");
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(summary) if summary.claimed > 0 => info!(?summary, "dispatch tick"),
                        Ok(_) => {}
                        Err(e) => error!("dispatch tick error: {e}"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("dispatch worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Sweeps expired claims on its own cadence.
pub struct ReconcileWorker {
    reconciler: Reconciler,
    interval: Duration,
}

impl ReconcileWorker {
    pub fn new(reconciler: Reconciler, config: &autosubmit_core::SchedulerConfig) -> Self {
        Self {
            reconciler,
            interval: Duration::from_secs(config.reconcile_interval_secs),
        }
    }

    pub fn tick(&self) -> Result<ReconcileReport> {
        self.reconciler.reconcile_once(Utc::now())
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "reconcile worker started");
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick() {
                        Ok(report) if report != ReconcileReport::default() => {
                            info!(?report, "reconcile tick");
                        }
                        Ok(_) => {}
                        Err(e) => error!("reconcile tick error: {e}"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("reconcile worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}
