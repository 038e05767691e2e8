use std::sync::Arc;

use autosubmit_core::SchedulerConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    db::truncate_ts,
    error::Result,
    store::JobStore,
    types::{JobStatus, Transition},
};

/// Tally of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Expired claims returned to `pending`.
    pub requeued: usize,
    /// Expired claims that had no attempts left and were marked `failed`.
    pub failed: usize,
    /// Expired claims resolved by someone else between the scan and the write.
    pub skipped: usize,
}

/// Recovers claims whose holder died without reporting back.
pub struct Reconciler {
    store: Arc<JobStore>,
    max_attempts: u32,
}

impl Reconciler {
    pub fn new(store: Arc<JobStore>, config: &SchedulerConfig) -> Self {
        Self {
            store,
            max_attempts: config.max_attempts,
        }
    }

    /// Return every claim whose lease expired before `now` to the pending pool.
    ///
    /// Each write is conditional on the token and deadline observed during
    /// the scan. `attempt_count` is not reset, so a job that keeps stalling
    /// its executor still runs out of attempts and ends up `failed`.
    pub fn reconcile_once(&self, now: DateTime<Utc>) -> Result<ReconcileReport> {
        let now = truncate_ts(now);
        let expired = self.store.list_expired_claims(now)?;
        let mut report = ReconcileReport::default();

        for job in expired {
            let (Some(token), Some(deadline)) = (job.claim_token.as_deref(), job.claim_deadline)
            else {
                // The schema forbids this; count it rather than guess.
                report.skipped += 1;
                continue;
            };

            match self
                .store
                .reclaim(&job.id, token, deadline, now, self.max_attempts)?
            {
                Transition::Applied(JobStatus::Failed) => {
                    warn!(
                        job_id = %job.id,
                        attempts = job.attempt_count,
                        "lease expired on final attempt; job failed"
                    );
                    report.failed += 1;
                }
                Transition::Applied(_) => {
                    info!(
                        job_id = %job.id,
                        attempts = job.attempt_count,
                        deadline = %deadline,
                        "lease expired; job requeued"
                    );
                    report.requeued += 1;
                }
                Transition::NotFound | Transition::Superseded => {
                    debug!(job_id = %job.id, "expired claim resolved concurrently");
                    report.skipped += 1;
                }
            }
        }

        Ok(report)
    }
}
