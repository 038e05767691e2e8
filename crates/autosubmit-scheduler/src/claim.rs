use std::sync::Arc;

use autosubmit_core::SchedulerConfig;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    db::{checked_offset, secs_delta, truncate_ts},
    error::{Result, SchedulerError},
    store::JobStore,
    types::{Job, Transition},
};

/// Turns due jobs into leased claims.
///
/// Holds no state between calls: any number of engines, in any number of
/// processes, may poll the same store. Mutual exclusion comes entirely from
/// [`JobStore::try_claim`] being a conditional update.
pub struct ClaimEngine {
    store: Arc<JobStore>,
    lease_secs: u64,
    max_attempts: u32,
}

impl ClaimEngine {
    pub fn new(store: Arc<JobStore>, config: &SchedulerConfig) -> Self {
        Self {
            store,
            lease_secs: config.lease_secs,
            max_attempts: config.max_attempts,
        }
    }

    /// Claim up to `limit` due jobs as of the current time.
    pub fn claim_batch(&self, limit: u32) -> Result<Vec<Job>> {
        self.claim_batch_at(limit, Utc::now())
    }

    /// Claim up to `limit` jobs due at `now`, oldest-due first.
    ///
    /// Jobs lost to a concurrent claimer are silently skipped, so the result
    /// may be shorter than the candidate list. On a store error the call
    /// fails; claims committed before the error stay valid and are recovered
    /// by the reconciler once their lease runs out.
    pub fn claim_batch_at(&self, limit: u32, now: DateTime<Utc>) -> Result<Vec<Job>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now = truncate_ts(now);
        let deadline = secs_delta(self.lease_secs)
            .and_then(|lease| checked_offset(now, lease))
            .ok_or_else(|| {
                SchedulerError::TimeOutOfRange(format!("lease of {}s from {now}", self.lease_secs))
            })?;
        let candidates = self.store.list_due(now, limit)?;
        let mut claimed = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            if candidate.attempt_count >= self.max_attempts {
                if let Transition::Applied(_) =
                    self.store.fail_exhausted(&candidate.id, now, self.max_attempts)?
                {
                    warn!(
                        job_id = %candidate.id,
                        attempts = candidate.attempt_count,
                        "pending job has no attempts left; marked failed"
                    );
                }
                continue;
            }

            let token = Uuid::new_v4().to_string();
            match self
                .store
                .try_claim(&candidate.id, &token, deadline, now, self.max_attempts)?
            {
                Some(job) => {
                    debug!(job_id = %job.id, attempt = job.attempt_count, "job claimed");
                    claimed.push(job);
                }
                None => debug!(job_id = %candidate.id, "claim race lost; skipping"),
            }
        }

        if !claimed.is_empty() {
            info!(count = claimed.len(), "claimed due jobs");
        }
        Ok(claimed)
    }
}
