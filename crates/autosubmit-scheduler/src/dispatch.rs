use std::sync::Arc;
use std::time::Duration;

use autosubmit_core::SchedulerConfig;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::{
    db::{checked_offset, secs_delta, truncate_ts},
    error::{Result, SchedulerError},
    executor::{ExecutionRequest, Executor, ExecutorError},
    store::JobStore,
    types::{Job, JobStatus, Transition},
};

/// How a single dispatch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The executor succeeded and the job is `completed`.
    Completed,
    /// The attempt failed; the job is `pending` again from `retry_at`.
    Retrying {
        attempt: u32,
        retry_at: DateTime<Utc>,
    },
    /// The attempt failed and no attempts are left; the job is `failed`.
    Failed { attempt: u32 },
    /// The owner deleted the job while it was in flight.
    Cancelled,
    /// The claim was taken back (lease expired) before the result landed;
    /// the job now belongs to another claim and was left untouched.
    Superseded,
}

/// Runs claimed jobs through the executor and records the result.
pub struct Dispatcher {
    store: Arc<JobStore>,
    executor: Arc<dyn Executor>,
    timeout: Duration,
    max_attempts: u32,
    retry_backoff_secs: u64,
}

impl Dispatcher {
    pub fn new(store: Arc<JobStore>, executor: Arc<dyn Executor>, config: &SchedulerConfig) -> Self {
        Self {
            store,
            executor,
            timeout: Duration::from_secs(config.execution_timeout_secs),
            max_attempts: config.max_attempts,
            retry_backoff_secs: config.retry_backoff_secs,
        }
    }

    /// Execute one claimed job and write its next status.
    ///
    /// The status write lands before this returns. Only the claim identified
    /// by `job.claim_token` is ever written; a deleted or reclaimed job comes
    /// back as [`DispatchOutcome::Cancelled`] / [`DispatchOutcome::Superseded`],
    /// not as an error. A store error on the final write is returned; the
    /// lease then guarantees the reconciler picks the job up again.
    ///
    /// The executor is only called if the claim is still held and its lease
    /// outlasts the full execution timeout. Otherwise the job is left for the
    /// reconciler and reported as [`DispatchOutcome::Superseded`] (or
    /// [`DispatchOutcome::Cancelled`] if it was deleted).
    pub async fn dispatch(&self, job: &Job) -> Result<DispatchOutcome> {
        let token = match (job.status, job.claim_token.as_deref()) {
            (JobStatus::Claimed, Some(token)) => token.to_string(),
            _ => return Err(SchedulerError::NotClaimed { id: job.id.clone() }),
        };

        let must_hold_until = chrono::Duration::from_std(self.timeout)
            .ok()
            .and_then(|t| checked_offset(truncate_ts(Utc::now()), t))
            .ok_or_else(|| {
                SchedulerError::TimeOutOfRange(format!("execution timeout {:?}", self.timeout))
            })?;
        match self.store.check_claim(&job.id, &token, must_hold_until)? {
            Transition::Applied(_) => {}
            other => {
                debug!(job_id = %job.id, "lease too short or lost before execution; skipping");
                return Ok(self.resolve(job, other, DispatchOutcome::Superseded));
            }
        }

        let req = ExecutionRequest {
            job_id: job.id.clone(),
            target: job.target.clone(),
            claim_token: token.clone(),
            attempt: job.attempt_count,
        };

        let result = match tokio::time::timeout(self.timeout, self.executor.execute(&req)).await {
            Ok(r) => r,
            Err(_) => Err(ExecutorError::Timeout {
                ms: self.timeout.as_millis() as u64,
            }),
        };

        let now = truncate_ts(Utc::now());
        match result {
            Ok(report) => {
                let transition = self.store.complete(&job.id, &token, now)?;
                let outcome = self.resolve(job, transition, DispatchOutcome::Completed);
                if outcome == DispatchOutcome::Completed {
                    info!(
                        job_id = %job.id,
                        attempt = job.attempt_count,
                        executor = self.executor.name(),
                        detail = report.detail.as_deref().unwrap_or(""),
                        "job completed"
                    );
                }
                Ok(outcome)
            }
            Err(e) => {
                let message = e.to_string();
                let retry_at = self
                    .retry_backoff_secs
                    .checked_mul(u64::from(job.attempt_count))
                    .and_then(secs_delta)
                    .and_then(|delay| checked_offset(now, delay))
                    .ok_or_else(|| {
                        SchedulerError::TimeOutOfRange(format!(
                            "retry backoff for attempt {}",
                            job.attempt_count
                        ))
                    })?;
                let transition = self.store.record_failure(
                    &job.id,
                    &token,
                    &message,
                    now,
                    retry_at,
                    self.max_attempts,
                )?;
                let outcome = match transition {
                    Transition::Applied(JobStatus::Failed) => {
                        warn!(
                            job_id = %job.id,
                            attempt = job.attempt_count,
                            error = %message,
                            "job failed permanently"
                        );
                        DispatchOutcome::Failed {
                            attempt: job.attempt_count,
                        }
                    }
                    Transition::Applied(_) => {
                        warn!(
                            job_id = %job.id,
                            attempt = job.attempt_count,
                            error = %message,
                            retry_at = %retry_at,
                            "job attempt failed; requeued"
                        );
                        DispatchOutcome::Retrying {
                            attempt: job.attempt_count,
                            retry_at,
                        }
                    }
                    other => self.resolve(job, other, DispatchOutcome::Superseded),
                };
                Ok(outcome)
            }
        }
    }

    /// Map a non-applied transition to the matching benign outcome.
    fn resolve(&self, job: &Job, transition: Transition, applied: DispatchOutcome) -> DispatchOutcome {
        match transition {
            Transition::Applied(_) => applied,
            Transition::NotFound => {
                info!(job_id = %job.id, "job deleted during dispatch; result discarded");
                DispatchOutcome::Cancelled
            }
            Transition::Superseded => {
                warn!(
                    job_id = %job.id,
                    "claim no longer held (lease expired?); result discarded"
                );
                DispatchOutcome::Superseded
            }
        }
    }
}
