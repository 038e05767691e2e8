use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a scheduled job.
///
/// ```text
/// pending --claim--> claimed --ok--> completed
///                    claimed --error / lease expiry--> pending | failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `not_before`, or for a retry.
    Pending,
    /// Leased to a dispatcher until `claim_deadline`.
    Claimed,
    /// The executor reported success.
    Completed,
    /// Attempts exhausted; no further automatic retry.
    Failed,
}

impl JobStatus {
    /// `completed` and `failed` are never left.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Claimed => "claimed",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "claimed" => Ok(JobStatus::Claimed),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A persisted job record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// UUIDv7 string: primary key.
    pub id: String,
    /// Submitting user. Immutable.
    pub owner: String,
    /// Opaque description of what the executor should act on (e.g. a form URL).
    pub target: String,
    /// The job is not eligible for claiming before this instant.
    pub not_before: DateTime<Utc>,
    pub status: JobStatus,
    /// Identifies the current claim holder; `None` unless `status == Claimed`.
    pub claim_token: Option<String>,
    /// Lease expiry of the current claim; `None` unless `status == Claimed`.
    pub claim_deadline: Option<DateTime<Utc>>,
    /// Number of claims taken so far, lease expiries included.
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of a conditional single-row write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The row matched and now has this status.
    Applied(JobStatus),
    /// The row no longer exists (deleted by its owner).
    NotFound,
    /// The row exists but was moved on by someone else (claim token, status or
    /// deadline no longer match what the caller observed).
    Superseded,
}

/// Per-status job totals, reported by `/health`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub claimed: u64,
    pub completed: u64,
    pub failed: u64,
}
