//! Owner-facing job endpoints.
//!
//! Identity is asserted by the upstream auth layer through `X-Owner-Id`;
//! every query is scoped to that owner. When `api.token` is configured the
//! request must also carry `Authorization: Bearer <token>`.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use autosubmit_scheduler::{Job, SchedulerError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

use crate::app::AppState;

pub const OWNER_HEADER: &str = "x-owner-id";

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub target: String,
    pub not_before: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct JobList {
    pub jobs: Vec<Job>,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub code: &'static str,
}

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

fn reject(
    status: StatusCode,
    code: &'static str,
    error: impl Into<String>,
) -> (StatusCode, Json<ApiError>) {
    (
        status,
        Json(ApiError {
            error: error.into(),
            code,
        }),
    )
}

fn map_err(e: SchedulerError) -> (StatusCode, Json<ApiError>) {
    match e {
        SchedulerError::InvalidJob(msg) => reject(StatusCode::BAD_REQUEST, "INVALID_JOB", msg),
        SchedulerError::JobNotFound { id } => {
            reject(StatusCode::NOT_FOUND, "JOB_NOT_FOUND", format!("job not found: {id}"))
        }
        other => {
            error!("job store error: {other}");
            reject(
                StatusCode::INTERNAL_SERVER_ERROR,
                "STORE_ERROR",
                "job store unavailable",
            )
        }
    }
}

/// Check the bearer token (if configured) and return the caller's owner id.
fn authorize(state: &AppState, headers: &HeaderMap) -> ApiResult<String> {
    if let Some(ref expected) = state.config.api.token {
        let presented = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if presented != Some(expected.as_str()) {
            return Err(reject(
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                "Set 'Authorization: Bearer <token>' header.",
            ));
        }
    }

    headers
        .get(OWNER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
        .ok_or_else(|| {
            reject(
                StatusCode::UNAUTHORIZED,
                "MISSING_OWNER",
                format!("missing '{OWNER_HEADER}' header"),
            )
        })
}

/// POST /jobs: schedule a submission.
pub async fn create_job(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateJobRequest>,
) -> ApiResult<(StatusCode, Json<Job>)> {
    let owner = authorize(&state, &headers)?;
    let job = state
        .jobs
        .for_owner(&owner)
        .create(&req.target, req.not_before)
        .map_err(map_err)?;
    Ok((StatusCode::CREATED, Json(job)))
}

/// GET /jobs: the caller's jobs, newest first.
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<JobList>> {
    let owner = authorize(&state, &headers)?;
    let jobs = state.jobs.for_owner(&owner).list().map_err(map_err)?;
    Ok(Json(JobList { jobs }))
}

/// GET /jobs/{id}
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Job>> {
    let owner = authorize(&state, &headers)?;
    state
        .jobs
        .for_owner(&owner)
        .get(&id)
        .map_err(map_err)?
        .map(Json)
        .ok_or_else(|| map_err(SchedulerError::JobNotFound { id }))
}

/// DELETE /jobs/{id}: cancel a job in any state.
pub async fn delete_job(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let owner = authorize(&state, &headers)?;
    state.jobs.for_owner(&owner).delete(&id).map_err(map_err)?;
    Ok(StatusCode::NO_CONTENT)
}
