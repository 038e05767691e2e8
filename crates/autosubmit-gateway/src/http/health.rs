use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::error;

use crate::app::AppState;

/// GET /health: liveness check with per-status job totals.
pub async fn health_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.jobs.status_counts() {
        Ok(counts) => Ok(Json(json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "jobs": counts,
        }))),
        Err(e) => {
            error!("health check: job store unavailable: {e}");
            Err((
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "degraded", "error": e.to_string() })),
            ))
        }
    }
}
