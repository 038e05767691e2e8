use std::sync::Arc;

use autosubmit_core::AutosubmitConfig;
use autosubmit_scheduler::JobStore;
use axum::{
    routing::get,
    Router,
};

/// Central shared state: passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: AutosubmitConfig,
    /// The API's own connection; workers hold separate ones.
    pub jobs: Arc<JobStore>,
}

impl AppState {
    pub fn new(config: AutosubmitConfig, jobs: Arc<JobStore>) -> Self {
        Self { config, jobs }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route(
            "/jobs",
            get(crate::http::jobs::list_jobs).post(crate::http::jobs::create_job),
        )
        .route(
            "/jobs/{id}",
            get(crate::http::jobs::get_job).delete(crate::http::jobs::delete_job),
        )
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
