// crates/server/src/routes/health.rs
//! GET /api/health — liveness plus a few cheap gauges.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::error::ApiError;
use crate::state::SharedState;

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub jobs_total: usize,
    pub live_topics: usize,
    pub available_job_slots: usize,
}

async fn health(State(state): State<SharedState>) -> Result<Json<HealthResponse>, ApiError> {
    let jobs = jobstream_db::list_jobs(&state.db).await?;
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        jobs_total: jobs.len(),
        live_topics: state.bus.topic_count(),
        available_job_slots: state.runner.available_slots(),
    }))
}

pub fn router() -> Router<SharedState> {
    Router::new().route("/health", get(health))
}
