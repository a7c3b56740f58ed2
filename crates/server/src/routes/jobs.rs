// crates/server/src/routes/jobs.rs
//! Job inspection and history replay.
//!
//! - GET /api/jobs — list all jobs, newest first
//! - GET /api/jobs/{id} — one job snapshot
//! - GET /api/jobs/{id}/events?since=N[&limit=M] — history replay, ascending
//!   by sequence; the catch-up read clients use after (re)connect.

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

use crate::error::ApiError;
use crate::state::SharedState;
use jobstream_db as db;
use jobstream_types::{Job, ProgressEvent};

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(default)]
    since: i64,
    limit: Option<i64>,
}

async fn list_jobs(State(state): State<SharedState>) -> Result<Json<Vec<Job>>, ApiError> {
    Ok(Json(db::list_jobs(&state.db).await?))
}

async fn get_job(
    State(state): State<SharedState>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let job = db::get_job(&state.db, &job_id)
        .await?
        .ok_or(ApiError::JobNotFound(job_id))?;
    Ok(Json(job))
}

async fn list_events(
    State(state): State<SharedState>,
    Path(job_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<ProgressEvent>>, ApiError> {
    if query.since < 0 {
        return Err(ApiError::BadRequest("since must be >= 0".into()));
    }
    if query.limit.is_some_and(|l| l <= 0) {
        return Err(ApiError::BadRequest("limit must be > 0".into()));
    }
    // 404 for unknown jobs so clients can distinguish "no events yet"
    // from "no such job".
    if db::get_job(&state.db, &job_id).await?.is_none() {
        return Err(ApiError::JobNotFound(job_id));
    }
    let events = db::events_since(&state.db, &job_id, query.since, query.limit).await?;
    Ok(Json(events))
}

/// Build the jobs router.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/jobs", get(list_jobs))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/events", get(list_events))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ProgressBus;
    use crate::runner::{JobRunner, RunnerConfig};
    use crate::state::AppState;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use jobstream_db::{append_event, create_job, try_mark_running, Database, EventInsert};
    use jobstream_types::JobStatus;
    use tower::ServiceExt;

    async fn test_app() -> (Database, Router) {
        let db = Database::new_in_memory().await.unwrap();
        let bus = ProgressBus::new();
        let runner = JobRunner::new(db.clone(), bus.clone(), RunnerConfig::default());
        let state = AppState::new(db.clone(), bus, runner);
        let app = Router::new().nest("/api", router()).with_state(state);
        (db, app)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_list_jobs_empty() {
        let (_db, app) = test_app().await;
        let (status, json) = get_json(app, "/api/jobs").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_get_job_and_404() {
        let (db, app) = test_app().await;
        let job = create_job(&db, 5).await.unwrap();

        let (status, json) = get_json(app.clone(), &format!("/api/jobs/{}", job.id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["id"], job.id);
        assert_eq!(json["status"], "pending");
        assert_eq!(json["total_items"], 5);

        let (status, _) = get_json(app, "/api/jobs/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_events_since_endpoint() {
        let (db, app) = test_app().await;
        let job = create_job(&db, 4).await.unwrap();
        try_mark_running(&db, &job.id).await.unwrap();
        for i in 1..=4u64 {
            let status = if i == 4 {
                JobStatus::Completed
            } else {
                JobStatus::Running
            };
            append_event(
                &db,
                EventInsert {
                    job_id: job.id.clone(),
                    processed_items: i,
                    failed_items: 0,
                    status,
                    error_detail: None,
                },
            )
            .await
            .unwrap();
        }

        let (status, json) = get_json(app.clone(), &format!("/api/jobs/{}/events", job.id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json.as_array().unwrap().len(), 4);
        assert_eq!(json[0]["sequence"], 1);

        let (status, json) =
            get_json(app.clone(), &format!("/api/jobs/{}/events?since=2", job.id)).await;
        assert_eq!(status, StatusCode::OK);
        let seqs: Vec<i64> = json
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["sequence"].as_i64().unwrap())
            .collect();
        assert_eq!(seqs, vec![3, 4]);

        let (status, json) = get_json(
            app.clone(),
            &format!("/api/jobs/{}/events?since=0&limit=2", job.id),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json.as_array().unwrap().len(), 2);

        let (status, _) = get_json(app, "/api/jobs/missing/events").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_events_rejects_bad_params() {
        let (db, app) = test_app().await;
        let job = create_job(&db, 1).await.unwrap();

        let (status, _) =
            get_json(app.clone(), &format!("/api/jobs/{}/events?since=-1", job.id)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) =
            get_json(app, &format!("/api/jobs/{}/events?limit=0", job.id)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
