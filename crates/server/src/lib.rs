// crates/server/src/lib.rs
//! jobstream server library.
//!
//! Axum-based HTTP/WebSocket server for the batch-job progress subsystem:
//! REST history replay under `/api`, live fan-out at `/ws`, plus the job
//! runner, publisher, and stall reaper that feed them.

pub mod bus;
pub mod config;
pub mod error;
pub mod publisher;
pub mod reaper;
pub mod routes;
pub mod runner;
pub mod state;
pub mod ws;

pub use bus::{spawn_topic_pruner, ProgressBus};
pub use config::Config;
pub use error::{ApiError, ErrorResponse};
pub use publisher::{ProgressPublisher, ThrottleGate};
pub use reaper::{spawn_stall_reaper, ReaperConfig};
pub use runner::{JobRunner, RunnerConfig, RunnerError};
pub use state::{AppState, SharedState};

use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Create the Axum application with all routes and middleware.
///
/// The caller owns the infrastructure lifecycle (database, bus, runner,
/// background tasks); this only wires routes onto the injected state.
pub fn create_app(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .nest("/api", routes::api_routes())
        .route("/ws", get(ws::ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    async fn test_app() -> Router {
        let db = jobstream_db::Database::new_in_memory().await.unwrap();
        let bus = ProgressBus::new();
        let runner = JobRunner::new(db.clone(), bus.clone(), RunnerConfig::default());
        create_app(AppState::new(db, bus, runner))
    }

    #[tokio::test]
    async fn test_app_serves_health() {
        let app = test_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let app = test_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
