// crates/server/src/routes/mod.rs
//! REST API routes.

pub mod health;
pub mod jobs;

use axum::Router;

use crate::state::SharedState;

/// Build the `/api` router.
pub fn api_routes() -> Router<SharedState> {
    Router::new().merge(health::router()).merge(jobs::router())
}
