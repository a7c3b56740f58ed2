// crates/server/src/state.rs
//! Application state for the Axum server.
//!
//! All infrastructure handles are constructed explicitly at startup and
//! injected here; no process-wide singletons.

use std::sync::Arc;
use std::time::Instant;

use crate::bus::ProgressBus;
use crate::runner::JobRunner;
use jobstream_db::Database;

/// Shared application state accessible from all route handlers.
pub struct AppState {
    /// Server start time for uptime tracking.
    pub start_time: Instant,
    /// History store handle.
    pub db: Database,
    /// Live bus handle (gateway subscribes, publisher publishes).
    pub bus: ProgressBus,
    /// Job runner for collaborator submissions.
    pub runner: JobRunner,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Create a new application state wrapped in an Arc for sharing.
    pub fn new(db: Database, bus: ProgressBus, runner: JobRunner) -> SharedState {
        Arc::new(Self {
            start_time: Instant::now(),
            db,
            bus,
            runner,
        })
    }
}
