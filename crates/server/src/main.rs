// crates/server/src/main.rs
//! jobstream server binary.
//!
//! Constructs the infrastructure handles (database, live bus, runner),
//! spawns the background tasks (stall reaper, topic pruner), then serves
//! the HTTP/WebSocket API.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use jobstream_db::Database;
use jobstream_server::{
    create_app, spawn_stall_reaper, spawn_topic_pruner, AppState, Config, JobRunner, ProgressBus,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn,jobstream=info".into()),
        )
        .init();

    let config = Config::from_env();

    let db = match &config.db_path {
        Some(path) => Database::new(path).await?,
        None => Database::open_default().await?,
    };

    let bus = ProgressBus::new();
    let runner = JobRunner::new(db.clone(), bus.clone(), config.runner.clone());

    spawn_stall_reaper(db.clone(), bus.clone(), config.reaper.clone());
    spawn_topic_pruner(bus.clone(), Duration::from_secs(60));

    let state = AppState::new(db, bus, runner);
    let app = create_app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("jobstream server listening on {addr}");
    axum::serve(listener, app).await?;

    Ok(())
}
