// crates/client/src/follower.rs
//! Live-following loop: WebSocket subscription plus history catch-up.
//!
//! On every (re)connect the follower subscribes to the live topic, then
//! fetches history with `since = last applied sequence` and applies it.
//! The two sources overlap by design; the reconciler's sequence check
//! discards the duplicates. A dropped connection moves the follower into
//! `Reconnecting` and retries with exponential backoff, so no progress is
//! ever silently lost across a disconnect.

use std::sync::{Arc, Mutex, PoisonError};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::reconciler::{JobView, Reconciler};
use crate::reconnect::Backoff;
use jobstream_types::ProgressEvent;

/// Where the follower currently stands with the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Connecting,
    Live,
    Reconnecting,
    /// The followed job reached a terminal state; no further connection
    /// activity will happen.
    Done,
}

#[derive(Debug, thiserror::Error)]
pub enum FollowError {
    #[error("invalid server url: {0}")]
    BadUrl(String),

    #[error("history fetch failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Follows one or more jobs on a jobstream server until they finish.
pub struct JobFollower {
    /// HTTP base, e.g. `http://127.0.0.1:48610`.
    base_url: String,
    http: reqwest::Client,
    reconciler: Arc<Mutex<Reconciler>>,
    phase_tx: watch::Sender<ConnectionPhase>,
    backoff: Backoff,
}

impl JobFollower {
    /// Create a follower plus a receiver for connection-phase changes
    /// (so a UI can render a `reconnecting` indicator).
    pub fn new(base_url: impl Into<String>) -> (Self, watch::Receiver<ConnectionPhase>) {
        let (phase_tx, phase_rx) = watch::channel(ConnectionPhase::Connecting);
        (
            Self {
                base_url: base_url.into().trim_end_matches('/').to_string(),
                http: reqwest::Client::new(),
                reconciler: Arc::new(Mutex::new(Reconciler::new())),
                phase_tx,
                backoff: Backoff::default(),
            },
            phase_rx,
        )
    }

    /// Shared handle to the underlying reconciled view.
    pub fn reconciler(&self) -> Arc<Mutex<Reconciler>> {
        Arc::clone(&self.reconciler)
    }

    /// Follow one job until it reaches a terminal state, reconnecting as
    /// needed. Returns the terminal view.
    pub async fn follow(&mut self, job_id: &str) -> Result<JobView, FollowError> {
        // A malformed base url can never succeed; fail before any retry loop.
        let ws_url = self.ws_url()?;
        let mut first_attempt = true;
        loop {
            self.set_phase(if first_attempt {
                ConnectionPhase::Connecting
            } else {
                ConnectionPhase::Reconnecting
            });

            match self.connect_and_stream(&ws_url, job_id).await {
                Ok(Some(view)) => {
                    self.set_phase(ConnectionPhase::Done);
                    return Ok(view);
                }
                Ok(None) => {
                    // Server closed the connection; state may have moved on.
                    info!(job_id, "live connection closed; will catch up on reconnect");
                }
                Err(e) => {
                    warn!(job_id, error = %e, "live connection failed");
                }
            }

            first_attempt = false;
            tokio::time::sleep(self.backoff.next_delay()).await;
        }
    }

    /// One connection lifetime: subscribe, catch up, relay live events.
    /// Returns `Ok(Some(view))` once the job is terminal, `Ok(None)` if the
    /// connection dropped first.
    async fn connect_and_stream(
        &mut self,
        ws_url: &str,
        job_id: &str,
    ) -> Result<Option<JobView>, FollowError> {
        let (mut socket, _) = connect_async(ws_url).await?;

        // Subscribe before the history fetch so no event can fall between
        // the replay window and the live stream. The overlap this creates
        // is resolved by sequence-based dedupe.
        let frame = format!(r#"{{"type":"subscribe","job_id":"{job_id}"}}"#);
        socket.send(Message::Text(frame.into())).await?;

        let since = self.lock_reconciler().since(job_id);
        let history = self.fetch_events(job_id, since).await?;
        debug!(job_id, since, replayed = history.len(), "history catch-up");
        {
            let mut rec = self.lock_reconciler();
            rec.apply_all(&history);
            if let Some(view) = rec.view(job_id) {
                if view.is_terminal() {
                    return Ok(Some(view.clone()));
                }
            }
        }

        self.set_phase(ConnectionPhase::Live);
        self.backoff.reset();

        while let Some(frame) = socket.next().await {
            let msg = frame?;
            let Message::Text(text) = msg else { continue };
            // Non-event frames (e.g. gateway error replies) are skipped.
            let Ok(event) = serde_json::from_str::<ProgressEvent>(&text) else {
                continue;
            };
            let mut rec = self.lock_reconciler();
            rec.apply(&event);
            if let Some(view) = rec.view(job_id) {
                if view.is_terminal() {
                    return Ok(Some(view.clone()));
                }
            }
        }

        Ok(None)
    }

    async fn fetch_events(
        &self,
        job_id: &str,
        since: i64,
    ) -> Result<Vec<ProgressEvent>, FollowError> {
        let url = format!("{}/api/jobs/{job_id}/events?since={since}", self.base_url);
        let events = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<ProgressEvent>>()
            .await?;
        Ok(events)
    }

    fn ws_url(&self) -> Result<String, FollowError> {
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(FollowError::BadUrl(self.base_url.clone()));
        };
        Ok(format!("{ws_base}/ws"))
    }

    fn lock_reconciler(&self) -> std::sync::MutexGuard<'_, Reconciler> {
        self.reconciler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, phase: ConnectionPhase) {
        let _ = self.phase_tx.send(phase);
    }
}
