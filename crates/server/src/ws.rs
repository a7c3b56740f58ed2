// crates/server/src/ws.rs
//! Connection gateway: WebSocket fan-out of live progress events.
//!
//! Each connection owns a bounded outbound queue drained by a dedicated
//! send loop, so one slow client never blocks delivery to others. If a
//! connection's queue overflows, the connection is closed; the client
//! recovers through history replay on reconnect. Events are relayed
//! verbatim, never reordered or coalesced here.

use std::collections::HashMap;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::state::SharedState;

/// Outbound frames buffered per connection before it is considered too slow.
const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Control frames a client may send after connecting.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientCommand {
    Subscribe { job_id: String },
    Unsubscribe { job_id: String },
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    let connection_id = Uuid::new_v4().to_string();
    let (mut sink, mut stream) = socket.split();

    // Bounded queue between per-subscription relay tasks and the socket.
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_QUEUE_CAPACITY);
    let overflow = CancellationToken::new();

    // Dedicated send loop: the only task that touches the sink.
    let send_loop = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    info!(connection_id = %connection_id, "gateway connection opened");

    // Relay tasks by job id; dropped (aborted) on unsubscribe and on close.
    let mut subs: HashMap<String, tokio::task::JoinHandle<()>> = HashMap::new();

    loop {
        tokio::select! {
            _ = overflow.cancelled() => {
                warn!(connection_id = %connection_id, "outbound queue overflow; closing connection");
                break;
            }
            incoming = stream.next() => {
                let Some(Ok(msg)) = incoming else { break };
                match msg {
                    Message::Text(text) => {
                        match serde_json::from_str::<ClientCommand>(&text) {
                            Ok(ClientCommand::Subscribe { job_id }) => {
                                if subs.contains_key(&job_id) {
                                    continue; // already subscribed, idempotent
                                }
                                debug!(connection_id = %connection_id, job_id = %job_id, "subscribe");
                                let rx = state.bus.subscribe(&job_id);
                                let handle = tokio::spawn(relay_topic(
                                    rx,
                                    tx.clone(),
                                    overflow.clone(),
                                    job_id.clone(),
                                ));
                                subs.insert(job_id, handle);
                            }
                            Ok(ClientCommand::Unsubscribe { job_id }) => {
                                // Safe to call repeatedly; unknown ids are a no-op.
                                if let Some(handle) = subs.remove(&job_id) {
                                    handle.abort();
                                    debug!(connection_id = %connection_id, job_id = %job_id, "unsubscribe");
                                }
                            }
                            Err(_) => {
                                let _ = tx.try_send(
                                    r#"{"error":"expected {\"type\":\"subscribe\"|\"unsubscribe\",\"job_id\":...}"}"#.to_string(),
                                );
                            }
                        }
                    }
                    Message::Ping(_) => {
                        // Pong is handled automatically by axum
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    // Cleanup: subscriptions are in-memory only and die with the connection.
    for (_, handle) in subs.drain() {
        handle.abort();
    }
    drop(tx);
    send_loop.abort();
    info!(connection_id = %connection_id, "gateway connection closed");
}

/// Forward one job topic into the connection's outbound queue.
async fn relay_topic(
    mut rx: broadcast::Receiver<jobstream_types::ProgressEvent>,
    tx: mpsc::Sender<String>,
    overflow: CancellationToken,
    job_id: String,
) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                let frame = match serde_json::to_string(&event) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(job_id = %job_id, error = %e, "event serialization failed");
                        continue;
                    }
                };
                match tx.try_send(frame) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        // Backpressure bound hit: evict this connection
                        // rather than queue unboundedly.
                        overflow.cancel();
                        break;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                // Live delivery is best-effort; the client reconciles the
                // gap from history.
                warn!(job_id = %job_id, missed, "live subscriber lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
