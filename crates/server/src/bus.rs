// crates/server/src/bus.rs
//! Ephemeral live bus: one broadcast topic per job id.
//!
//! Delivery is best-effort and non-durable. The bus exists purely for
//! low-latency fan-out; correctness always rests on the history store.
//! Topics are created lazily and garbage-collected once nobody listens.

use dashmap::DashMap;
use jobstream_types::ProgressEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

/// Buffered events per topic before slow receivers start lagging.
const TOPIC_CAPACITY: usize = 256;

/// Handle to the per-job broadcast topics.
///
/// Cheap to clone; constructed once at startup and injected into the
/// publisher and the gateway.
#[derive(Clone)]
pub struct ProgressBus {
    topics: Arc<DashMap<String, broadcast::Sender<ProgressEvent>>>,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self {
            topics: Arc::new(DashMap::new()),
        }
    }

    fn sender(&self, job_id: &str) -> broadcast::Sender<ProgressEvent> {
        self.topics
            .entry(job_id.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }

    /// Subscribe to future events for one job. Past events are not replayed
    /// here; that is the history service's job.
    pub fn subscribe(&self, job_id: &str) -> broadcast::Receiver<ProgressEvent> {
        self.sender(job_id).subscribe()
    }

    /// Publish an event to its job topic. Returns the number of live
    /// receivers it reached; zero is not an error.
    pub fn publish(&self, event: &ProgressEvent) -> usize {
        match self.sender(&event.job_id).send(event.clone()) {
            Ok(n) => n,
            Err(_) => 0,
        }
    }

    /// Drop topics nobody is subscribed to.
    pub fn prune_idle(&self) {
        self.topics.retain(|_, tx| tx.receiver_count() > 0);
    }

    /// Number of live topics (for health reporting and tests).
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the periodic topic garbage collector.
pub fn spawn_topic_pruner(bus: ProgressBus, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let before = bus.topic_count();
            bus.prune_idle();
            let after = bus.topic_count();
            if after < before {
                debug!(pruned = before - after, "pruned idle bus topics");
            }
        }
    })
}
