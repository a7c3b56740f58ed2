// crates/server/src/publisher.rs
//! Progress publisher: throttling gate + dual write.
//!
//! `emit` is the single entry point for making progress visible. It always
//! writes durably before publishing to the live bus, so any event a client
//! sees live is already recoverable via history replay. A store failure
//! aborts the emit and propagates; a bus "failure" (no listeners, topic
//! backlog) is logged and swallowed.

use std::time::Duration;

use crate::bus::ProgressBus;
use jobstream_db::{append_event, touch_job, Database, DbError, DbResult, EventInsert};
use jobstream_types::ProgressEvent;
use tracing::{debug, warn};

/// Default minimum advance, in percentage points, between emitted events.
pub const DEFAULT_THROTTLE_PERCENT: u8 = 5;

/// Retries of a failed durable append before the error propagates.
const APPEND_RETRIES: u32 = 2;

/// Per-job throttling state. Owned by the runner task that drives the job,
/// which keeps emission single-writer.
#[derive(Debug)]
pub struct ThrottleGate {
    threshold_percent: u8,
    total_items: u64,
    last_emitted_done: Option<u64>,
}

impl ThrottleGate {
    pub fn new(threshold_percent: u8, total_items: u64) -> Self {
        Self {
            threshold_percent: threshold_percent.max(1),
            total_items,
            last_emitted_done: None,
        }
    }

    /// Emit iff: first event for the job, terminal, or the done-percentage
    /// advanced by at least the threshold since the last emitted event.
    /// Caps event volume at roughly `100 / threshold + 2` per job.
    fn should_emit(&self, done: u64, terminal: bool) -> bool {
        if terminal {
            return true;
        }
        let Some(last) = self.last_emitted_done else {
            return true;
        };
        if self.total_items == 0 {
            // Zero-item jobs only ever emit first + terminal.
            return false;
        }
        // Integer form of (done - last) / total >= threshold / 100.
        (done.saturating_sub(last)) * 100 >= u64::from(self.threshold_percent) * self.total_items
    }

    fn mark_emitted(&mut self, done: u64) {
        self.last_emitted_done = Some(done);
    }
}

/// Dual-writing publisher. Cheap to clone; holds injected store and bus
/// handles rather than process-wide globals.
#[derive(Clone)]
pub struct ProgressPublisher {
    db: Database,
    bus: ProgressBus,
}

impl ProgressPublisher {
    pub fn new(db: Database, bus: ProgressBus) -> Self {
        Self { db, bus }
    }

    /// Emit one progress increment, subject to the gate's throttle.
    ///
    /// Returns `Ok(None)` when throttled, `Ok(Some(event))` once the event
    /// is durably committed (and, best-effort, on the live bus). The durable
    /// write happens-before the live publish; there is no code path that
    /// publishes an unpersisted event.
    pub async fn emit(
        &self,
        gate: &mut ThrottleGate,
        insert: EventInsert,
    ) -> DbResult<Option<ProgressEvent>> {
        let done = insert.processed_items + insert.failed_items;
        let terminal = insert.status.is_terminal();
        if !gate.should_emit(done, terminal) {
            // Suppressed progress still counts as a heartbeat, so a slow
            // job is not reaped while genuinely advancing.
            touch_job(&self.db, &insert.job_id).await?;
            return Ok(None);
        }

        let event = self.append_with_retry(insert).await?;
        gate.mark_emitted(done);

        let reached = self.bus.publish(&event);
        debug!(
            job_id = %event.job_id,
            sequence = event.sequence,
            status = %event.status,
            receivers = reached,
            "progress event emitted"
        );
        Ok(Some(event))
    }

    /// Append with a short bounded retry on transient store errors.
    /// `JobNotFound` / `JobTerminal` are definitive and never retried.
    async fn append_with_retry(&self, insert: EventInsert) -> DbResult<ProgressEvent> {
        let mut attempt = 0;
        loop {
            match append_event(&self.db, insert.clone()).await {
                Ok(event) => return Ok(event),
                Err(DbError::Sqlx(e)) if attempt < APPEND_RETRIES => {
                    attempt += 1;
                    warn!(
                        job_id = %insert.job_id,
                        error = %e,
                        attempt,
                        "durable append failed; retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Re-publish an already-durable event to the live bus.
    ///
    /// Used when a terminal job is started again under at-least-once
    /// scheduling: clients get the terminal state without a duplicate
    /// history row.
    pub fn republish(&self, event: &ProgressEvent) {
        let reached = self.bus.publish(event);
        if reached == 0 {
            warn!(job_id = %event.job_id, sequence = event.sequence, "republish reached no live subscribers");
        }
    }
}
