// crates/client/src/reconciler.rs
//! Client-side merge of the live stream and history replay.
//!
//! Events arrive from two overlapping sources in no guaranteed relative
//! order. The reconciler applies an event only if its sequence is newer
//! than the last applied one for that job, which makes application
//! idempotent: any interleaving, duplication, or batching of the same
//! event set converges on the same view.

use std::collections::HashMap;

use jobstream_types::{JobId, JobStatus, ProgressEvent};

/// The reconciled view of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobView {
    pub job_id: JobId,
    pub last_applied_sequence: i64,
    pub processed_items: u64,
    pub failed_items: u64,
    pub total_items: u64,
    pub status: JobStatus,
    /// Most recent failure detail surfaced by an applied event.
    pub last_error_detail: Option<String>,
}

impl JobView {
    pub fn done_items(&self) -> u64 {
        self.processed_items + self.failed_items
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// De-duplicating, order-insensitive event sink.
#[derive(Debug, Default)]
pub struct Reconciler {
    jobs: HashMap<JobId, JobView>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one event. Returns `true` if it advanced the view, `false` if
    /// it was discarded as a duplicate or stale delivery.
    pub fn apply(&mut self, event: &ProgressEvent) -> bool {
        match self.jobs.get_mut(&event.job_id) {
            Some(view) => {
                if event.sequence <= view.last_applied_sequence {
                    return false;
                }
                view.last_applied_sequence = event.sequence;
                view.processed_items = event.processed_items;
                view.failed_items = event.failed_items;
                view.total_items = event.total_items;
                view.status = event.status;
                if event.error_detail.is_some() {
                    view.last_error_detail = event.error_detail.clone();
                }
                true
            }
            None => {
                self.jobs.insert(
                    event.job_id.clone(),
                    JobView {
                        job_id: event.job_id.clone(),
                        last_applied_sequence: event.sequence,
                        processed_items: event.processed_items,
                        failed_items: event.failed_items,
                        total_items: event.total_items,
                        status: event.status,
                        last_error_detail: event.error_detail.clone(),
                    },
                );
                true
            }
        }
    }

    /// Apply a batch (history replay) in the given order.
    /// Returns how many events advanced the view.
    pub fn apply_all<'a>(&mut self, events: impl IntoIterator<Item = &'a ProgressEvent>) -> usize {
        events.into_iter().filter(|e| self.apply(e)).count()
    }

    /// Current view of one job, if any event has been applied for it.
    pub fn view(&self, job_id: &str) -> Option<&JobView> {
        self.jobs.get(job_id)
    }

    /// The catch-up cursor: last applied sequence for a job (0 if none),
    /// i.e. the `since` value for the next history fetch.
    pub fn since(&self, job_id: &str) -> i64 {
        self.jobs
            .get(job_id)
            .map(|v| v.last_applied_sequence)
            .unwrap_or(0)
    }
}
