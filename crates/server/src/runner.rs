// crates/server/src/runner.rs
//! Job runner: lifecycle state machine and per-job item loop.
//!
//! One tokio task per job, bounded by a semaphore pool. Each task is the
//! single writer for its job id: counters, sequence assignment, and the
//! terminal transition all happen on that task, which is what makes the
//! monotonicity invariant hold without cross-task coordination.

use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::bus::ProgressBus;
use crate::publisher::{ProgressPublisher, ThrottleGate, DEFAULT_THROTTLE_PERCENT};
use jobstream_db::{self as db, Database, DbError};
use jobstream_types::{ItemOutcome, Job, JobId, JobStatus};

/// Longest `error_detail` recorded per event; keeps rows and wire frames bounded.
const MAX_ERROR_DETAIL_LEN: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("invalid transition: job {job_id} is {status}, expected pending")]
    InvalidTransition { job_id: JobId, status: JobStatus },

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error(transparent)]
    Db(#[from] DbError),
}

/// Runner tuning, resolved once at startup.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Jobs allowed to run simultaneously; submissions beyond this wait in `pending`.
    pub max_concurrent_jobs: usize,
    /// Minimum percentage-point advance between emitted progress events.
    pub throttle_percent: u8,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            throttle_percent: DEFAULT_THROTTLE_PERCENT,
        }
    }
}

/// Executes jobs against the history store and live bus.
///
/// Explicitly constructed and injected at startup; cheap to clone.
#[derive(Clone)]
pub struct JobRunner {
    db: Database,
    publisher: ProgressPublisher,
    permits: Arc<Semaphore>,
    config: RunnerConfig,
}

impl JobRunner {
    pub fn new(db: Database, bus: ProgressBus, config: RunnerConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));
        let publisher = ProgressPublisher::new(db.clone(), bus);
        Self {
            db,
            publisher,
            permits,
            config,
        }
    }

    /// Submit a new job: create it in `pending` and spawn its task.
    ///
    /// `work` is the collaborator-supplied unit-of-work sequence; the runner
    /// consumes at most `total_items` outcomes from it. Returns immediately
    /// with the new job id; the job starts once a pool permit is free.
    pub async fn submit<S>(&self, total_items: u64, work: S) -> Result<JobId, RunnerError>
    where
        S: Stream<Item = ItemOutcome> + Send + 'static,
    {
        let job = db::create_job(&self.db, total_items).await?;
        let job_id = job.id.clone();

        let runner = self.clone();
        let spawn_id = job_id.clone();
        tokio::spawn(async move {
            // Closed only on shutdown; nothing left to run then.
            let Ok(_permit) = runner.permits.acquire().await else {
                return;
            };
            if let Err(e) = runner.start(&spawn_id, work).await {
                error!(job_id = %spawn_id, error = %e, "job run failed");
            }
        });

        Ok(job_id)
    }

    /// Drive one job to a terminal state.
    ///
    /// Fails with `InvalidTransition` unless the job is `pending`. Starting
    /// a job that is already terminal is a no-op that re-publishes the stored
    /// terminal event instead of reprocessing items, so at-least-once job
    /// scheduling never duplicates work.
    pub async fn start<S>(&self, job_id: &str, work: S) -> Result<(), RunnerError>
    where
        S: Stream<Item = ItemOutcome> + Send + 'static,
    {
        let job = db::get_job(&self.db, job_id)
            .await?
            .ok_or_else(|| RunnerError::JobNotFound(job_id.to_string()))?;

        if job.status.is_terminal() {
            info!(job_id, status = %job.status, "job already terminal; re-emitting");
            if let Some(last) = db::last_event(&self.db, job_id).await? {
                self.publisher.republish(&last);
            } else {
                warn!(job_id, "terminal job has no recorded events");
            }
            return Ok(());
        }

        if !db::try_mark_running(&self.db, job_id).await? {
            // Lost the pending->running race, or the job is mid-run elsewhere.
            let now = db::get_job(&self.db, job_id)
                .await?
                .ok_or_else(|| RunnerError::JobNotFound(job_id.to_string()))?;
            return Err(RunnerError::InvalidTransition {
                job_id: job_id.to_string(),
                status: now.status,
            });
        }

        self.run_items(&job, work).await
    }

    /// The sequential per-item loop. Per-item failures become counters and
    /// `error_detail`, never errors; only store failures abort the run.
    async fn run_items<S>(&self, job: &Job, work: S) -> Result<(), RunnerError>
    where
        S: Stream<Item = ItemOutcome> + Send + 'static,
    {
        let job_id = &job.id;
        let total = job.total_items;
        let mut gate = ThrottleGate::new(self.config.throttle_percent, total);
        let mut processed: u64 = 0;
        let mut failed: u64 = 0;

        info!(job_id, total_items = total, "job started");

        let mut work = std::pin::pin!(work);
        while processed + failed < total {
            let outcome = match work.next().await {
                Some(outcome) => outcome,
                None => {
                    // The collaborator promised `total` items and delivered
                    // fewer: unrecoverable, fail with partial counts.
                    let detail = format!(
                        "work stream ended after {} of {} items",
                        processed + failed,
                        total
                    );
                    return self
                        .finish(job_id, &mut gate, processed, failed, JobStatus::Failed, Some(detail))
                        .await;
                }
            };

            let error_detail = match outcome {
                ItemOutcome::Ok => {
                    processed += 1;
                    None
                }
                ItemOutcome::Failed { detail } => {
                    failed += 1;
                    Some(truncate_detail(detail))
                }
                ItemOutcome::Abort { detail } => {
                    warn!(job_id, detail = %detail, "job aborted by work source");
                    return self
                        .finish(
                            job_id,
                            &mut gate,
                            processed,
                            failed,
                            JobStatus::Failed,
                            Some(truncate_detail(detail)),
                        )
                        .await;
                }
            };

            // Durable emit (when not throttled) completes before the next
            // item, preserving ordered sequence assignment.
            let emit = self
                .publisher
                .emit(
                    &mut gate,
                    db::EventInsert {
                        job_id: job_id.clone(),
                        processed_items: processed,
                        failed_items: failed,
                        status: JobStatus::Running,
                        error_detail,
                    },
                )
                .await;
            match emit {
                Ok(_) => {}
                Err(DbError::JobTerminal(_)) => {
                    // The reaper (or another writer) finished this job;
                    // stop quietly rather than fight over the row.
                    info!(job_id, "job taken over while running; stopping");
                    return Ok(());
                }
                Err(e) => {
                    self.record_failure_best_effort(job_id, processed, failed, &e)
                        .await;
                    return Err(e.into());
                }
            }
        }

        let status = if failed == 0 {
            JobStatus::Completed
        } else {
            JobStatus::CompletedWithErrors
        };
        self.finish(job_id, &mut gate, processed, failed, status, None)
            .await
    }

    /// Emit the terminal event. Terminal emission bypasses the throttle, so
    /// every finished job has exactly one terminal event in history.
    async fn finish(
        &self,
        job_id: &str,
        gate: &mut ThrottleGate,
        processed: u64,
        failed: u64,
        status: JobStatus,
        error_detail: Option<String>,
    ) -> Result<(), RunnerError> {
        let emit = self
            .publisher
            .emit(
                gate,
                db::EventInsert {
                    job_id: job_id.to_string(),
                    processed_items: processed,
                    failed_items: failed,
                    status,
                    error_detail,
                },
            )
            .await;
        match emit {
            Ok(_) => {}
            Err(DbError::JobTerminal(_)) => {
                info!(job_id, "job finished elsewhere; discarding result");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
        info!(
            job_id,
            status = %status,
            processed_items = processed,
            failed_items = failed,
            "job finished"
        );
        Ok(())
    }

    /// Try to record a `failed` terminal once the progress path itself has
    /// broken. If the store is still down this loses too; the stall reaper
    /// picks the job up later.
    async fn record_failure_best_effort(
        &self,
        job_id: &str,
        processed: u64,
        failed: u64,
        cause: &DbError,
    ) {
        let insert = db::EventInsert {
            job_id: job_id.to_string(),
            processed_items: processed,
            failed_items: failed,
            status: JobStatus::Failed,
            error_detail: Some(truncate_detail(format!("progress write failed: {cause}"))),
        };
        match db::append_event(&self.db, insert).await {
            Ok(_) => warn!(job_id, "job failed after progress write error"),
            Err(e) => {
                error!(job_id, error = %e, "could not record job failure; leaving it to the reaper")
            }
        }
    }

    /// Number of jobs that could start right now without waiting.
    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }
}

fn truncate_detail(detail: String) -> String {
    if detail.len() > MAX_ERROR_DETAIL_LEN {
        let mut cut = MAX_ERROR_DETAIL_LEN;
        while !detail.is_char_boundary(cut) {
            cut -= 1;
        }
        detail[..cut].to_string()
    } else {
        detail
    }
}
