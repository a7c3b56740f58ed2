// crates/server/src/reaper.rs
//! Stalled-job reaper.
//!
//! A job that is `running` but whose `updated_at` has not advanced within
//! the heartbeat window is considered dead (crashed worker, hung item).
//! The reaper fails it through the same publisher path a normal failure
//! takes, so clients observe a synthetic terminal event identically.

use std::time::Duration;

use tracing::{info, warn};

use crate::bus::ProgressBus;
use crate::publisher::{ProgressPublisher, ThrottleGate};
use jobstream_db::{self as db, Database, DbResult};
use jobstream_types::JobStatus;

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// How long a running job may go without a heartbeat before it is failed.
    pub stall_timeout: Duration,
    /// How often the reaper scans for stalled jobs.
    pub poll_interval: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            stall_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(30),
        }
    }
}

/// One reap pass: fail every running job stalled past the timeout.
/// Returns how many jobs were reaped.
pub async fn reap_once(
    db: &Database,
    bus: &ProgressBus,
    stall_timeout: Duration,
) -> DbResult<usize> {
    let cutoff = db::now_ms() - stall_timeout.as_millis() as i64;
    let stalled = db::stalled_jobs(db, cutoff).await?;
    if stalled.is_empty() {
        return Ok(0);
    }

    let publisher = ProgressPublisher::new(db.clone(), bus.clone());
    let mut reaped = 0;
    for job in stalled {
        // Fresh gate per job: terminal events bypass throttling anyway.
        let mut gate = ThrottleGate::new(100, job.total_items);
        let detail = format!(
            "stalled: no progress within {}s",
            stall_timeout.as_secs()
        );
        warn!(job_id = %job.id, processed = job.processed_items, failed = job.failed_items, "reaping stalled job");
        let emit = publisher
            .emit(
                &mut gate,
                db::EventInsert {
                    job_id: job.id.clone(),
                    processed_items: job.processed_items,
                    failed_items: job.failed_items,
                    status: JobStatus::Failed,
                    error_detail: Some(detail),
                },
            )
            .await;
        match emit {
            Ok(_) => reaped += 1,
            // Finished between the scan and the write; nothing to reap.
            Err(db::DbError::JobTerminal(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(reaped)
}

/// Spawn the periodic reaper loop.
pub fn spawn_stall_reaper(
    db: Database,
    bus: ProgressBus,
    config: ReaperConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            stall_timeout_secs = config.stall_timeout.as_secs(),
            poll_secs = config.poll_interval.as_secs(),
            "stall reaper started"
        );
        loop {
            tokio::time::sleep(config.poll_interval).await;
            match reap_once(&db, &bus, config.stall_timeout).await {
                Ok(0) => {}
                Ok(n) => info!(reaped = n, "stalled jobs failed"),
                Err(e) => warn!(error = %e, "reap pass failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobstream_db::{create_job, events_since, get_job, try_mark_running};

    #[tokio::test]
    async fn test_reap_stalled_running_job() {
        let db = Database::new_in_memory().await.unwrap();
        let bus = ProgressBus::new();

        let job = create_job(&db, 10).await.unwrap();
        try_mark_running(&db, &job.id).await.unwrap();

        // Zero timeout: the job's last heartbeat is immediately too old.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let reaped = reap_once(&db, &bus, Duration::ZERO).await.unwrap();
        assert_eq!(reaped, 1);

        let job = get_job(&db, &job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.completed_at.is_some());

        let events = events_since(&db, &job.id, 0, None).await.unwrap();
        let last = events.last().unwrap();
        assert_eq!(last.status, JobStatus::Failed);
        assert!(last.error_detail.as_deref().unwrap().starts_with("stalled"));
    }

    #[tokio::test]
    async fn test_reap_ignores_live_and_terminal_jobs() {
        let db = Database::new_in_memory().await.unwrap();
        let bus = ProgressBus::new();

        // Pending job: not running, never reaped.
        let pending = create_job(&db, 10).await.unwrap();

        // Running job with a fresh heartbeat.
        let fresh = create_job(&db, 10).await.unwrap();
        try_mark_running(&db, &fresh.id).await.unwrap();

        let reaped = reap_once(&db, &bus, Duration::from_secs(3600)).await.unwrap();
        assert_eq!(reaped, 0);

        assert_eq!(
            get_job(&db, &pending.id).await.unwrap().unwrap().status,
            JobStatus::Pending
        );
        assert_eq!(
            get_job(&db, &fresh.id).await.unwrap().unwrap().status,
            JobStatus::Running
        );
    }

    #[tokio::test]
    async fn test_reaped_job_stays_failed_despite_live_runner() {
        use crate::runner::{JobRunner, RunnerConfig};
        use jobstream_types::ItemOutcome;

        let db = Database::new_in_memory().await.unwrap();
        let bus = ProgressBus::new();
        let runner = JobRunner::new(
            db.clone(),
            bus.clone(),
            RunnerConfig {
                max_concurrent_jobs: 2,
                throttle_percent: 5,
            },
        );

        // A runner that pauses mid-stream, long enough to look dead.
        let work = async_stream::stream! {
            yield ItemOutcome::Ok;
            yield ItemOutcome::Ok;
            tokio::time::sleep(Duration::from_millis(200)).await;
            for _ in 0..8 {
                yield ItemOutcome::Ok;
            }
        };
        let job = create_job(&db, 10).await.unwrap();
        let run = {
            let runner = runner.clone();
            let job_id = job.id.clone();
            tokio::spawn(async move { runner.start(&job_id, work).await })
        };

        // Reap while the runner is paused, then let it resume.
        tokio::time::sleep(Duration::from_millis(80)).await;
        let reaped = reap_once(&db, &bus, Duration::ZERO).await.unwrap();
        assert_eq!(reaped, 1);

        // The resumed runner must notice the takeover and stop quietly,
        // not resurrect the job or add a second terminal event.
        run.await.unwrap().unwrap();
        let row = get_job(&db, &job.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Failed);
        let events = events_since(&db, &job.id, 0, None).await.unwrap();
        assert_eq!(
            events.iter().filter(|e| e.status.is_terminal()).count(),
            1
        );
        assert!(events.last().unwrap().status.is_terminal());
    }

    #[tokio::test]
    async fn test_reaped_event_reaches_live_subscribers() {
        let db = Database::new_in_memory().await.unwrap();
        let bus = ProgressBus::new();

        let job = create_job(&db, 10).await.unwrap();
        try_mark_running(&db, &job.id).await.unwrap();
        let mut rx = bus.subscribe(&job.id);

        tokio::time::sleep(Duration::from_millis(5)).await;
        reap_once(&db, &bus, Duration::ZERO).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.status, JobStatus::Failed);
    }
}
