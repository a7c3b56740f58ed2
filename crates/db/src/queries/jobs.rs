// crates/db/src/queries/jobs.rs
//! Job row persistence: creation, lookup, and the single guarded
//! `pending -> running` transition.

use crate::{now_ms, Database, DbError, DbResult};
use jobstream_types::{Job, JobId, JobStatus};
use sqlx::Row;
use uuid::Uuid;

/// Raw `jobs` row before the status string is validated.
#[derive(Debug, Clone)]
struct JobRow {
    id: String,
    status: String,
    total_items: i64,
    processed_items: i64,
    failed_items: i64,
    created_at: i64,
    updated_at: i64,
    completed_at: Option<i64>,
}

impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for JobRow {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            status: row.try_get("status")?,
            total_items: row.try_get("total_items")?,
            processed_items: row.try_get("processed_items")?,
            failed_items: row.try_get("failed_items")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = DbError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status: JobStatus = row
            .status
            .parse()
            .map_err(|_| DbError::CorruptRow(format!("job {}: status {}", row.id, row.status)))?;
        Ok(Job {
            id: row.id,
            status,
            total_items: row.total_items as u64,
            processed_items: row.processed_items as u64,
            failed_items: row.failed_items as u64,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

/// Create a new job in `pending` with a fresh opaque id.
///
/// `total_items` is fixed for the lifetime of the job.
pub async fn create_job(db: &Database, total_items: u64) -> DbResult<Job> {
    let id: JobId = Uuid::new_v4().to_string();
    let now = now_ms();
    sqlx::query(
        "INSERT INTO jobs (id, status, total_items, processed_items, failed_items, created_at, updated_at)
         VALUES (?, 'pending', ?, 0, 0, ?, ?)",
    )
    .bind(&id)
    .bind(total_items as i64)
    .bind(now)
    .bind(now)
    .execute(db.pool())
    .await?;

    Ok(Job {
        id,
        status: JobStatus::Pending,
        total_items,
        processed_items: 0,
        failed_items: 0,
        created_at: now,
        updated_at: now,
        completed_at: None,
    })
}

/// Fetch one job by id.
pub async fn get_job(db: &Database, job_id: &str) -> DbResult<Option<Job>> {
    let row: Option<JobRow> = sqlx::query_as(
        "SELECT id, status, total_items, processed_items, failed_items, created_at, updated_at, completed_at
         FROM jobs WHERE id = ?",
    )
    .bind(job_id)
    .fetch_optional(db.pool())
    .await?;

    row.map(Job::try_from).transpose()
}

/// List all jobs, newest first.
pub async fn list_jobs(db: &Database) -> DbResult<Vec<Job>> {
    let rows: Vec<JobRow> = sqlx::query_as(
        "SELECT id, status, total_items, processed_items, failed_items, created_at, updated_at, completed_at
         FROM jobs ORDER BY created_at DESC, id DESC",
    )
    .fetch_all(db.pool())
    .await?;

    rows.into_iter().map(Job::try_from).collect()
}

/// Attempt the `pending -> running` transition.
///
/// Returns `true` if this call performed the transition. The guard in the
/// WHERE clause makes concurrent or repeated starts lose cleanly instead of
/// clobbering a running or terminal row.
pub async fn try_mark_running(db: &Database, job_id: &str) -> DbResult<bool> {
    let result = sqlx::query(
        "UPDATE jobs SET status = 'running', updated_at = ? WHERE id = ? AND status = 'pending'",
    )
    .bind(now_ms())
    .bind(job_id)
    .execute(db.pool())
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Advance a running job's heartbeat without recording an event.
///
/// Called for progress the throttle suppressed, so a slow but live job is
/// never mistaken for a stalled one. No-op unless the job is `running`.
pub async fn touch_job(db: &Database, job_id: &str) -> DbResult<()> {
    sqlx::query("UPDATE jobs SET updated_at = ? WHERE id = ? AND status = 'running'")
        .bind(now_ms())
        .bind(job_id)
        .execute(db.pool())
        .await?;
    Ok(())
}

/// Jobs stuck in `running` whose `updated_at` has not advanced past `cutoff_ms`.
pub async fn stalled_jobs(db: &Database, cutoff_ms: i64) -> DbResult<Vec<Job>> {
    let rows: Vec<JobRow> = sqlx::query_as(
        "SELECT id, status, total_items, processed_items, failed_items, created_at, updated_at, completed_at
         FROM jobs WHERE status = 'running' AND updated_at < ?
         ORDER BY updated_at ASC",
    )
    .bind(cutoff_ms)
    .fetch_all(db.pool())
    .await?;

    rows.into_iter().map(Job::try_from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_get_job() {
        let db = Database::new_in_memory().await.unwrap();

        let job = create_job(&db, 50).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.total_items, 50);

        let fetched = get_job(&db, &job.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, job.id);
        assert_eq!(fetched.status, JobStatus::Pending);
        assert_eq!(fetched.processed_items, 0);
        assert!(fetched.completed_at.is_none());

        assert!(get_job(&db, "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_running_guard() {
        let db = Database::new_in_memory().await.unwrap();
        let job = create_job(&db, 10).await.unwrap();

        assert!(try_mark_running(&db, &job.id).await.unwrap());
        // Second start loses: the row is no longer pending.
        assert!(!try_mark_running(&db, &job.id).await.unwrap());

        let fetched = get_job(&db, &job.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_stalled_jobs_scan() {
        let db = Database::new_in_memory().await.unwrap();
        let job = create_job(&db, 10).await.unwrap();
        try_mark_running(&db, &job.id).await.unwrap();

        // Nothing is stalled relative to a cutoff in the past.
        let stalled = stalled_jobs(&db, 0).await.unwrap();
        assert!(stalled.is_empty());

        // Everything running is stalled relative to a cutoff in the future.
        let stalled = stalled_jobs(&db, now_ms() + 60_000).await.unwrap();
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].id, job.id);
    }
}
