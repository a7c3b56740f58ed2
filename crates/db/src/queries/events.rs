// crates/db/src/queries/events.rs
//! Append-only progress event log.
//!
//! `append_event` is the durable half of the publisher's dual write: it
//! assigns the next per-job sequence and updates the job row in one
//! transaction, so a sequence is never observable without its event and a
//! job row never runs ahead of its log.

use crate::{now_ms, Database, DbError, DbResult};
use jobstream_types::{JobStatus, ProgressEvent};
use sqlx::Row;

/// Input to [`append_event`]: the counter snapshot the runner wants recorded.
#[derive(Debug, Clone)]
pub struct EventInsert {
    pub job_id: String,
    pub processed_items: u64,
    pub failed_items: u64,
    pub status: JobStatus,
    pub error_detail: Option<String>,
}

/// Raw `progress_events` row.
#[derive(Debug)]
struct EventRow {
    job_id: String,
    sequence: i64,
    processed_items: i64,
    failed_items: i64,
    total_items: i64,
    status: String,
    error_detail: Option<String>,
}

impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for EventRow {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            job_id: row.try_get("job_id")?,
            sequence: row.try_get("sequence")?,
            processed_items: row.try_get("processed_items")?,
            failed_items: row.try_get("failed_items")?,
            total_items: row.try_get("total_items")?,
            status: row.try_get("status")?,
            error_detail: row.try_get("error_detail")?,
        })
    }
}

impl TryFrom<EventRow> for ProgressEvent {
    type Error = DbError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let status: JobStatus = row.status.parse().map_err(|_| {
            DbError::CorruptRow(format!("event {}#{}: status {}", row.job_id, row.sequence, row.status))
        })?;
        Ok(ProgressEvent {
            job_id: row.job_id,
            sequence: row.sequence,
            processed_items: row.processed_items as u64,
            failed_items: row.failed_items as u64,
            total_items: row.total_items as u64,
            status,
            error_detail: row.error_detail,
        })
    }
}

/// Durably append one progress event and sync the job row, atomically.
///
/// Sequence assignment (`MAX(sequence) + 1`) is safe under the single-writer
/// discipline: exactly one runner task owns writes for a given job id. The
/// reaper can take a job over, so the transaction also checks the current
/// status and rejects the append with [`DbError::JobTerminal`] once a
/// terminal event exists; a terminal row is never mutated again.
/// `completed_at` is set the first time a terminal status is recorded.
pub async fn append_event(db: &Database, insert: EventInsert) -> DbResult<ProgressEvent> {
    let mut tx = db.pool().begin().await?;

    let row: Option<(i64, String)> =
        sqlx::query_as("SELECT total_items, status FROM jobs WHERE id = ?")
            .bind(&insert.job_id)
            .fetch_optional(&mut *tx)
            .await?;
    let Some((total_items, current)) = row else {
        return Err(DbError::JobNotFound(insert.job_id));
    };
    let current: JobStatus = current.parse().map_err(|_| {
        DbError::CorruptRow(format!("job {}: status {}", insert.job_id, current))
    })?;
    if current.is_terminal() {
        return Err(DbError::JobTerminal(insert.job_id));
    }

    let (next_seq,): (i64,) = sqlx::query_as(
        "SELECT COALESCE(MAX(sequence), 0) + 1 FROM progress_events WHERE job_id = ?",
    )
    .bind(&insert.job_id)
    .fetch_one(&mut *tx)
    .await?;

    let now = now_ms();
    sqlx::query(
        "INSERT INTO progress_events
             (job_id, sequence, processed_items, failed_items, total_items, status, error_detail, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&insert.job_id)
    .bind(next_seq)
    .bind(insert.processed_items as i64)
    .bind(insert.failed_items as i64)
    .bind(total_items)
    .bind(insert.status.as_str())
    .bind(&insert.error_detail)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    if insert.status.is_terminal() {
        sqlx::query(
            "UPDATE jobs SET status = ?, processed_items = ?, failed_items = ?, updated_at = ?,
                 completed_at = COALESCE(completed_at, ?)
             WHERE id = ?",
        )
        .bind(insert.status.as_str())
        .bind(insert.processed_items as i64)
        .bind(insert.failed_items as i64)
        .bind(now)
        .bind(now)
        .bind(&insert.job_id)
        .execute(&mut *tx)
        .await?;
    } else {
        sqlx::query(
            "UPDATE jobs SET status = ?, processed_items = ?, failed_items = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(insert.status.as_str())
        .bind(insert.processed_items as i64)
        .bind(insert.failed_items as i64)
        .bind(now)
        .bind(&insert.job_id)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    Ok(ProgressEvent {
        job_id: insert.job_id,
        sequence: next_seq,
        processed_items: insert.processed_items,
        failed_items: insert.failed_items,
        total_items: total_items as u64,
        status: insert.status,
        error_detail: insert.error_detail,
    })
}

/// Fetch events for a job with `sequence > since`, ascending, optionally capped.
///
/// This is the history replay read: idempotent, stable, total order per job.
pub async fn events_since(
    db: &Database,
    job_id: &str,
    since: i64,
    limit: Option<i64>,
) -> DbResult<Vec<ProgressEvent>> {
    let rows: Vec<EventRow> = match limit {
        Some(limit) => {
            sqlx::query_as(
                "SELECT job_id, sequence, processed_items, failed_items, total_items, status, error_detail
                 FROM progress_events
                 WHERE job_id = ? AND sequence > ?
                 ORDER BY sequence ASC
                 LIMIT ?",
            )
            .bind(job_id)
            .bind(since)
            .bind(limit)
            .fetch_all(db.pool())
            .await?
        }
        None => {
            sqlx::query_as(
                "SELECT job_id, sequence, processed_items, failed_items, total_items, status, error_detail
                 FROM progress_events
                 WHERE job_id = ? AND sequence > ?
                 ORDER BY sequence ASC",
            )
            .bind(job_id)
            .bind(since)
            .fetch_all(db.pool())
            .await?
        }
    };

    rows.into_iter().map(ProgressEvent::try_from).collect()
}

/// The most recent event for a job, if any.
pub async fn last_event(db: &Database, job_id: &str) -> DbResult<Option<ProgressEvent>> {
    let row: Option<EventRow> = sqlx::query_as(
        "SELECT job_id, sequence, processed_items, failed_items, total_items, status, error_detail
         FROM progress_events
         WHERE job_id = ?
         ORDER BY sequence DESC
         LIMIT 1",
    )
    .bind(job_id)
    .fetch_optional(db.pool())
    .await?;

    row.map(ProgressEvent::try_from).transpose()
}
