/// Inline SQL migrations for the jobstream schema.
///
/// We use simple inline migrations rather than sqlx migration files
/// because the schema is small and self-contained.

pub const MIGRATIONS: &[&str] = &[
    // Migration 1: jobs table
    r#"
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL DEFAULT 'pending',
    total_items INTEGER NOT NULL DEFAULT 0,
    processed_items INTEGER NOT NULL DEFAULT 0,
    failed_items INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    completed_at INTEGER
);
"#,
    // Migration 2: append-only progress event log
    r#"
CREATE TABLE IF NOT EXISTS progress_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    processed_items INTEGER NOT NULL,
    failed_items INTEGER NOT NULL,
    total_items INTEGER NOT NULL,
    status TEXT NOT NULL,
    error_detail TEXT,
    created_at INTEGER NOT NULL,
    UNIQUE(job_id, sequence)
);
"#,
    // Migration 3: replay reads are always (job_id, sequence > ?)
    r#"
CREATE INDEX IF NOT EXISTS idx_events_job_seq ON progress_events(job_id, sequence);
"#,
    // Migration 4: stall scan reads running jobs by updated_at
    r#"
CREATE INDEX IF NOT EXISTS idx_jobs_status_updated ON jobs(status, updated_at);
"#,
];
