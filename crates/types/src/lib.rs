// crates/types/src/lib.rs
//! Shared wire and domain types for the jobstream progress subsystem.
//!
//! These types are used on both sides of the wire: the server appends and
//! publishes [`ProgressEvent`]s, the client reconciles them. Wire keys are
//! snake_case and stable; clients of any language parse the same shape.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unique identifier of a batch job. Opaque to clients (UUIDv4 in practice).
pub type JobId = String;

/// Lifecycle status of a batch job.
///
/// `pending → running → {completed | completed_with_errors | failed}`.
/// Terminal states are never left once entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl JobStatus {
    /// True once the job can never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::CompletedWithErrors | JobStatus::Failed
        )
    }

    /// Stable string form, matching the wire encoding.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::CompletedWithErrors => "completed_with_errors",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "completed_with_errors" => Ok(JobStatus::CompletedWithErrors),
            "failed" => Ok(JobStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status string that is not part of the lifecycle model.
#[derive(Debug, Error)]
#[error("unknown job status: {0}")]
pub struct UnknownStatus(pub String);

/// A batch job row as exposed over the REST API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub total_items: u64,
    pub processed_items: u64,
    pub failed_items: u64,
    /// Unix epoch milliseconds.
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
}

impl Job {
    /// Items accounted for so far (succeeded + failed).
    pub fn done_items(&self) -> u64 {
        self.processed_items + self.failed_items
    }
}

/// One immutable, sequenced snapshot of a job's progress.
///
/// This is the wire message relayed over the live bus and returned by the
/// history API. `sequence` is strictly increasing per job and is the only
/// ordering key; wall-clock time is never used for ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub sequence: i64,
    pub processed_items: u64,
    pub failed_items: u64,
    pub total_items: u64,
    pub status: JobStatus,
    pub error_detail: Option<String>,
}

impl ProgressEvent {
    /// Items accounted for at the time this event was emitted.
    pub fn done_items(&self) -> u64 {
        self.processed_items + self.failed_items
    }
}

/// Outcome of one unit of work inside a job's item loop.
///
/// Supplied by the job-submission collaborator; the runner only inspects
/// success/failure and the optional failure detail. `Abort` signals an
/// unrecoverable runner-level error (not a per-item failure): the job stops
/// with status `failed` and whatever partial counts exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Ok,
    Failed { detail: String },
    Abort { detail: String },
}

impl ItemOutcome {
    pub fn failed(detail: impl Into<String>) -> Self {
        ItemOutcome::Failed {
            detail: detail.into(),
        }
    }

    pub fn abort(detail: impl Into<String>) -> Self {
        ItemOutcome::Abort {
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for s in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::CompletedWithErrors,
            JobStatus::Failed,
        ] {
            let parsed: JobStatus = s.as_str().parse().unwrap();
            assert_eq!(parsed, s);
        }
        assert!("cancelled".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::CompletedWithErrors.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn test_event_wire_shape() {
        let event = ProgressEvent {
            job_id: "j-1".into(),
            sequence: 42,
            processed_items: 30,
            failed_items: 2,
            total_items: 50,
            status: JobStatus::Running,
            error_detail: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["job_id"], "j-1");
        assert_eq!(json["sequence"], 42);
        assert_eq!(json["processed_items"], 30);
        assert_eq!(json["failed_items"], 2);
        assert_eq!(json["total_items"], 50);
        assert_eq!(json["status"], "running");
        assert_eq!(json["error_detail"], serde_json::Value::Null);
    }

    #[test]
    fn test_event_parse() {
        let raw = r#"{
            "job_id": "j-2",
            "sequence": 7,
            "processed_items": 5,
            "failed_items": 1,
            "total_items": 10,
            "status": "completed_with_errors",
            "error_detail": "row 6: bad url"
        }"#;
        let event: ProgressEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.status, JobStatus::CompletedWithErrors);
        assert_eq!(event.done_items(), 6);
        assert_eq!(event.error_detail.as_deref(), Some("row 6: bad url"));
    }
}
