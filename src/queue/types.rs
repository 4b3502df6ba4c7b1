//! Queue document types and the export job state machine.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const EXPORT_COLLECTION: &str = "archive_exports";
pub const EXPORT_LOCK_COLLECTION: &str = "archive_export_locks";
pub const PURGE_EVENT_COLLECTION: &str = "archive_purge_events";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Ready,
    ReadyPartial,
    Failed,
    Expired,
    /// Never written by this crate: cancellation records `failed` with
    /// error code `CANCELED_BY_OWNER`. Accepted when decoding documents
    /// written by earlier queue tooling.
    Canceled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Ready => "ready",
            JobStatus::ReadyPartial => "ready_partial",
            JobStatus::Failed => "failed",
            JobStatus::Expired => "expired",
            JobStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Failed | JobStatus::Expired | JobStatus::Canceled
        )
    }

    /// Statuses that count against dedup and queue-depth checks.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            JobStatus::Queued | JobStatus::Processing | JobStatus::Ready | JobStatus::ReadyPartial
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Zip,
}

impl ExportFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            ExportFormat::Zip => "zip",
        }
    }
}

/// Uploaded artifact metadata on a finished job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobArtifact {
    pub storage_path: Option<String>,
    #[serde(default)]
    pub parts: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub size_bytes: u64,
    pub cleanup_at: Option<DateTime<Utc>>,
}

/// Warning/coverage summary recorded on success.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobResultSummary {
    #[serde(default)]
    pub warning_count: u32,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub total_deliveries_requested: u32,
    #[serde(default)]
    pub total_deliveries_exported: u32,
}

/// One export job document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportJob {
    pub export_id: String,
    pub route_number: String,
    pub requested_by: String,
    pub from_date: NaiveDate,
    pub to_date: NaiveDate,
    pub format: ExportFormat,
    pub status: JobStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub claimed_by: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub worker_heartbeat_at: Option<DateTime<Utc>>,
    pub retry_after_ms: Option<i64>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub artifact: JobArtifact,
    pub artifact_expires_at_ms: Option<i64>,
    #[serde(default)]
    pub result: JobResultSummary,
    /// Requester retention settings captured at submit time.
    #[serde(default)]
    pub settings_snapshot: serde_json::Value,
    pub ready_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExportJob {
    /// Identity used for dedup: one active job per (route, range, format).
    pub fn dedup_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.route_number,
            self.from_date,
            self.to_date,
            self.format.as_str()
        )
    }

    pub fn retry_gate_open(&self, now: DateTime<Utc>) -> bool {
        match self.retry_after_ms {
            Some(after_ms) => now.timestamp_millis() >= after_ms,
            None => true,
        }
    }

    pub fn artifact_expired(&self, now: DateTime<Utc>) -> bool {
        let expires_ms = self
            .artifact_expires_at_ms
            .or_else(|| self.artifact.expires_at.map(|t| t.timestamp_millis()));
        matches!(expires_ms, Some(ms) if ms <= now.timestamp_millis())
    }
}

/// Route-scoped exclusion lock held while a job is processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteLock {
    pub route_number: String,
    pub export_id: String,
    pub locked_by: String,
    pub locked_at: DateTime<Utc>,
    pub locked_until: DateTime<Utc>,
}

impl RouteLock {
    /// A lock past its TTL is treated as released.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.locked_until <= now
    }
}

/// Auditable record of one purge cycle for a route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeEvent {
    pub event_id: String,
    pub route_number: String,
    pub worker_id: String,
    pub retention_days: u32,
    pub cutoff_date: NaiveDate,
    pub status: String,
    pub candidate_count: u32,
    pub success_count: u32,
    pub failure_count: u32,
    pub skipped_checkpoint_count: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}
