//! Export job submission: validation, dedup, quotas, and cancellation.

use std::sync::Arc;

use chrono::NaiveDate;
use serde_json::json;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::clock::Clock;
use crate::docstore::{decode, DocumentStore, TxnOutcome};
use crate::domain::CoreError;
use crate::storage::OrderStore;

use super::types::{
    ExportFormat, ExportJob, JobArtifact, JobResultSummary, JobStatus, EXPORT_COLLECTION,
};

pub const MAX_RANGE_DAYS: i64 = 31;
pub const MAX_REQUESTS_PER_DAY: usize = 3;
pub const MAX_ROUTE_ACTIVE_QUEUE_DEPTH: usize = 3;

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("EXPORT_ROUTE_INVALID")]
    InvalidRoute,

    #[error("INVALID_DATE_RANGE")]
    InvalidDateRange,

    #[error("EXPORT_RANGE_EXCEEDS_MAX_31_DAYS")]
    RangeExceedsMax,

    #[error("DATE_BEFORE_ROUTE_START")]
    DateBeforeRouteStart,

    #[error("EXPORT_DAILY_LIMIT_REACHED")]
    DailyLimitReached,

    #[error("ROUTE_EXPORT_QUEUE_FULL")]
    QueueFull,

    #[error("EXPORT_NOT_FOUND")]
    NotFound,

    #[error("EXPORT_CANCEL_ONLY_QUEUED")]
    CancelOnlyQueued,

    #[error(transparent)]
    Storage(#[from] CoreError),
}

/// Submission outcome; `reused` marks a dedup hit on an active job.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub job: ExportJob,
    pub reused: bool,
    pub queue_position: Option<usize>,
}

pub struct ExportSubmission {
    docs: Arc<dyn DocumentStore>,
    orders: Arc<dyn OrderStore>,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
}

impl ExportSubmission {
    pub fn new(
        docs: Arc<dyn DocumentStore>,
        orders: Arc<dyn OrderStore>,
        clock: Arc<dyn Clock>,
        max_attempts: u32,
    ) -> Self {
        Self {
            docs,
            orders,
            clock,
            max_attempts,
        }
    }

    async fn route_jobs(&self, route: &str) -> Result<Vec<ExportJob>, CoreError> {
        let mut jobs = Vec::new();
        for doc in self.docs.list(EXPORT_COLLECTION).await? {
            if doc.data["route_number"].as_str() == Some(route) {
                jobs.push(decode::<ExportJob>(EXPORT_COLLECTION, &doc)?);
            }
        }
        Ok(jobs)
    }

    fn queue_position(jobs: &[ExportJob], export_id: &str) -> Option<usize> {
        let mut queued: Vec<&ExportJob> = jobs
            .iter()
            .filter(|j| j.status == JobStatus::Queued)
            .collect();
        queued.sort_by_key(|j| j.created_at);
        queued
            .iter()
            .position(|j| j.export_id == export_id)
            .map(|idx| idx + 1)
    }

    async fn validate_range(
        &self,
        route: &str,
        from_date: NaiveDate,
        to_date: NaiveDate,
    ) -> Result<(), SubmitError> {
        if from_date > to_date {
            return Err(SubmitError::InvalidDateRange);
        }
        let inclusive_days = (to_date - from_date).num_days() + 1;
        if inclusive_days > MAX_RANGE_DAYS {
            return Err(SubmitError::RangeExceedsMax);
        }
        let today = self.clock.today_utc();
        if from_date > today || to_date > today {
            return Err(SubmitError::InvalidDateRange);
        }
        if let Some(start) = self.orders.route_start_date(route).await? {
            if from_date < start {
                return Err(SubmitError::DateBeforeRouteStart);
            }
        }
        Ok(())
    }

    /// Enqueue an export. An active job covering the same (route, range,
    /// format) is returned with `reused = true`; canceled and failed jobs
    /// never dedup.
    pub async fn enqueue(
        &self,
        route: &str,
        requested_by: &str,
        from_date: NaiveDate,
        to_date: NaiveDate,
        format: ExportFormat,
        settings_snapshot: serde_json::Value,
    ) -> Result<SubmitOutcome, SubmitError> {
        if !crate::domain::Route::is_valid_route_number(route) {
            return Err(SubmitError::InvalidRoute);
        }
        self.validate_range(route, from_date, to_date).await?;

        let now = self.clock.now_utc();
        let jobs = self.route_jobs(route).await?;

        for job in &jobs {
            if !job.status.is_active() {
                continue;
            }
            if job.from_date != from_date || job.to_date != to_date || job.format != format {
                continue;
            }
            if matches!(job.status, JobStatus::Ready | JobStatus::ReadyPartial)
                && job.artifact_expired(now)
            {
                continue;
            }
            let queue_position = Self::queue_position(&jobs, &job.export_id);
            return Ok(SubmitOutcome {
                job: job.clone(),
                reused: true,
                queue_position,
            });
        }

        let day_start = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc())
            .unwrap_or(now);
        let requests_today = jobs
            .iter()
            .filter(|j| j.requested_by == requested_by && j.created_at >= day_start)
            .count();
        if requests_today >= MAX_REQUESTS_PER_DAY {
            return Err(SubmitError::DailyLimitReached);
        }

        let active_depth = jobs
            .iter()
            .filter(|j| matches!(j.status, JobStatus::Queued | JobStatus::Processing))
            .count();
        if active_depth >= MAX_ROUTE_ACTIVE_QUEUE_DEPTH {
            return Err(SubmitError::QueueFull);
        }

        let job = ExportJob {
            export_id: format!("exp_{}", &Uuid::new_v4().simple().to_string()[..24]),
            route_number: route.to_string(),
            requested_by: requested_by.to_string(),
            from_date,
            to_date,
            format,
            status: JobStatus::Queued,
            attempt_count: 0,
            max_attempts: self.max_attempts,
            claimed_by: None,
            started_at: None,
            worker_heartbeat_at: None,
            retry_after_ms: None,
            error_code: None,
            error_message: None,
            artifact: JobArtifact::default(),
            artifact_expires_at_ms: None,
            result: JobResultSummary::default(),
            settings_snapshot,
            ready_at: None,
            created_at: now,
            updated_at: now,
        };
        self.docs
            .set(
                EXPORT_COLLECTION,
                &job.export_id,
                serde_json::to_value(&job).map_err(CoreError::from)?,
            )
            .await?;

        info!(
            route,
            export_id = %job.export_id,
            from = %from_date,
            to = %to_date,
            "export job enqueued"
        );
        let mut all = jobs;
        all.push(job.clone());
        let queue_position = Self::queue_position(&all, &job.export_id);
        Ok(SubmitOutcome {
            job,
            reused: false,
            queue_position,
        })
    }

    /// Cancel a queued job. Processing jobs cannot be canceled externally.
    pub async fn cancel(&self, export_id: &str) -> Result<ExportJob, SubmitError> {
        let now = self.clock.now_utc();
        let committed = self
            .docs
            .modify(EXPORT_COLLECTION, export_id, &|current| {
                let Some(value) = current else {
                    return TxnOutcome::Abort;
                };
                let Ok(job) = serde_json::from_value::<ExportJob>(value.clone()) else {
                    return TxnOutcome::Abort;
                };
                if job.status != JobStatus::Queued {
                    return TxnOutcome::Abort;
                }
                let mut next = value.clone();
                next["status"] = json!("failed");
                next["error_code"] = json!("CANCELED_BY_OWNER");
                next["error_message"] = json!("Export request canceled by route owner");
                next["updated_at"] = json!(now);
                TxnOutcome::Set(next)
            })
            .await?;

        let doc = self
            .docs
            .get(EXPORT_COLLECTION, export_id)
            .await?
            .ok_or(SubmitError::NotFound)?;
        let job = decode::<ExportJob>(EXPORT_COLLECTION, &doc)?;
        if !committed {
            return Err(SubmitError::CancelOnlyQueued);
        }
        info!(export_id, "export job canceled by owner");
        Ok(job)
    }

    /// Jobs for a route, newest first, with queue positions for queued ones.
    pub async fn list(
        &self,
        route: &str,
        limit: usize,
    ) -> Result<Vec<(ExportJob, Option<usize>)>, SubmitError> {
        let jobs = self.route_jobs(route).await?;
        let mut sorted = jobs.clone();
        sorted.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sorted.truncate(limit);
        Ok(sorted
            .into_iter()
            .map(|job| {
                let position = Self::queue_position(&jobs, &job.export_id);
                (job, position)
            })
            .collect())
    }
}
