//! Export worker: claims queued jobs, builds ZIP artifacts from archived
//! deliveries, and maintains heartbeats and route locks while processing.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use serde_json::json;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::config::ExportConfig;
use crate::docstore::{decode, DocumentStore, TxnOutcome};
use crate::domain::Result as CoreResult;

use super::archive::{archived_collection, collect_deliveries_in_range, ArchiveSource};
use super::blob::BlobStore;
use super::lock::{clear_route_lock, upsert_route_lock};
use super::retry::{lock_ttl, retry_delay, stale_threshold};
use super::types::{ExportJob, JobStatus, EXPORT_COLLECTION};
use super::zipfile::ZipWriter;
use super::QueueError;

/// Worker-level failure with a persisted error code.
#[derive(Debug)]
pub struct WorkerFailure {
    pub code: &'static str,
    pub message: String,
    pub retryable: bool,
}

impl WorkerFailure {
    fn fatal(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: false,
        }
    }

    fn retryable(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: true,
        }
    }
}

struct ArtifactResult {
    status: JobStatus,
    blob_path: String,
    parts: Vec<String>,
    size_bytes: u64,
    warnings: Vec<String>,
    requested: u32,
    exported: u32,
}

pub struct ExportWorker {
    docs: Arc<dyn DocumentStore>,
    fs_archive: Arc<dyn ArchiveSource>,
    blobs: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
    config: ExportConfig,
    worker_id: String,
}

impl ExportWorker {
    pub fn new(
        docs: Arc<dyn DocumentStore>,
        fs_archive: Arc<dyn ArchiveSource>,
        blobs: Arc<dyn BlobStore>,
        clock: Arc<dyn Clock>,
        config: ExportConfig,
        worker_id: String,
    ) -> Self {
        Self {
            docs,
            fs_archive,
            blobs,
            clock,
            config,
            worker_id,
        }
    }

    fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.config.worker_timeout_seconds)
    }

    /// Poll loop: recover stale jobs, claim one, process it. The queue's
    /// change stream wakes the worker early when a job document lands;
    /// delivery is at-least-once, so a missed event only costs one poll
    /// interval. Exits when the shutdown signal flips, finishing the
    /// in-flight job first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), QueueError> {
        info!(worker = %self.worker_id, poll = self.config.poll_seconds, "export worker started");
        let mut changes = self.docs.watch(EXPORT_COLLECTION);
        loop {
            if *shutdown.borrow() {
                info!(worker = %self.worker_id, "export worker stopping");
                return Ok(());
            }

            if let Err(error) = self.tick().await {
                error!(worker = %self.worker_id, %error, "export worker tick failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(self.config.poll_seconds)) => {}
                event = changes.recv() => {
                    if event.is_err() {
                        // Lagged or closed: resubscribe and fall back to polling.
                        changes = self.docs.watch(EXPORT_COLLECTION);
                    }
                }
                _ = shutdown.changed() => {}
            }
        }
    }

    /// One poll cycle; exposed for `--once` runs and tests.
    pub async fn tick(&self) -> Result<bool, QueueError> {
        self.recover_stale_jobs().await?;
        match self.claim_one().await? {
            Some(job) => {
                self.process(job).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_jobs_with_status(&self, status: JobStatus) -> CoreResult<Vec<ExportJob>> {
        let mut out = Vec::new();
        for doc in self.docs.list(EXPORT_COLLECTION).await? {
            if let Ok(job) = decode::<ExportJob>(EXPORT_COLLECTION, &doc) {
                if job.status == status {
                    out.push(job);
                }
            }
        }
        Ok(out)
    }

    /// Requeue processing jobs whose heartbeat or start time is too old,
    /// releasing their route locks.
    pub async fn recover_stale_jobs(&self) -> Result<(), QueueError> {
        let now = self.clock.now_utc();
        let stale_after = stale_threshold(self.worker_timeout());
        let timeout = self.worker_timeout();

        for job in self.list_jobs_with_status(JobStatus::Processing).await? {
            let started = job.started_at.unwrap_or(now);
            let heartbeat = job.worker_heartbeat_at.unwrap_or(started);

            let heartbeat_age = (now - heartbeat).to_std().unwrap_or_default();
            let run_age = (now - started).to_std().unwrap_or_default();
            let timed_out = run_age > timeout;
            let is_stale = heartbeat_age > stale_after;
            if !timed_out && !is_stale {
                continue;
            }

            let (code, message) = if timed_out {
                ("WORKER_TIMEOUT", "Processing job timed out")
            } else {
                ("STALE_PROCESSING_JOB", "Processing job became stale")
            };
            warn!(
                export_id = %job.export_id,
                route = %job.route_number,
                code,
                "recovering stale processing job"
            );
            counter!("export_jobs_recovered_total", 1);
            self.finalize_failure(&job, WorkerFailure::retryable(code, message))
                .await?;
            clear_route_lock(self.docs.as_ref(), &job.route_number, &job.export_id).await;
        }
        Ok(())
    }

    /// Atomic claim: global concurrency cap, FIFO order, retry-after gate,
    /// route exclusion, then a transactional status flip.
    pub async fn claim_one(&self) -> Result<Option<ExportJob>, QueueError> {
        let now = self.clock.now_utc();

        let processing = self.list_jobs_with_status(JobStatus::Processing).await?;
        gauge!("export_jobs_processing", processing.len() as f64);
        if processing.len() >= self.config.worker_concurrency as usize {
            return Ok(None);
        }
        let busy_routes: std::collections::HashSet<String> = processing
            .into_iter()
            .map(|job| job.route_number)
            .collect();

        let mut queued = self.list_jobs_with_status(JobStatus::Queued).await?;
        queued.sort_by_key(|job| job.created_at);

        for job in queued {
            if !job.retry_gate_open(now) {
                continue;
            }
            if busy_routes.contains(&job.route_number) {
                continue;
            }

            let worker_id = self.worker_id.clone();
            let claimed = self
                .docs
                .modify(EXPORT_COLLECTION, &job.export_id, &move |current| {
                    let Some(value) = current else {
                        return TxnOutcome::Abort;
                    };
                    let Ok(snapshot) = serde_json::from_value::<ExportJob>(value.clone())
                    else {
                        return TxnOutcome::Abort;
                    };
                    if snapshot.status != JobStatus::Queued || !snapshot.retry_gate_open(now) {
                        return TxnOutcome::Abort;
                    }
                    let mut next = value.clone();
                    next["status"] = json!("processing");
                    next["claimed_by"] = json!(worker_id);
                    next["started_at"] = json!(now);
                    next["worker_heartbeat_at"] = json!(now);
                    next["updated_at"] = json!(now);
                    TxnOutcome::Set(next)
                })
                .await?;
            if !claimed {
                continue;
            }

            upsert_route_lock(
                self.docs.as_ref(),
                &job.route_number,
                &job.export_id,
                &self.worker_id,
                now,
                lock_ttl(self.worker_timeout()),
            )
            .await?;

            counter!("export_jobs_claimed_total", 1);
            match self.docs.get(EXPORT_COLLECTION, &job.export_id).await? {
                Some(doc) => return Ok(Some(decode::<ExportJob>(EXPORT_COLLECTION, &doc)?)),
                None => continue,
            }
        }
        Ok(None)
    }

    /// Process one claimed job with a heartbeat task alive for its duration.
    pub async fn process(&self, job: ExportJob) -> Result<(), QueueError> {
        info!(
            export_id = %job.export_id,
            route = %job.route_number,
            from = %job.from_date,
            to = %job.to_date,
            "processing export"
        );

        let (done_tx, done_rx) = watch::channel(false);
        let heartbeat = self.spawn_heartbeat(&job, done_rx);

        let outcome = self.build_artifact(&job).await;

        // Stop the heartbeat before finalizing so it cannot resurrect state.
        let _ = done_tx.send(true);
        let _ = heartbeat.await;

        match outcome {
            Ok(result) => {
                self.finalize_success(&job, result).await?;
                counter!("export_jobs_completed_total", 1);
            }
            Err(failure) => {
                counter!("export_jobs_failed_total", 1);
                self.finalize_failure(&job, failure).await?;
            }
        }
        clear_route_lock(self.docs.as_ref(), &job.route_number, &job.export_id).await;
        Ok(())
    }

    fn spawn_heartbeat(
        &self,
        job: &ExportJob,
        mut done: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let docs = self.docs.clone();
        let clock = self.clock.clone();
        let route = job.route_number.clone();
        let export_id = job.export_id.clone();
        let worker_id = self.worker_id.clone();
        let interval = Duration::from_secs(self.config.heartbeat_seconds.max(1));
        let ttl = lock_ttl(self.worker_timeout());

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = done.changed() => {}
                }
                if *done.borrow() {
                    return;
                }
                let now = clock.now_utc();
                let beat = docs
                    .merge(
                        EXPORT_COLLECTION,
                        &export_id,
                        json!({"worker_heartbeat_at": now, "updated_at": now}),
                    )
                    .await;
                if let Err(error) = beat {
                    warn!(%export_id, %error, "heartbeat write failed");
                    continue;
                }
                if let Err(error) =
                    upsert_route_lock(docs.as_ref(), &route, &export_id, &worker_id, now, ttl)
                        .await
                {
                    warn!(%export_id, %error, "lock extension failed");
                }
            }
        })
    }

    async fn build_artifact(&self, job: &ExportJob) -> Result<ArtifactResult, WorkerFailure> {
        let deliveries = collect_deliveries_in_range(
            self.docs.as_ref(),
            self.fs_archive.as_ref(),
            &job.route_number,
            job.from_date,
            job.to_date,
        )
        .await
        .map_err(|e| WorkerFailure::retryable("EXPORT_PROCESSING_ERROR", e.to_string()))?;

        if deliveries.is_empty() {
            return Err(WorkerFailure::fatal(
                "NO_ARCHIVE_DATA_IN_RANGE",
                "No archived delivery data found in requested range",
            ));
        }

        let mut zip = ZipWriter::new();
        let mut warnings: Vec<String> = Vec::new();
        let mut exported = 0u32;
        let mut manifest_deliveries = Vec::new();

        for entry in &deliveries {
            let detail = match entry.source {
                "docstore" => self
                    .docs
                    .get(&archived_collection(&job.route_number), &entry.delivery_number)
                    .await
                    .ok()
                    .flatten()
                    .map(|doc| doc.data),
                _ => self
                    .fs_archive
                    .load_detail(&job.route_number, &entry.delivery_number)
                    .await
                    .ok()
                    .flatten(),
            };

            let Some(detail) = detail else {
                warnings.push(format!(
                    "Delivery {} missing from {} archive source",
                    entry.delivery_number, entry.source
                ));
                continue;
            };

            let path = format!("deliveries/{}/delivery.json", entry.delivery_number);
            let bytes = serde_json::to_vec_pretty(&detail)
                .map_err(|e| WorkerFailure::retryable("EXPORT_PROCESSING_ERROR", e.to_string()))?;
            zip.add_file(&path, &bytes)
                .map_err(|e| WorkerFailure::retryable("EXPORT_PROCESSING_ERROR", e.to_string()))?;

            manifest_deliveries.push(json!({
                "deliveryNumber": entry.delivery_number,
                "source": entry.source,
                "createdAt": entry.created_at,
            }));
            exported += 1;
        }

        if exported == 0 {
            return Err(WorkerFailure::fatal(
                "NO_ARCHIVE_DATA_IN_RANGE",
                "Requested range contained no exportable deliveries",
            ));
        }

        let status = if warnings.is_empty() {
            JobStatus::Ready
        } else {
            JobStatus::ReadyPartial
        };

        let manifest = json!({
            "exportId": job.export_id,
            "routeNumber": job.route_number,
            "dateRange": {"from": job.from_date, "to": job.to_date},
            "status": status.as_str(),
            "totalDeliveriesRequested": deliveries.len(),
            "totalDeliveriesExported": exported,
            "deliveries": manifest_deliveries,
            "warnings": warnings,
            "generatedAt": self.clock.now_utc(),
        });
        let manifest_bytes = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| WorkerFailure::retryable("EXPORT_PROCESSING_ERROR", e.to_string()))?;
        zip.add_file("manifest.json", &manifest_bytes)
            .map_err(|e| WorkerFailure::retryable("EXPORT_PROCESSING_ERROR", e.to_string()))?;

        let zip_name = format!(
            "export_{}_{}_{}_part01.zip",
            job.route_number, job.from_date, job.to_date
        );
        let archive = zip.finish();
        let blob_path = format!(
            "exports/{}/{}/{}",
            job.route_number, job.export_id, zip_name
        );
        self.blobs
            .put(&blob_path, &archive)
            .await
            .map_err(|e| WorkerFailure::retryable("EXPORT_PROCESSING_ERROR", e.to_string()))?;

        Ok(ArtifactResult {
            status,
            blob_path,
            parts: vec![zip_name],
            size_bytes: archive.len() as u64,
            warnings,
            requested: deliveries.len() as u32,
            exported,
        })
    }

    async fn finalize_success(
        &self,
        job: &ExportJob,
        result: ArtifactResult,
    ) -> Result<(), QueueError> {
        let now = self.clock.now_utc();
        let expires_at: DateTime<Utc> =
            now + chrono::Duration::days(self.config.artifact_ttl_days as i64);

        self.docs
            .merge(
                EXPORT_COLLECTION,
                &job.export_id,
                json!({
                    "status": result.status.as_str(),
                    "ready_at": now,
                    "updated_at": now,
                    "worker_heartbeat_at": now,
                    "artifact": {
                        "storage_path": result.blob_path,
                        "parts": result.parts,
                        "expires_at": expires_at,
                        "size_bytes": result.size_bytes,
                        "cleanup_at": null,
                    },
                    "artifact_expires_at_ms": expires_at.timestamp_millis(),
                    "result": {
                        "warning_count": result.warnings.len(),
                        "warnings": result.warnings,
                        "total_deliveries_requested": result.requested,
                        "total_deliveries_exported": result.exported,
                    },
                    "error_code": null,
                    "error_message": null,
                    "retry_after_ms": null,
                }),
            )
            .await?;
        info!(
            export_id = %job.export_id,
            status = result.status.as_str(),
            exported = result.exported,
            "export completed"
        );
        Ok(())
    }

    /// Retryable failures requeue with backoff until attempts are exhausted;
    /// everything else is terminal.
    pub async fn finalize_failure(
        &self,
        job: &ExportJob,
        failure: WorkerFailure,
    ) -> Result<(), QueueError> {
        let now = self.clock.now_utc();
        let attempt_count = job.attempt_count + 1;
        let truncated: String = failure.message.chars().take(1000).collect();

        if failure.retryable && attempt_count < job.max_attempts {
            let delay = retry_delay(attempt_count);
            let retry_after_ms =
                now.timestamp_millis() + delay.as_millis() as i64;
            self.docs
                .merge(
                    EXPORT_COLLECTION,
                    &job.export_id,
                    json!({
                        "status": "queued",
                        "attempt_count": attempt_count,
                        "retry_after_ms": retry_after_ms,
                        "updated_at": now,
                        "worker_heartbeat_at": now,
                        "error_code": failure.code,
                        "error_message": truncated,
                    }),
                )
                .await?;
            warn!(
                export_id = %job.export_id,
                code = failure.code,
                attempt = attempt_count,
                max = job.max_attempts,
                retry_in_secs = delay.as_secs(),
                "export requeued after failure"
            );
            return Ok(());
        }

        self.docs
            .merge(
                EXPORT_COLLECTION,
                &job.export_id,
                json!({
                    "status": "failed",
                    "attempt_count": attempt_count,
                    "updated_at": now,
                    "worker_heartbeat_at": now,
                    "error_code": failure.code,
                    "error_message": truncated,
                }),
            )
            .await?;
        error!(
            export_id = %job.export_id,
            code = failure.code,
            "export failed permanently"
        );
        Ok(())
    }
}
