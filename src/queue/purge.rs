//! Purge worker: artifact expiry sweep plus retention-based deletion of
//! archived deliveries with per-delivery checkpoints.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use metrics::counter;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::PurgeConfig;
use crate::docstore::{decode, DocumentStore};
use crate::domain::{PurgeCheckpoint, PurgeCheckpointStatus};
use crate::storage::OrderStore;

use super::archive::{
    active_collection, anchor_from_detail, archived_collection, blob_prefix, ArchiveSource,
};
use super::blob::BlobStore;
use super::lock::is_route_locked;
use super::types::{ExportJob, JobStatus, PurgeEvent, EXPORT_COLLECTION, PURGE_EVENT_COLLECTION};
use super::QueueError;

const RETENTION_MIN_DAYS: u32 = 30;
const RETENTION_MAX_DAYS: u32 = 120;

#[derive(Debug, Default, Clone, Copy)]
pub struct ArtifactSweepStats {
    pub scanned: usize,
    pub expired: usize,
    pub blobs_deleted: usize,
}

#[derive(Debug, Clone)]
pub struct RoutePurgeOutcome {
    pub route_number: String,
    pub skipped_reason: Option<&'static str>,
    pub success_count: u32,
    pub failure_count: u32,
    pub skipped_checkpoint_count: u32,
}

pub struct PurgeWorker {
    docs: Arc<dyn DocumentStore>,
    orders: Arc<dyn OrderStore>,
    fs_archive: Arc<dyn ArchiveSource>,
    blobs: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
    config: PurgeConfig,
    worker_id: String,
}

impl PurgeWorker {
    pub fn new(
        docs: Arc<dyn DocumentStore>,
        orders: Arc<dyn OrderStore>,
        fs_archive: Arc<dyn ArchiveSource>,
        blobs: Arc<dyn BlobStore>,
        clock: Arc<dyn Clock>,
        config: PurgeConfig,
        worker_id: String,
    ) -> Self {
        Self {
            docs,
            orders,
            fs_archive,
            blobs,
            clock,
            config,
            worker_id,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), QueueError> {
        info!(
            worker = %self.worker_id,
            enabled = self.config.enabled,
            poll = self.config.poll_seconds,
            "purge worker started"
        );
        loop {
            if *shutdown.borrow() {
                info!(worker = %self.worker_id, "purge worker stopping");
                return Ok(());
            }
            if self.config.enabled {
                if let Err(error) = self.cycle().await {
                    error!(worker = %self.worker_id, %error, "purge cycle failed");
                }
            } else {
                debug!("purge disabled; cycle skipped");
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(self.config.poll_seconds)) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// One full cycle: artifact sweep, then per-route purge.
    pub async fn cycle(&self) -> Result<(), QueueError> {
        let sweep = self.cleanup_expired_artifacts().await?;
        info!(
            scanned = sweep.scanned,
            expired = sweep.expired,
            blobs_deleted = sweep.blobs_deleted,
            "artifact cleanup cycle"
        );

        for route in self.orders.synced_routes().await? {
            match self.purge_route(&route).await {
                Ok(outcome) => {
                    if let Some(reason) = outcome.skipped_reason {
                        debug!(route, reason, "purge skipped");
                    } else {
                        info!(
                            route,
                            success = outcome.success_count,
                            failure = outcome.failure_count,
                            skipped_checkpoints = outcome.skipped_checkpoint_count,
                            "route purge complete"
                        );
                    }
                }
                Err(error) => warn!(route, %error, "route purge failed"),
            }
        }
        Ok(())
    }

    /// Delete blobs for ready/expired jobs whose artifact TTL has passed and
    /// mark the job `expired` with a cleanup timestamp.
    pub async fn cleanup_expired_artifacts(&self) -> Result<ArtifactSweepStats, QueueError> {
        let now = self.clock.now_utc();
        let mut stats = ArtifactSweepStats::default();

        for doc in self.docs.list(EXPORT_COLLECTION).await? {
            let Ok(job) = decode::<ExportJob>(EXPORT_COLLECTION, &doc) else {
                continue;
            };
            if !matches!(
                job.status,
                JobStatus::Ready | JobStatus::ReadyPartial | JobStatus::Expired
            ) {
                continue;
            }
            stats.scanned += 1;
            if !job.artifact_expired(now) {
                continue;
            }

            if let Some(path) = &job.artifact.storage_path {
                match self.blobs.delete(path).await {
                    Ok(true) => stats.blobs_deleted += 1,
                    Ok(false) => {}
                    Err(error) => {
                        warn!(export_id = %job.export_id, %error, "artifact blob delete failed")
                    }
                }
                // Multi-part artifacts share the parent prefix.
                if let Some(parent) = path.rsplit_once('/').map(|(parent, _)| parent) {
                    for part in &job.artifact.parts {
                        let part_path = format!("{parent}/{part}");
                        if part_path == *path {
                            continue;
                        }
                        if let Ok(true) = self.blobs.delete(&part_path).await {
                            stats.blobs_deleted += 1;
                        }
                    }
                }
            }

            self.docs
                .merge(
                    EXPORT_COLLECTION,
                    &job.export_id,
                    json!({
                        "status": "expired",
                        "updated_at": now,
                        "artifact": {
                            "storage_path": job.artifact.storage_path,
                            "parts": job.artifact.parts,
                            "expires_at": job.artifact.expires_at,
                            "size_bytes": job.artifact.size_bytes,
                            "cleanup_at": now,
                        },
                    }),
                )
                .await?;
            stats.expired += 1;
            counter!("export_artifacts_expired_total", 1);
        }
        Ok(stats)
    }

    async fn retention_days(&self, route: &str) -> u32 {
        let configured = self
            .docs
            .get("routes", route)
            .await
            .ok()
            .flatten()
            .and_then(|doc| doc.data["archived_retention_days"].as_u64())
            .map(|days| days as u32);
        match configured {
            Some(days) if (RETENTION_MIN_DAYS..=RETENTION_MAX_DAYS).contains(&days) => days,
            _ => self.config.retention_days_default,
        }
    }

    /// Purge one route's archived deliveries past retention, oldest first,
    /// bounded by the per-cycle batch limit. Each delivery is checkpointed
    /// before any deletion so a crash never repeats completed work.
    pub async fn purge_route(&self, route: &str) -> Result<RoutePurgeOutcome, QueueError> {
        let now = self.clock.now_utc();
        if is_route_locked(self.docs.as_ref(), route, now).await? {
            return Ok(RoutePurgeOutcome {
                route_number: route.to_string(),
                skipped_reason: Some("route_locked"),
                success_count: 0,
                failure_count: 0,
                skipped_checkpoint_count: 0,
            });
        }

        let retention_days = self.retention_days(route).await;
        let cutoff: NaiveDate =
            now.date_naive() - chrono::Duration::days(retention_days as i64);

        let active: std::collections::HashSet<String> = self
            .docs
            .list(&active_collection(route))
            .await?
            .into_iter()
            .map(|doc| doc.id)
            .collect();

        // Candidate deliveries from both archive halves, keyed by number.
        let mut candidates: BTreeMap<String, Vec<&'static str>> = BTreeMap::new();
        let mut anchors: BTreeMap<String, NaiveDate> = BTreeMap::new();

        for doc in self.docs.list(&archived_collection(route)).await? {
            if active.contains(&doc.id) {
                continue;
            }
            let Some(anchor) = anchor_from_detail(&doc.data) else {
                continue;
            };
            if anchor > cutoff {
                continue;
            }
            candidates.entry(doc.id.clone()).or_default().push("docstore");
            anchors.insert(doc.id, anchor);
        }

        for delivery in self.fs_archive.delivery_numbers(route).await? {
            if active.contains(&delivery) {
                continue;
            }
            let has_docstore_copy = candidates.contains_key(&delivery);
            let anchor = self.fs_archive.anchor_date(route, &delivery).await?;
            match anchor {
                Some(date) if date <= cutoff || has_docstore_copy => {
                    candidates.entry(delivery.clone()).or_default().push("filesystem");
                    anchors.entry(delivery).or_insert(date);
                }
                _ => {}
            }
        }

        if candidates.is_empty() {
            return Ok(RoutePurgeOutcome {
                route_number: route.to_string(),
                skipped_reason: Some("no_candidates"),
                success_count: 0,
                failure_count: 0,
                skipped_checkpoint_count: 0,
            });
        }

        // Oldest anchors first, capped per cycle.
        let mut ordered: Vec<(String, Vec<&'static str>)> = candidates.into_iter().collect();
        ordered.sort_by_key(|(delivery, _)| {
            anchors
                .get(delivery)
                .copied()
                .unwrap_or(NaiveDate::MAX)
        });
        ordered.truncate(self.config.route_batch_limit as usize);

        let event = PurgeEvent {
            event_id: format!(
                "purge_{route}_{}_{}",
                now.timestamp(),
                &Uuid::new_v4().simple().to_string()[..8]
            ),
            route_number: route.to_string(),
            worker_id: self.worker_id.clone(),
            retention_days,
            cutoff_date: cutoff,
            status: "processing".to_string(),
            candidate_count: ordered.len() as u32,
            success_count: 0,
            failure_count: 0,
            skipped_checkpoint_count: 0,
            started_at: now,
            completed_at: None,
        };
        let event_id = event.event_id.clone();
        self.docs
            .set(
                PURGE_EVENT_COLLECTION,
                &event_id,
                serde_json::to_value(&event).map_err(crate::domain::CoreError::from)?,
            )
            .await?;

        let mut success = 0u32;
        let mut failure = 0u32;
        let mut skipped = 0u32;

        for (delivery, sources) in ordered {
            // Completed checkpoints are never re-processed.
            if let Some(checkpoint) = self.orders.purge_checkpoint_get(route, &delivery).await? {
                if checkpoint.status == PurgeCheckpointStatus::Completed {
                    skipped += 1;
                    continue;
                }
            }

            match self.purge_delivery(route, &delivery, &sources).await {
                Ok(details) => {
                    self.orders
                        .purge_checkpoint_set(&PurgeCheckpoint {
                            route_number: route.to_string(),
                            delivery_number: delivery.clone(),
                            status: PurgeCheckpointStatus::Completed,
                            event_id: event_id.clone(),
                            worker_id: Some(self.worker_id.clone()),
                            details,
                            purged_at: Some(self.clock.now_utc()),
                        })
                        .await?;
                    success += 1;
                    counter!("purge_deliveries_total", 1);
                }
                Err(error) => {
                    let message: String = error.to_string().chars().take(1000).collect();
                    warn!(route, delivery = %delivery, %error, "delivery purge failed");
                    self.orders
                        .purge_checkpoint_set(&PurgeCheckpoint {
                            route_number: route.to_string(),
                            delivery_number: delivery.clone(),
                            status: PurgeCheckpointStatus::Failed,
                            event_id: event_id.clone(),
                            worker_id: Some(self.worker_id.clone()),
                            details: json!({"error": message}),
                            purged_at: None,
                        })
                        .await?;
                    failure += 1;
                }
            }
        }

        self.docs
            .merge(
                PURGE_EVENT_COLLECTION,
                &event_id,
                json!({
                    "status": if failure == 0 { "completed" } else { "completed_with_errors" },
                    "success_count": success,
                    "failure_count": failure,
                    "skipped_checkpoint_count": skipped,
                    "completed_at": self.clock.now_utc(),
                }),
            )
            .await?;

        Ok(RoutePurgeOutcome {
            route_number: route.to_string(),
            skipped_reason: None,
            success_count: success,
            failure_count: failure,
            skipped_checkpoint_count: skipped,
        })
    }

    /// Delete one delivery from every archive source. The checkpoint is only
    /// marked completed by the caller after all sources succeed.
    async fn purge_delivery(
        &self,
        route: &str,
        delivery: &str,
        sources: &[&'static str],
    ) -> Result<serde_json::Value, QueueError> {
        let mut doc_deleted = false;
        if sources.contains(&"docstore") {
            self.docs
                .delete(&archived_collection(route), delivery)
                .await?;
            doc_deleted = true;
        }

        // Blob prefix deletion is idempotent and also clears orphans.
        let blobs_deleted = self.blobs.delete_prefix(&blob_prefix(route, delivery)).await?;

        let mut fs_deleted = false;
        if sources.contains(&"filesystem") {
            fs_deleted = self.fs_archive.delete_delivery(route, delivery).await?;
        }

        Ok(json!({
            "docstore_deleted": doc_deleted,
            "blobs_deleted": blobs_deleted,
            "filesystem_deleted": fs_deleted,
        }))
    }
}
