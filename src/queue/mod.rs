//! Asynchronous export/purge job queue with lease-based concurrency control.
//!
//! Jobs live in the document store; claims, heartbeats, and lock handoffs
//! all flow through single-document transactions. Workers are crash-safe:
//! stale processing jobs are recovered on every poll tick and purge progress
//! is checkpointed per delivery.

mod archive;
mod blob;
mod export;
mod lock;
mod purge;
mod retry;
mod submit;
mod types;
mod zipfile;

use thiserror::Error;

pub use archive::{
    active_collection, anchor_from_detail, archived_collection, blob_prefix,
    collect_deliveries_in_range, ArchiveSource, DeliveryEntry, FsArchiveSource,
};
pub use blob::{BlobStore, FsBlobStore};
pub use export::{ExportWorker, WorkerFailure};
pub use lock::{clear_route_lock, is_route_locked, upsert_route_lock};
pub use purge::{ArtifactSweepStats, PurgeWorker, RoutePurgeOutcome};
pub use retry::{lock_ttl, retry_delay, retry_delay_jittered, stale_threshold};
pub use submit::{
    ExportSubmission, SubmitError, SubmitOutcome, MAX_RANGE_DAYS, MAX_REQUESTS_PER_DAY,
    MAX_ROUTE_ACTIVE_QUEUE_DEPTH,
};
pub use types::{
    ExportFormat, ExportJob, JobArtifact, JobResultSummary, JobStatus, PurgeEvent, RouteLock,
    EXPORT_COLLECTION, EXPORT_LOCK_COLLECTION, PURGE_EVENT_COLLECTION,
};
pub use zipfile::ZipWriter;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Storage(#[from] crate::domain::CoreError),
}
