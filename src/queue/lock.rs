//! Route lock management.
//!
//! The lock document is the only cross-worker exclusion primitive: acquire
//! before the transactional claim, re-extend on every heartbeat, release
//! best-effort on completion. Expired locks are deleted on observation.

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::warn;

use crate::docstore::{decode, DocumentStore, TxnOutcome};
use crate::domain::Result;

use super::types::{RouteLock, EXPORT_LOCK_COLLECTION};

/// Create or refresh the lock for (route, export) with the given TTL.
pub async fn upsert_route_lock(
    docs: &dyn DocumentStore,
    route: &str,
    export_id: &str,
    worker_id: &str,
    now: DateTime<Utc>,
    ttl: std::time::Duration,
) -> Result<()> {
    let locked_until = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
    docs.merge(
        EXPORT_LOCK_COLLECTION,
        route,
        json!({
            "route_number": route,
            "export_id": export_id,
            "locked_by": worker_id,
            "locked_at": now,
            "locked_until": locked_until,
        }),
    )
    .await
}

/// Delete the lock if it still belongs to this export. Failure is logged,
/// not propagated; the TTL bounds any leak.
pub async fn clear_route_lock(docs: &dyn DocumentStore, route: &str, export_id: &str) {
    let export_id = export_id.to_string();
    let result = docs
        .modify(EXPORT_LOCK_COLLECTION, route, &move |current| {
            let Some(value) = current else {
                return TxnOutcome::Abort;
            };
            let owner = value["export_id"].as_str().unwrap_or_default();
            if !owner.is_empty() && owner != export_id {
                return TxnOutcome::Abort;
            }
            TxnOutcome::Delete
        })
        .await;
    if let Err(error) = result {
        warn!(route, %error, "failed clearing route lock");
    }
}

/// Whether the route currently holds a live lock. Expired locks are removed
/// on observation and reported as unlocked.
pub async fn is_route_locked(
    docs: &dyn DocumentStore,
    route: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let Some(doc) = docs.get(EXPORT_LOCK_COLLECTION, route).await? else {
        return Ok(false);
    };
    let lock = match decode::<RouteLock>(EXPORT_LOCK_COLLECTION, &doc) {
        Ok(lock) => lock,
        Err(_) => return Ok(false),
    };
    if lock.is_expired(now) {
        docs.delete(EXPORT_LOCK_COLLECTION, route).await?;
        return Ok(false);
    }
    Ok(true)
}
