//! Archived-delivery sources for export and purge.
//!
//! Deliveries are archived in two places: the document store (collection
//! `routes/{route}/archived_deliveries`, with `routes/{route}/active_deliveries`
//! marking deliveries still live) and a filesystem archive tree
//! (`{root}/{route}/{delivery}/delivery.json`). Export bundles read both;
//! purge deletes both.

use std::collections::HashSet;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;

use crate::domain::Result;

pub fn archived_collection(route: &str) -> String {
    format!("routes/{route}/archived_deliveries")
}

pub fn active_collection(route: &str) -> String {
    format!("routes/{route}/active_deliveries")
}

/// Storage prefix for a delivery's archived blobs.
pub fn blob_prefix(route: &str, delivery: &str) -> String {
    format!("routes/{route}/archived_deliveries/{delivery}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryEntry {
    pub delivery_number: String,
    /// Which archive held the delivery (`docstore` or `filesystem`).
    pub source: &'static str,
    pub created_at: Option<NaiveDate>,
}

/// Filesystem half of the archive.
#[async_trait]
pub trait ArchiveSource: Send + Sync {
    async fn delivery_numbers(&self, route: &str) -> Result<Vec<String>>;

    async fn load_detail(&self, route: &str, delivery: &str) -> Result<Option<Value>>;

    /// Retention anchor for the delivery (archive date), when derivable.
    async fn anchor_date(&self, route: &str, delivery: &str) -> Result<Option<NaiveDate>>;

    async fn delete_delivery(&self, route: &str, delivery: &str) -> Result<bool>;
}

/// Parse an ISO date from the archive metadata fields, preferring the
/// archive timestamp over the creation date.
pub fn anchor_from_detail(detail: &Value) -> Option<NaiveDate> {
    for field in ["archived_at", "archivedAt", "created_at", "createdAt"] {
        if let Some(raw) = detail[field].as_str() {
            if raw.len() >= 10 {
                if let Ok(date) = NaiveDate::parse_from_str(&raw[..10], "%Y-%m-%d") {
                    return Some(date);
                }
            }
        }
    }
    None
}

pub struct FsArchiveSource {
    root: PathBuf,
}

impl FsArchiveSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn delivery_dir(&self, route: &str, delivery: &str) -> PathBuf {
        self.root.join(route).join(delivery)
    }
}

#[async_trait]
impl ArchiveSource for FsArchiveSource {
    async fn delivery_numbers(&self, route: &str) -> Result<Vec<String>> {
        let route_dir = self.root.join(route);
        if !tokio::fs::try_exists(&route_dir).await? {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(&route_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                out.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        out.sort();
        Ok(out)
    }

    async fn load_detail(&self, route: &str, delivery: &str) -> Result<Option<Value>> {
        let path = self.delivery_dir(route, delivery).join("delivery.json");
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    async fn anchor_date(&self, route: &str, delivery: &str) -> Result<Option<NaiveDate>> {
        Ok(self
            .load_detail(route, delivery)
            .await?
            .as_ref()
            .and_then(anchor_from_detail))
    }

    async fn delete_delivery(&self, route: &str, delivery: &str) -> Result<bool> {
        let dir = self.delivery_dir(route, delivery);
        if !tokio::fs::try_exists(&dir).await? {
            return Ok(false);
        }
        tokio::fs::remove_dir_all(dir).await?;
        Ok(true)
    }
}

/// Merge docstore and filesystem deliveries for an export range, newest
/// first, skipping anything still active. The docstore copy wins when both
/// archives hold the delivery.
pub async fn collect_deliveries_in_range(
    docs: &dyn crate::docstore::DocumentStore,
    fs: &dyn ArchiveSource,
    route: &str,
    from_date: NaiveDate,
    to_date: NaiveDate,
) -> Result<Vec<DeliveryEntry>> {
    let active: HashSet<String> = docs
        .list(&active_collection(route))
        .await?
        .into_iter()
        .map(|doc| doc.id)
        .collect();

    let mut seen: std::collections::BTreeMap<String, DeliveryEntry> =
        std::collections::BTreeMap::new();

    for doc in docs.list(&archived_collection(route)).await? {
        let Some(created) = anchor_from_detail(&doc.data) else {
            continue;
        };
        if created < from_date || created > to_date {
            continue;
        }
        seen.insert(
            doc.id.clone(),
            DeliveryEntry {
                delivery_number: doc.id,
                source: "docstore",
                created_at: Some(created),
            },
        );
    }

    for delivery in fs.delivery_numbers(route).await? {
        if seen.contains_key(&delivery) || active.contains(&delivery) {
            continue;
        }
        let Some(created) = fs.anchor_date(route, &delivery).await? else {
            continue;
        };
        if created < from_date || created > to_date {
            continue;
        }
        seen.insert(
            delivery.clone(),
            DeliveryEntry {
                delivery_number: delivery,
                source: "filesystem",
                created_at: Some(created),
            },
        );
    }

    let mut out: Vec<DeliveryEntry> = seen.into_values().collect();
    out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn fs_archive_round_trip() {
        let dir = tempdir().unwrap();
        let source = FsArchiveSource::new(dir.path());

        let delivery_dir = dir.path().join("989262").join("D100");
        std::fs::create_dir_all(&delivery_dir).unwrap();
        std::fs::write(
            delivery_dir.join("delivery.json"),
            serde_json::to_vec(&json!({
                "deliveryNumber": "D100",
                "archivedAt": "2025-01-10T08:00:00Z",
            }))
            .unwrap(),
        )
        .unwrap();

        assert_eq!(
            source.delivery_numbers("989262").await.unwrap(),
            vec!["D100".to_string()]
        );
        assert_eq!(
            source.anchor_date("989262", "D100").await.unwrap(),
            Some(NaiveDate::from_ymd_opt(2025, 1, 10).unwrap())
        );
        assert!(source.delete_delivery("989262", "D100").await.unwrap());
        assert!(!source.delete_delivery("989262", "D100").await.unwrap());
    }

    #[test]
    fn anchor_prefers_archive_timestamp() {
        let detail = json!({
            "createdAt": "2025-01-01",
            "archivedAt": "2025-02-01",
        });
        assert_eq!(
            anchor_from_detail(&detail),
            Some(NaiveDate::from_ymd_opt(2025, 2, 1).unwrap())
        );
        assert_eq!(anchor_from_detail(&json!({})), None);
    }
}
