//! Forecast cache: TTL'd payload storage with cross-cycle staleness rules.

mod transfers;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::docstore::{decode, DocumentStore};
use crate::domain::{ForecastPayload, Result};
use crate::storage::OrderStore;

pub use transfers::{
    auto_slow_mover_allowlist, PoolingPolicy, RouteGroup, TransferPlanner, TransferSuggestion,
};

pub const STALE_REASON_ORDER_FINALIZED: &str = "order_finalized_after_forecast";

/// Consumer-facing lookup result. The cache never silently serves a stale
/// payload; staleness travels alongside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastLookup {
    pub forecast_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forecast: Option<ForecastPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_stale: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stale_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ForecastLookup {
    fn unavailable(reason: &str) -> Self {
        Self {
            forecast_available: false,
            forecast: None,
            is_stale: None,
            stale_reason: None,
            reason: Some(reason.to_string()),
        }
    }
}

pub struct ForecastCache {
    docs: Arc<dyn DocumentStore>,
    orders: Arc<dyn OrderStore>,
    clock: Arc<dyn Clock>,
    /// When set, every cached payload is also archived as JSON on disk.
    snapshot_dir: Option<PathBuf>,
}

impl ForecastCache {
    pub fn new(
        docs: Arc<dyn DocumentStore>,
        orders: Arc<dyn OrderStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            docs,
            orders,
            clock,
            snapshot_dir: None,
        }
    }

    pub fn with_snapshot_dir(mut self, dir: PathBuf) -> Self {
        self.snapshot_dir = Some(dir);
        self
    }

    fn collection(route: &str) -> String {
        format!("forecasts/{route}/cached")
    }

    /// Write a payload, deleting any cached forecasts for the same
    /// (delivery_date, schedule) first so duplicates never pile up.
    pub async fn store_payload(&self, payload: &ForecastPayload) -> Result<()> {
        let collection = Self::collection(&payload.route_number);
        let mut deleted = 0usize;
        for doc in self.docs.list(&collection).await? {
            if let Ok(existing) = decode::<ForecastPayload>(&collection, &doc) {
                if existing.delivery_date == payload.delivery_date
                    && existing.schedule_key == payload.schedule_key
                {
                    self.docs.delete(&collection, &doc.id).await?;
                    deleted += 1;
                }
            }
        }
        if deleted > 0 {
            debug!(
                route = %payload.route_number,
                delivery = %payload.delivery_date,
                schedule = %payload.schedule_key,
                deleted,
                "replaced existing cached forecasts"
            );
        }

        self.docs
            .set(
                &collection,
                &payload.forecast_id,
                serde_json::to_value(payload)?,
            )
            .await?;

        if let Some(dir) = &self.snapshot_dir {
            if let Err(error) = self.archive_to_disk(dir.clone(), payload) {
                warn!(%error, "forecast snapshot archive failed");
            }
        }

        info!(
            route = %payload.route_number,
            forecast_id = %payload.forecast_id,
            items = payload.items.len(),
            "forecast cached"
        );
        Ok(())
    }

    fn archive_to_disk(&self, dir: PathBuf, payload: &ForecastPayload) -> std::io::Result<()> {
        let route_dir = dir.join(&payload.route_number);
        std::fs::create_dir_all(&route_dir)?;
        let path = route_dir.join(format!(
            "{}_{}_{}.json",
            payload.delivery_date, payload.schedule_key, payload.forecast_id
        ));
        std::fs::write(path, serde_json::to_vec_pretty(payload)?)
    }

    /// True when a non-expired payload exists for the cycle; the orchestrator
    /// uses this to skip regeneration.
    pub async fn has_fresh_payload(
        &self,
        route: &str,
        delivery_date: NaiveDate,
        schedule_key: &str,
    ) -> Result<bool> {
        let now = self.clock.now_utc();
        let collection = Self::collection(route);
        for doc in self.docs.list(&collection).await? {
            if let Ok(payload) = decode::<ForecastPayload>(&collection, &doc) {
                if payload.delivery_date == delivery_date
                    && payload.schedule_key == schedule_key
                    && !payload.is_expired(now)
                {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Fetch the newest matching payload with the staleness verdict.
    ///
    /// The staleness check deliberately crosses schedules: finalizing a
    /// Monday order invalidates the cached Thursday forecast because the
    /// Thursday window now overlaps committed demand.
    pub async fn lookup(
        &self,
        route: &str,
        delivery_date: NaiveDate,
        schedule_key: &str,
    ) -> Result<ForecastLookup> {
        let now = self.clock.now_utc();
        let collection = Self::collection(route);
        let mut candidates: Vec<ForecastPayload> = Vec::new();
        let mut fallback: Vec<ForecastPayload> = Vec::new();
        for doc in self.docs.list(&collection).await? {
            if let Ok(payload) = decode::<ForecastPayload>(&collection, &doc) {
                if payload.is_expired(now) {
                    continue;
                }
                if payload.schedule_key != schedule_key {
                    continue;
                }
                if payload.delivery_date == delivery_date {
                    candidates.push(payload);
                } else {
                    fallback.push(payload);
                }
            }
        }
        if candidates.is_empty() {
            candidates = fallback;
        }
        candidates.sort_by_key(|p| p.generated_at);
        let Some(payload) = candidates.pop() else {
            return Ok(ForecastLookup::unavailable("no_data"));
        };

        let last_finalized = self.orders.last_finalized_at(route, None).await?;
        let is_stale = matches!(last_finalized, Some(finalized) if finalized > payload.generated_at);

        Ok(ForecastLookup {
            forecast_available: true,
            forecast: Some(payload),
            is_stale: Some(is_stale),
            stale_reason: is_stale.then(|| STALE_REASON_ORDER_FINALIZED.to_string()),
            reason: None,
        })
    }
}
