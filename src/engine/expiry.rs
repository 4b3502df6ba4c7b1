//! Low-quantity expiry floors.
//!
//! An external service tracks items down to their last case in market. When
//! the remaining stock expires inside the upcoming delivery window, the
//! forecast must order at least the replacement floor or a shelf gap opens.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Duration, NaiveDate};

use crate::domain::{
    AllocationRow, ExpiryFloor, ExpiryReplacement, ForecastItem, SourceTag, StoreItemShare,
};

use super::EngineResult;

/// Boundary to the low-quantity service. The daemon that populates it is not
/// part of this crate.
#[async_trait]
pub trait LowQuantitySource: Send + Sync {
    async fn floors_for_route(&self, route: &str) -> EngineResult<Vec<ExpiryFloor>>;
}

/// Default source when the service is not wired in.
pub struct NoLowQuantity;

#[async_trait]
impl LowQuantitySource for NoLowQuantity {
    async fn floors_for_route(&self, _route: &str) -> EngineResult<Vec<ExpiryFloor>> {
        Ok(Vec::new())
    }
}

const FLOOR_REASON: &str = "low_qty_expiry";

/// Raise matching lines to their floor and inject replacement lines for
/// (store, sap) pairs absent from the forecast. Returns the floor map the
/// whole-case pass must respect.
///
/// Injected lines carry a confidence derived from the store's blended
/// demand share for the SAP: a store that reliably carries the item gets a
/// firmer replacement.
pub fn apply_expiry_floors(
    items: &mut Vec<ForecastItem>,
    floors: &[ExpiryFloor],
    delivery_date: NaiveDate,
    days_until_next: i64,
    allocations: &[AllocationRow],
    shares: &[StoreItemShare],
) -> HashMap<(String, String), u32> {
    let window_end = delivery_date + Duration::days(days_until_next.max(1));
    let mut applied: HashMap<(String, String), u32> = HashMap::new();

    let allocation_by_sap: HashMap<&str, &AllocationRow> = allocations
        .iter()
        .map(|row| (row.sap.as_str(), row))
        .collect();
    let share_by_line: HashMap<(&str, &str), f64> = shares
        .iter()
        .map(|row| {
            (
                (row.store_id.as_str(), row.sap.as_str()),
                row.blended_share,
            )
        })
        .collect();

    for floor in floors {
        if floor.expiry_date > window_end || floor.min_units_required == 0 {
            continue;
        }

        let key = (floor.store_id.clone(), floor.sap.clone());
        if let Some(item) = items
            .iter_mut()
            .find(|item| item.store_id == floor.store_id && item.sap == floor.sap)
        {
            if item.recommended_units < floor.min_units_required {
                item.recommended_units = floor.min_units_required;
                item.p50_units = item.p50_units.max(floor.min_units_required as f64);
                item.p90_units = item.p90_units.max(item.p50_units);
                item.expiry_replacement = Some(ExpiryReplacement {
                    expiry_date: floor.expiry_date,
                    min_units_required: floor.min_units_required,
                    reason: FLOOR_REASON.to_string(),
                });
            }
            applied.insert(key, floor.min_units_required);
            continue;
        }

        // No forecast line for this pair: inject a replacement, named after
        // the allocation cache's primary store when the ids agree.
        let store_name = allocation_by_sap
            .get(floor.sap.as_str())
            .and_then(|row| row.primary_store_id.as_deref())
            .filter(|primary| *primary == floor.store_id)
            .map(|primary| format!("Store {primary}"))
            .unwrap_or_else(|| format!("Store {}", floor.store_id));
        let blended_share = share_by_line
            .get(&(floor.store_id.as_str(), floor.sap.as_str()))
            .copied()
            .unwrap_or(0.0);
        let confidence = (0.4 + 0.3 * blended_share.clamp(0.0, 1.0)).min(0.7);

        items.push(ForecastItem {
            store_id: floor.store_id.clone(),
            store_name,
            sap: floor.sap.clone(),
            recommended_units: floor.min_units_required,
            recommended_cases: None,
            p10_units: 0.0,
            p50_units: floor.min_units_required as f64,
            p90_units: floor.min_units_required as f64,
            promo_active: false,
            promo_lift_pct: None,
            is_first_weekend: None,
            confidence,
            source: SourceTag::ExpiryReplacement,
            prior_order_context: None,
            last_order_quantity: None,
            expiry_replacement: Some(ExpiryReplacement {
                expiry_date: floor.expiry_date,
                min_units_required: floor.min_units_required,
                reason: FLOOR_REASON.to_string(),
            }),
            whole_case_adjustment: None,
            extras: serde_json::Map::new(),
        });
        applied.insert(key, floor.min_units_required);
    }

    applied
}
