//! Cross-route pooled transfer suggestions.
//!
//! When a route group pools purchasing, a SAP whose demand on one route is
//! below a full case can ride along on another route's case. Suggestions are
//! derived from the cached forecasts of the cycle and gated on user-created
//! transfer history so unobserved route pairs are never invented.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::docstore::{decode, DocumentStore};
use crate::domain::{ForecastPayload, Order, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolingPolicy {
    Disabled,
    EligibleList,
    AutoSlowMovers,
}

/// Pooling contract for one multi-route group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteGroup {
    pub group_id: String,
    pub master_route_number: String,
    pub route_numbers: Vec<String>,
    pub policy: PoolingPolicy,
    /// Explicit allowlist used by the `eligible_list` policy.
    pub pooled_saps: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferSuggestion {
    pub from_route_number: String,
    pub to_route_number: String,
    pub sap: String,
    pub units: u32,
    pub case_pack: u32,
    pub delivery_date: NaiveDate,
    pub schedule_key: String,
    pub forecast_id: String,
}

/// Slow movers by the pooled-purchasing rule: ordered in at most 35% of the
/// window's orders and averaging at most one case when ordered.
pub fn auto_slow_mover_allowlist(
    orders: &[Order],
    case_packs: &HashMap<String, u32>,
) -> HashSet<String> {
    const MAX_ORDER_RATE: f64 = 0.35;
    const MAX_AVG_CASES: f64 = 1.0;

    let total_orders = orders.len();
    if total_orders == 0 {
        return HashSet::new();
    }

    let mut order_count: HashMap<String, u32> = HashMap::new();
    let mut unit_sum: HashMap<String, f64> = HashMap::new();
    for order in orders {
        let mut seen: HashSet<&str> = HashSet::new();
        for store in &order.stores {
            for item in &store.items {
                if item.units == 0 {
                    continue;
                }
                *unit_sum.entry(item.sap.clone()).or_insert(0.0) += item.units as f64;
                if seen.insert(item.sap.as_str()) {
                    *order_count.entry(item.sap.clone()).or_insert(0) += 1;
                }
            }
        }
    }

    order_count
        .into_iter()
        .filter_map(|(sap, count)| {
            let case_pack = *case_packs.get(&sap)? as f64;
            if case_pack <= 0.0 {
                return None;
            }
            let rate = count as f64 / total_orders as f64;
            let avg_units = unit_sum.get(&sap).copied().unwrap_or(0.0) / count.max(1) as f64;
            let avg_cases = avg_units / case_pack;
            (rate <= MAX_ORDER_RATE && avg_cases <= MAX_AVG_CASES).then_some(sap)
        })
        .collect()
}

pub struct TransferPlanner {
    docs: std::sync::Arc<dyn DocumentStore>,
}

impl TransferPlanner {
    pub fn new(docs: std::sync::Arc<dyn DocumentStore>) -> Self {
        Self { docs }
    }

    fn transfers_collection(group_id: &str) -> String {
        format!("routeTransfers/{group_id}/transfers")
    }

    fn source_marker(delivery_date: NaiveDate, schedule_key: &str) -> String {
        format!("forecast:{delivery_date}:{schedule_key}")
    }

    fn suggestion_key(marker: &str, from: &str, to: &str, sap: &str) -> String {
        format!("{marker}:{from}:{to}:{sap}").replace('/', "_")
    }

    /// User-created (from, to, sap) patterns; forecast-generated suggestions
    /// do not count as history.
    async fn user_patterns(
        &self,
        group_id: &str,
    ) -> Result<HashSet<(String, String, String)>> {
        let collection = Self::transfers_collection(group_id);
        let mut patterns = HashSet::new();
        for doc in self.docs.list(&collection).await? {
            let data = &doc.data;
            let reason = data["reason"].as_str().unwrap_or_default();
            if reason != "manual" && reason != "pooled_order" {
                continue;
            }
            let source = data["sourceOrderId"].as_str().unwrap_or_default();
            if source.starts_with("forecast:") {
                continue;
            }
            let from = data["fromRouteNumber"].as_str().unwrap_or_default();
            let to = data["toRouteNumber"].as_str().unwrap_or_default();
            let sap = data["sap"].as_str().unwrap_or_default();
            let units = data["units"].as_u64().unwrap_or(0);
            if from.is_empty() || to.is_empty() || sap.is_empty() || from == to || units == 0 {
                continue;
            }
            patterns.insert((from.to_string(), to.to_string(), sap.to_string()));
        }
        Ok(patterns)
    }

    /// Remove (or cancel, when partially reserved) forecast suggestions for
    /// the cycle that are no longer expected. Returns (removed, canceled).
    async fn cleanup_stale(
        &self,
        group_id: &str,
        marker: &str,
        expected_keys: &HashSet<String>,
    ) -> Result<(usize, usize)> {
        let collection = Self::transfers_collection(group_id);
        let mut removed = 0usize;
        let mut canceled = 0usize;
        for doc in self.docs.list(&collection).await? {
            if doc.data["sourceOrderId"].as_str() != Some(marker) {
                continue;
            }
            if doc.data["reason"].as_str() != Some("rebalance") {
                continue;
            }
            if expected_keys.contains(&doc.id) {
                continue;
            }
            let reserved_total: u64 = doc.data["reservedBy"]
                .as_object()
                .map(|reservations| {
                    reservations
                        .values()
                        .filter_map(|v| v.as_u64())
                        .sum::<u64>()
                })
                .unwrap_or(0);
            if reserved_total > 0 {
                self.docs
                    .merge(&collection, &doc.id, json!({"status": "canceled"}))
                    .await?;
                canceled += 1;
            } else {
                self.docs.delete(&collection, &doc.id).await?;
                removed += 1;
            }
        }
        Ok((removed, canceled))
    }

    /// Plan and persist suggestions for one forecast cycle.
    ///
    /// `cycle_forecasts` maps route number to that route's cached payload
    /// for the same (delivery_date, schedule); `allowed_saps` is the policy
    /// allowlist (None means every SAP qualifies).
    pub async fn plan_for_cycle(
        &self,
        group: &RouteGroup,
        forecast: &ForecastPayload,
        cycle_forecasts: &HashMap<String, ForecastPayload>,
        allowed_saps: Option<&HashSet<String>>,
    ) -> Result<Vec<TransferSuggestion>> {
        let marker = Self::source_marker(forecast.delivery_date, &forecast.schedule_key);

        if group.route_numbers.len() < 2 || group.policy == PoolingPolicy::Disabled {
            self.cleanup_stale(&group.group_id, &marker, &HashSet::new())
                .await?;
            return Ok(Vec::new());
        }

        let patterns = self.user_patterns(&group.group_id).await?;
        if patterns.is_empty() {
            let (removed, canceled) = self
                .cleanup_stale(&group.group_id, &marker, &HashSet::new())
                .await?;
            debug!(
                group = %group.group_id,
                removed,
                canceled,
                "no user transfer history; suggestions skipped"
            );
            return Ok(Vec::new());
        }

        // Aggregate demand per SAP per route, inferring case packs from the
        // cached items.
        let mut by_sap: BTreeMap<String, BTreeMap<String, (u32, u32)>> = BTreeMap::new();
        for (route, payload) in cycle_forecasts {
            for item in &payload.items {
                if item.recommended_units == 0 {
                    continue;
                }
                let case_pack = item
                    .recommended_cases
                    .filter(|cases| *cases > 0.0)
                    .map(|cases| (item.recommended_units as f64 / cases).round() as u32)
                    .unwrap_or(0);
                let entry = by_sap
                    .entry(item.sap.clone())
                    .or_default()
                    .entry(route.clone())
                    .or_insert((0, 0));
                entry.0 += item.recommended_units;
                entry.1 = entry.1.max(case_pack);
            }
        }

        let mut suggestions = Vec::new();
        let mut expected_keys = HashSet::new();

        for (sap, demand) in &by_sap {
            if let Some(allowed) = allowed_saps {
                if !allowed.contains(sap) {
                    continue;
                }
            }

            let demand_routes: Vec<&String> =
                demand.iter().filter(|(_, d)| d.0 > 0).map(|(r, _)| r).collect();
            if demand_routes.len() < 2 {
                continue;
            }
            let case_pack = demand.values().map(|d| d.1).max().unwrap_or(0);
            if case_pack == 0 {
                continue;
            }
            let small_routes: Vec<&String> = demand_routes
                .iter()
                .copied()
                .filter(|r| demand[*r].0 < case_pack)
                .collect();
            if small_routes.is_empty() {
                continue;
            }

            // Purchase route: the master when it has demand, else the route
            // with the highest demand (ties by route number).
            let purchase_route = if demand_routes
                .iter()
                .any(|r| **r == group.master_route_number)
            {
                group.master_route_number.clone()
            } else {
                demand_routes
                    .iter()
                    .max_by(|a, b| {
                        demand[**a]
                            .0
                            .cmp(&demand[**b].0)
                            .then_with(|| a.cmp(b))
                    })
                    .map(|r| (*r).clone())
                    .expect("non-empty demand routes")
            };

            for to_route in small_routes {
                if *to_route == purchase_route {
                    continue;
                }
                let pattern = (
                    purchase_route.clone(),
                    to_route.clone(),
                    sap.clone(),
                );
                if !patterns.contains(&pattern) {
                    continue;
                }
                let units = demand[to_route].0;
                if units == 0 {
                    continue;
                }

                let key = Self::suggestion_key(&marker, &purchase_route, to_route, sap);
                let suggestion = TransferSuggestion {
                    from_route_number: purchase_route.clone(),
                    to_route_number: to_route.clone(),
                    sap: sap.clone(),
                    units,
                    case_pack,
                    delivery_date: forecast.delivery_date,
                    schedule_key: forecast.schedule_key.clone(),
                    forecast_id: forecast.forecast_id.clone(),
                };

                self.docs
                    .merge(
                        &Self::transfers_collection(&group.group_id),
                        &key,
                        json!({
                            "routeGroupId": group.group_id,
                            "purchaseRouteNumber": suggestion.from_route_number,
                            "fromRouteNumber": suggestion.from_route_number,
                            "toRouteNumber": suggestion.to_route_number,
                            "sap": suggestion.sap,
                            "units": suggestion.units,
                            "casePack": suggestion.case_pack,
                            "transferDate": suggestion.delivery_date,
                            "deliveryDate": suggestion.delivery_date,
                            "scheduleKey": suggestion.schedule_key,
                            "status": "planned",
                            "reason": "rebalance",
                            "sourceOrderId": marker,
                            "forecastId": suggestion.forecast_id,
                        }),
                    )
                    .await?;
                expected_keys.insert(key);
                suggestions.push(suggestion);
            }
        }

        let (removed, canceled) = self
            .cleanup_stale(&group.group_id, &marker, &expected_keys)
            .await?;
        if !suggestions.is_empty() || removed > 0 || canceled > 0 {
            info!(
                group = %group.group_id,
                delivery = %forecast.delivery_date,
                schedule = %forecast.schedule_key,
                suggestions = suggestions.len(),
                removed,
                canceled,
                "transfer suggestions refreshed"
            );
        }
        Ok(suggestions)
    }

    /// Decode the persisted suggestion documents for a cycle (test + portal
    /// read path).
    pub async fn suggestions_for_cycle(
        &self,
        group_id: &str,
        delivery_date: NaiveDate,
        schedule_key: &str,
    ) -> Result<Vec<TransferSuggestion>> {
        let marker = Self::source_marker(delivery_date, schedule_key);
        let collection = Self::transfers_collection(group_id);
        let mut out = Vec::new();
        for doc in self.docs.list(&collection).await? {
            if doc.data["sourceOrderId"].as_str() != Some(marker.as_str()) {
                continue;
            }
            if doc.data["status"].as_str() == Some("canceled") {
                continue;
            }
            #[derive(Deserialize)]
            struct Raw {
                #[serde(rename = "fromRouteNumber")]
                from_route_number: String,
                #[serde(rename = "toRouteNumber")]
                to_route_number: String,
                sap: String,
                units: u32,
                #[serde(rename = "casePack")]
                case_pack: u32,
                #[serde(rename = "deliveryDate")]
                delivery_date: NaiveDate,
                #[serde(rename = "scheduleKey")]
                schedule_key: String,
                #[serde(rename = "forecastId")]
                forecast_id: String,
            }
            if let Ok(raw) = decode::<Raw>(&collection, &doc) {
                out.push(TransferSuggestion {
                    from_route_number: raw.from_route_number,
                    to_route_number: raw.to_route_number,
                    sap: raw.sap,
                    units: raw.units,
                    case_pack: raw.case_pack,
                    delivery_date: raw.delivery_date,
                    schedule_key: raw.schedule_key,
                    forecast_id: raw.forecast_id,
                });
            }
        }
        out.sort_by(|a, b| {
            (&a.sap, &a.to_route_number).cmp(&(&b.sap, &b.to_route_number))
        });
        Ok(out)
    }
}
