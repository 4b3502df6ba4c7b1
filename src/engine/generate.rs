//! Forecast generation: the end-to-end path from order history to a TTL'd
//! payload.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{Duration, NaiveDate};
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::{BandConfig, ForecastConfig};
use crate::domain::{ForecastItem, ForecastPayload, Order, SourceTag, Weekday};
use crate::features::{build_prediction_rows, build_training_frame};
use crate::schedule::{
    days_until_next_delivery, is_first_weekend_of_month, median_delivery_gap,
    schedule_key_for_delivery, summarize_shape,
};
use crate::storage::{CalibrationStore, OrderStore};

use super::bands::{apply_band_adjustments, BandAdjustments};
use super::expiry::{apply_expiry_floors, LowQuantitySource};
use super::mode::{resolve_mode, ForecastMode, ModeDecision, ModeInputs, TrainingScope};
use super::model::{BoostedStumpModel, DemandModel, LinePrediction, TrainedPredictor};
use super::whole_case::{enforce_whole_cases, WholeCasePolicy};
use super::{EngineError, EngineResult};

/// One forecast request. When `schedule_key` is absent it is derived from
/// the route's cycles and the delivery date.
#[derive(Debug, Clone)]
pub struct ForecastRequest {
    pub route_number: String,
    pub delivery_date: NaiveDate,
    pub schedule_key: Option<String>,
    /// (store_id, sap) pairs under promotion in the target window.
    pub active_promos: HashSet<(String, String)>,
}

type ModelFactory = Box<dyn Fn() -> Box<dyn DemandModel> + Send + Sync>;

pub struct ForecastEngine {
    orders: Arc<dyn OrderStore>,
    calibrations: Arc<dyn CalibrationStore>,
    low_quantity: Arc<dyn LowQuantitySource>,
    clock: Arc<dyn Clock>,
    forecast_config: ForecastConfig,
    band_config: BandConfig,
    model_factory: ModelFactory,
}

impl ForecastEngine {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        calibrations: Arc<dyn CalibrationStore>,
        low_quantity: Arc<dyn LowQuantitySource>,
        clock: Arc<dyn Clock>,
        forecast_config: ForecastConfig,
        band_config: BandConfig,
    ) -> Self {
        Self {
            orders,
            calibrations,
            low_quantity,
            clock,
            forecast_config,
            band_config,
            model_factory: Box::new(|| Box::new(BoostedStumpModel::new())),
        }
    }

    /// Swap the regressor; anything satisfying `DemandModel` plugs in.
    pub fn with_model_factory(mut self, factory: ModelFactory) -> Self {
        self.model_factory = factory;
        self
    }

    /// Resolve the operational mode for a request without generating.
    pub async fn resolve_request_mode(
        &self,
        route: &str,
        schedule_key: &str,
        train_orders: &[Order],
    ) -> EngineResult<ModeDecision> {
        let cycles = self.orders.active_cycles(route).await?;
        let schedule_order_count = train_orders
            .iter()
            .filter(|o| o.schedule_key == schedule_key)
            .count() as u32;
        let corrected = self
            .orders
            .corrected_order_count_before(
                route,
                schedule_key,
                self.clock.now_utc(),
                self.forecast_config.since_days,
            )
            .await?;

        let mut per_schedule: HashMap<String, u32> = HashMap::new();
        for order in train_orders {
            *per_schedule.entry(order.schedule_key.clone()).or_insert(0) += 1;
        }

        let inputs = ModeInputs {
            schedule_order_count,
            corrected_order_count: corrected,
            total_order_count: train_orders.len() as u32,
            per_schedule_counts: per_schedule,
            shape: summarize_shape(&cycles, schedule_key),
        };
        Ok(resolve_mode(&inputs, &self.forecast_config))
    }

    /// Generate a forecast payload for the request. The caller owns cache
    /// persistence.
    pub async fn generate(&self, request: &ForecastRequest) -> EngineResult<ForecastPayload> {
        let route = request.route_number.as_str();
        let cycles = self.orders.active_cycles(route).await?;

        let schedule_key = match &request.schedule_key {
            Some(key) => key.clone(),
            None => {
                schedule_key_for_delivery(route, &cycles, request.delivery_date)?.to_string()
            }
        };

        let all_orders = self
            .orders
            .orders_in_window(route, self.forecast_config.since_days, None)
            .await?;
        let train_orders: Vec<Order> = all_orders
            .into_iter()
            .filter(|o| o.delivery_date < request.delivery_date)
            .collect();

        let schedule_orders: Vec<&Order> = train_orders
            .iter()
            .filter(|o| o.schedule_key == schedule_key)
            .collect();
        if schedule_orders.is_empty() {
            return Err(EngineError::InsufficientHistory(format!(
                "no finalized {schedule_key} orders for route {route}"
            )));
        }

        let decision = self
            .resolve_request_mode(route, &schedule_key, &train_orders)
            .await?;
        debug!(
            route,
            schedule = %schedule_key,
            mode = decision.mode.as_str(),
            reason = %decision.reason,
            "resolved forecast mode"
        );

        let delivery_day = Weekday::from_date(request.delivery_date);
        let days_until_next = days_until_next_delivery(&cycles, delivery_day);

        let predictions = match decision.mode {
            ForecastMode::CopyLastOrder => Self::copy_last_order(&schedule_orders),
            _ => {
                self.model_predictions(
                    route,
                    &schedule_key,
                    &decision,
                    &train_orders,
                    request,
                    days_until_next,
                )
                .await?
            }
        };

        let adjustments = BandAdjustments::load(
            self.calibrations.as_ref(),
            &self.band_config,
            route,
            &schedule_key,
        )
        .await?;

        let case_packs = self.orders.case_packs(route).await?;
        let mut items = self.build_items(predictions, &adjustments, &case_packs, request);

        let allocations = self.orders.item_allocation_cache(route).await?;
        let shares = self
            .orders
            .store_item_shares(route, Some(&schedule_key))
            .await?;
        let floors = self.low_quantity.floors_for_route(route).await?;
        let floor_map = apply_expiry_floors(
            &mut items,
            &floors,
            request.delivery_date,
            days_until_next,
            &allocations,
            &shares,
        );

        let policy = WholeCasePolicy {
            round_up_fraction: self.forecast_config.whole_case_round_up_fraction,
        };
        // Enforcement sees every line, zeros included, so an unsatisfiable
        // floored SAP fails generation instead of being filtered away.
        enforce_whole_cases(&mut items, &case_packs, &floor_map, &policy)?;

        // Compliant zero lines are dropped from the emitted payload.
        items.retain(|item| item.recommended_units > 0 || item.expiry_replacement.is_some());

        let generated_at = self.clock.now_utc();
        let payload = ForecastPayload {
            forecast_id: format!("fc_{}", Uuid::new_v4().simple()),
            route_number: route.to_string(),
            delivery_date: request.delivery_date,
            schedule_key,
            generated_at,
            expires_at: generated_at
                + Duration::days(self.forecast_config.cache_ttl_days as i64),
            items,
        };

        info!(
            route,
            forecast_id = %payload.forecast_id,
            delivery = %payload.delivery_date,
            schedule = %payload.schedule_key,
            items = payload.items.len(),
            mode = decision.mode.as_str(),
            "forecast generated"
        );
        Ok(payload)
    }

    /// Cold-start branch: clone the most recent same-schedule order.
    fn copy_last_order(schedule_orders: &[&Order]) -> Vec<LinePrediction> {
        let last = schedule_orders
            .iter()
            .max_by_key(|o| o.delivery_date)
            .expect("non-empty schedule orders");

        let mut store_names: HashMap<String, String> = HashMap::new();
        for store in &last.stores {
            store_names.insert(store.store_id.clone(), store.store_name.clone());
        }

        last.line_units()
            .into_iter()
            .map(|((store_id, sap), units)| {
                let quantity = units as f64;
                LinePrediction {
                    store_name: store_names.get(&store_id).cloned().unwrap_or_default(),
                    store_id,
                    sap,
                    p10_units: (quantity * 0.7).round(),
                    p50_units: quantity,
                    p90_units: (quantity * 1.3).round(),
                    confidence: 0.72,
                    source: SourceTag::LastOrderAnchor,
                    is_slow_mover: false,
                    days_since_last_order: 0.0,
                    corr_removal_rate: 0.0,
                    corr_samples: 0.0,
                    last_order_quantity: Some(units),
                }
            })
            .collect()
    }

    async fn model_predictions(
        &self,
        route: &str,
        schedule_key: &str,
        decision: &ModeDecision,
        train_orders: &[Order],
        request: &ForecastRequest,
        days_until_next: i64,
    ) -> EngineResult<Vec<LinePrediction>> {
        let scoped: Vec<Order> = match decision.scope {
            TrainingScope::ScheduleOnly => train_orders
                .iter()
                .filter(|o| o.schedule_key == schedule_key)
                .cloned()
                .collect(),
            TrainingScope::StoreAllCycles => train_orders.to_vec(),
        };

        let corrections = self
            .orders
            .corrections_up_to(route, schedule_key, self.clock.now_utc())
            .await?;

        let training_gap =
            median_delivery_gap(scoped.iter().map(|o| o.delivery_date).collect());
        let frame = build_training_frame(&scoped, &corrections, training_gap);
        if frame.is_empty() {
            return Err(EngineError::InsufficientHistory(format!(
                "feature frame empty for route {route} schedule {schedule_key}"
            )));
        }

        let predictor = TrainedPredictor::fit((self.model_factory)(), &frame)?;
        let branch_source = match decision.mode {
            ForecastMode::StoreCentric => SourceTag::StoreCentric,
            _ => SourceTag::ScheduleAware,
        };

        let rows = build_prediction_rows(
            &scoped,
            &corrections,
            request.delivery_date,
            days_until_next,
            &request.active_promos,
        );
        Ok(predictor.predict_lines(&rows, branch_source))
    }

    fn build_items(
        &self,
        predictions: Vec<LinePrediction>,
        adjustments: &BandAdjustments,
        case_packs: &HashMap<String, u32>,
        request: &ForecastRequest,
    ) -> Vec<ForecastItem> {
        let first_weekend = is_first_weekend_of_month(request.delivery_date);
        predictions
            .into_iter()
            .map(|line| {
                let (p10, p50, p90) = apply_band_adjustments(
                    adjustments,
                    line.source,
                    line.p10_units,
                    line.p50_units,
                    line.p90_units,
                );
                let recommended_units = p50.round().max(0.0) as u32;
                let recommended_cases = case_packs
                    .get(&line.sap)
                    .filter(|pack| **pack > 0)
                    .map(|pack| recommended_units as f64 / *pack as f64);
                let promo_active = request
                    .active_promos
                    .contains(&(line.store_id.clone(), line.sap.clone()));
                ForecastItem {
                    store_id: line.store_id,
                    store_name: line.store_name,
                    sap: line.sap,
                    recommended_units,
                    recommended_cases,
                    p10_units: p10,
                    p50_units: p50,
                    p90_units: p90,
                    promo_active,
                    promo_lift_pct: None,
                    is_first_weekend: Some(first_weekend),
                    confidence: line.confidence,
                    source: line.source,
                    prior_order_context: None,
                    last_order_quantity: line.last_order_quantity,
                    expiry_replacement: None,
                    whole_case_adjustment: None,
                    extras: serde_json::Map::new(),
                }
            })
            .collect()
    }
}
