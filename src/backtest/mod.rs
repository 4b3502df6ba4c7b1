//! Walk-forward backtester.
//!
//! Folds replay the production forecast path: the same mode progression,
//! feature frame, model, and band calibration are applied with a strict
//! temporal cutoff, so fold metrics measure what the live engine would have
//! emitted.

mod metrics;
mod scorecard;
mod snapshot;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::NaiveDate;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{BacktestConfig, BandConfig, ForecastConfig};
use crate::domain::{Order, SourceTag};
use crate::engine::{
    apply_band_adjustments, cold_start_p90_by_sap, resolve_mode, BandAdjustments,
    BoostedStumpModel, ForecastMode, ModeInputs, TrainedPredictor, TrainingScope,
};
use crate::features::build_training_frame;
use crate::schedule::summarize_shape;
use crate::storage::{CalibrationStore, OrderStore};

pub use metrics::{
    compute_fold_metrics, compute_source_breakdown, wape, BandTuple, FoldInputs, FoldMetrics,
    LineKey, LineMeta, SourceBreakdownRow,
};
pub use scorecard::{
    improvement_pct, summarize_scorecard, weighted_mean, CorrectionProxy, Scorecard,
};
pub use snapshot::{refresh_learning_snapshots, SnapshotPaths, SnapshotRefreshOutcome};

#[derive(Debug, Error)]
pub enum BacktestError {
    #[error(transparent)]
    Storage(#[from] crate::domain::CoreError),

    #[error("snapshot io error: {0}")]
    SnapshotIo(#[from] std::io::Error),

    #[error("snapshot serialization error: {0}")]
    SnapshotCsv(#[from] csv::Error),

    #[error("fold engine error: {0}")]
    Engine(String),
}

pub type BacktestResult<T> = std::result::Result<T, BacktestError>;

/// Output of one backtest run.
#[derive(Debug, Default)]
pub struct BacktestRun {
    pub folds: Vec<FoldMetrics>,
    pub sources: Vec<SourceBreakdownRow>,
}

pub struct Backtester {
    orders: Arc<dyn OrderStore>,
    calibrations: Arc<dyn CalibrationStore>,
    clock: Arc<dyn Clock>,
    forecast_config: ForecastConfig,
    band_config: BandConfig,
    backtest_config: BacktestConfig,
}

impl Backtester {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        calibrations: Arc<dyn CalibrationStore>,
        clock: Arc<dyn Clock>,
        forecast_config: ForecastConfig,
        band_config: BandConfig,
        backtest_config: BacktestConfig,
    ) -> Self {
        Self {
            orders,
            calibrations,
            clock,
            forecast_config,
            band_config,
            backtest_config,
        }
    }

    pub async fn run(&self, routes: &[String]) -> BacktestResult<BacktestRun> {
        let mut run = BacktestRun::default();
        for route in routes {
            match self.run_route(route).await {
                Ok((folds, sources)) => {
                    run.folds.extend(folds);
                    run.sources.extend(sources);
                }
                Err(error) => {
                    warn!(route, %error, "backtest failed for route; continuing");
                }
            }
        }
        run.folds.sort_by(|a, b| {
            (&a.route_number, &a.schedule_key, a.target_delivery_date).cmp(&(
                &b.route_number,
                &b.schedule_key,
                b.target_delivery_date,
            ))
        });
        Ok(run)
    }

    async fn run_route(
        &self,
        route: &str,
    ) -> BacktestResult<(Vec<FoldMetrics>, Vec<SourceBreakdownRow>)> {
        let case_packs = self.orders.case_packs(route).await?;
        let orders = self
            .orders
            .orders_in_window(route, self.forecast_config.since_days, None)
            .await?;
        if orders.is_empty() {
            debug!(route, "no orders in lookback window");
            return Ok((Vec::new(), Vec::new()));
        }
        let cycles = self.orders.active_cycles(route).await?;

        let mut schedules: Vec<String> = orders.iter().map(|o| o.schedule_key.clone()).collect();
        schedules.sort();
        schedules.dedup();

        let mut fold_rows = Vec::new();
        let mut source_rows = Vec::new();

        for schedule_key in schedules {
            let adjustments = BandAdjustments::load(
                self.calibrations.as_ref(),
                &self.band_config,
                route,
                &schedule_key,
            )
            .await
            .unwrap_or_default();

            let mut sched_orders: Vec<&Order> = orders
                .iter()
                .filter(|o| o.schedule_key == schedule_key)
                .collect();
            sched_orders.sort_by_key(|o| o.delivery_date);

            let min_train = self.backtest_config.min_train_orders as usize;
            if sched_orders.len() <= min_train {
                debug!(
                    route,
                    schedule = %schedule_key,
                    orders = sched_orders.len(),
                    "insufficient orders for folds"
                );
                continue;
            }

            let mut fold_counter: u32 = 0;
            for i in min_train..sched_orders.len() {
                if self.backtest_config.max_folds > 0
                    && fold_counter >= self.backtest_config.max_folds
                {
                    break;
                }

                let test_order = sched_orders[i];
                let target = test_order.delivery_date;

                let candidate_train: Vec<Order> = orders
                    .iter()
                    .filter(|o| o.delivery_date < target)
                    .cloned()
                    .collect();
                if candidate_train.is_empty() {
                    continue;
                }

                let decision = self
                    .resolve_fold_mode(route, &schedule_key, &cycles, &candidate_train, target)
                    .await?;

                let train_orders: Vec<Order> = match decision.scope {
                    TrainingScope::ScheduleOnly => candidate_train
                        .iter()
                        .filter(|o| o.schedule_key == schedule_key)
                        .cloned()
                        .collect(),
                    TrainingScope::StoreAllCycles => candidate_train.clone(),
                };
                if train_orders.is_empty() {
                    continue;
                }

                let cold_start = cold_start_p90_by_sap(&train_orders, &case_packs);
                let naive = last_value_map(&train_orders);
                let actual = line_map(test_order);

                let (predicted, bands, sources, meta) = match decision.mode {
                    ForecastMode::CopyLastOrder => copy_last_maps(&train_orders),
                    _ => {
                        match self
                            .model_fold_maps(
                                route,
                                &schedule_key,
                                &decision.mode,
                                &train_orders,
                                target,
                                &adjustments,
                            )
                            .await
                        {
                            Ok(maps) => maps,
                            Err(error) => {
                                debug!(route, schedule = %schedule_key, %error, "fold skipped");
                                continue;
                            }
                        }
                    }
                };

                let inputs = FoldInputs {
                    route_number: route,
                    schedule_key: &schedule_key,
                    target_delivery_date: target,
                    fold_index: fold_counter + 1,
                    train_orders: train_orders.len() as u32,
                    predicted: &predicted,
                    predicted_bands: &bands,
                    sources: &sources,
                    meta: &meta,
                    naive: &naive,
                    actual: &actual,
                    case_packs: &case_packs,
                    cold_start_p90: &cold_start,
                };

                if let Some(mut fold) = compute_fold_metrics(&inputs) {
                    fold.mode = decision.mode.as_str().to_string();
                    fold.training_scope = match decision.scope {
                        TrainingScope::ScheduleOnly => "schedule_only".to_string(),
                        TrainingScope::StoreAllCycles => "store_all_cycles".to_string(),
                    };
                    fold.mode_reason = decision.reason.clone();
                    source_rows.extend(compute_source_breakdown(&inputs));
                    fold_rows.push(fold);
                    fold_counter += 1;
                }
            }

            info!(
                route,
                schedule = %schedule_key,
                folds = fold_counter,
                "backtest schedule complete"
            );
        }

        Ok((fold_rows, source_rows))
    }

    async fn resolve_fold_mode(
        &self,
        route: &str,
        schedule_key: &str,
        cycles: &[crate::domain::OrderCycle],
        candidate_train: &[Order],
        cutoff: NaiveDate,
    ) -> BacktestResult<crate::engine::ModeDecision> {
        let schedule_order_count = candidate_train
            .iter()
            .filter(|o| o.schedule_key == schedule_key)
            .count() as u32;
        let cutoff_dt = cutoff
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc())
            .unwrap_or_else(|| self.clock.now_utc());
        let corrected = self
            .orders
            .corrected_order_count_before(
                route,
                schedule_key,
                cutoff_dt,
                self.forecast_config.since_days,
            )
            .await?;

        let mut per_schedule: HashMap<String, u32> = HashMap::new();
        for order in candidate_train {
            *per_schedule.entry(order.schedule_key.clone()).or_insert(0) += 1;
        }

        let mut config = self.forecast_config.clone();
        if !self.backtest_config.store_centric_context {
            // Legacy flag: same-schedule training only.
            config.store_context_min_total_orders = u32::MAX;
        }

        let inputs = ModeInputs {
            schedule_order_count,
            corrected_order_count: corrected,
            total_order_count: candidate_train.len() as u32,
            per_schedule_counts: per_schedule,
            shape: summarize_shape(cycles, schedule_key),
        };
        Ok(resolve_mode(&inputs, &config))
    }

    async fn model_fold_maps(
        &self,
        route: &str,
        schedule_key: &str,
        mode: &ForecastMode,
        train_orders: &[Order],
        target: NaiveDate,
        adjustments: &BandAdjustments,
    ) -> BacktestResult<FoldMaps> {
        let cutoff_dt = target
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc())
            .unwrap_or_else(|| self.clock.now_utc());
        let corrections = if self.backtest_config.temporal_corrections {
            self.orders
                .corrections_up_to(route, schedule_key, cutoff_dt)
                .await?
        } else {
            self.orders
                .corrections_up_to(route, schedule_key, self.clock.now_utc())
                .await?
        };

        let gap = crate::schedule::median_delivery_gap(
            train_orders.iter().map(|o| o.delivery_date).collect(),
        );
        let frame = build_training_frame(train_orders, &corrections, gap);
        let predictor = TrainedPredictor::fit(Box::new(BoostedStumpModel::new()), &frame)
            .map_err(|e| BacktestError::Engine(e.to_string()))?;

        let branch_source = match mode {
            ForecastMode::StoreCentric => SourceTag::StoreCentric,
            _ => SourceTag::ScheduleAware,
        };
        let rows = crate::features::build_prediction_rows(
            train_orders,
            &corrections,
            target,
            gap,
            &HashSet::new(),
        );
        let lines = predictor.predict_lines(&rows, branch_source);

        let mut predicted = BTreeMap::new();
        let mut bands = BTreeMap::new();
        let mut sources = BTreeMap::new();
        let mut meta = BTreeMap::new();
        for line in lines {
            let key: LineKey = (line.store_id.clone(), line.sap.clone());
            let (p10, p50, p90) = apply_band_adjustments(
                adjustments,
                line.source,
                line.p10_units,
                line.p50_units,
                line.p90_units,
            );
            let units = p50.round().max(0.0) as u32;
            if units > 0 {
                predicted.insert(key.clone(), units);
            }
            bands.insert(key.clone(), (p10, p50, p90, line.confidence));
            sources.insert(key.clone(), line.source.as_str().to_string());
            meta.insert(
                key,
                LineMeta {
                    is_slow_mover: line.is_slow_mover,
                    days_since_last_order: line.days_since_last_order,
                    corr_removal_rate: line.corr_removal_rate,
                },
            );
        }
        Ok((predicted, bands, sources, meta))
    }
}

type FoldMaps = (
    BTreeMap<LineKey, u32>,
    BTreeMap<LineKey, BandTuple>,
    BTreeMap<LineKey, String>,
    BTreeMap<LineKey, LineMeta>,
);

fn line_map(order: &Order) -> BTreeMap<LineKey, u32> {
    order.line_units().into_iter().collect()
}

/// Most recent observed units per line across the training orders.
fn last_value_map(train_orders: &[Order]) -> BTreeMap<LineKey, u32> {
    let mut sorted: Vec<&Order> = train_orders.iter().collect();
    sorted.sort_by_key(|o| o.delivery_date);
    let mut out = BTreeMap::new();
    for order in sorted {
        for (key, units) in order.line_units() {
            out.insert(key, units);
        }
    }
    out
}

/// Cold-start fold: clone the newest same-scope order with the fixed
/// 0.7/1.3 band and 0.72 confidence.
fn copy_last_maps(train_orders: &[Order]) -> FoldMaps {
    let last = train_orders
        .iter()
        .max_by_key(|o| o.delivery_date)
        .expect("non-empty train orders");

    let predicted: BTreeMap<LineKey, u32> = last.line_units().into_iter().collect();
    let bands: BTreeMap<LineKey, BandTuple> = predicted
        .iter()
        .map(|(key, units)| {
            let q = *units as f64;
            (key.clone(), ((q * 0.7).max(0.0), q, q * 1.3, 0.72))
        })
        .collect();
    let sources: BTreeMap<LineKey, String> = predicted
        .keys()
        .map(|key| (key.clone(), "last_order_anchor".to_string()))
        .collect();
    (predicted, bands, sources, BTreeMap::new())
}
