//! Retrain orchestrator: the daily per-route loop.
//!
//! Each tick walks the synced routes in order: cycle-completion check,
//! status publish, conditional retrain, single next-delivery forecast,
//! calibration hook, weekly snapshot refresh. A failure on one route never
//! skips the others.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use metrics::counter;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::backtest::{refresh_learning_snapshots, Backtester, SnapshotRefreshOutcome};
use crate::cache::{auto_slow_mover_allowlist, ForecastCache, PoolingPolicy, RouteGroup, TransferPlanner};
use crate::calibration::{BandCalibrator, CalibrationOutcome};
use crate::clock::Clock;
use crate::config::Config;
use crate::docstore::{decode, DocumentStore};
use crate::engine::{run_training_pipeline, ForecastEngine, ForecastRequest, ValidationGate};
use crate::schedule::next_unordered_delivery;
use crate::storage::OrderStore;

pub const STATUS_COLLECTION: &str = "forecast_status";
const ROUTE_GROUP_COLLECTION: &str = "route_groups";
/// Order recency window for the cycle-completion check.
const CYCLE_WINDOW_DAYS: i64 = 7;

/// Per-route outcome of one tick, for logs and tests.
#[derive(Debug, Clone, Default)]
pub struct RouteTickReport {
    pub route_number: String,
    pub cycle_complete: bool,
    pub missing_schedules: Vec<String>,
    pub retrained: bool,
    pub forecast_generated: bool,
    pub forecast_skipped_reason: Option<String>,
    pub calibration: Option<String>,
    pub error: Option<String>,
}

pub struct RetrainOrchestrator {
    orders: Arc<dyn OrderStore>,
    docs: Arc<dyn DocumentStore>,
    engine: Arc<ForecastEngine>,
    cache: Arc<ForecastCache>,
    calibrator: Arc<BandCalibrator>,
    backtester: Arc<Backtester>,
    transfers: Option<Arc<TransferPlanner>>,
    clock: Arc<dyn Clock>,
    config: Config,
}

impl RetrainOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        orders: Arc<dyn OrderStore>,
        docs: Arc<dyn DocumentStore>,
        engine: Arc<ForecastEngine>,
        cache: Arc<ForecastCache>,
        calibrator: Arc<BandCalibrator>,
        backtester: Arc<Backtester>,
        clock: Arc<dyn Clock>,
        config: Config,
    ) -> Self {
        Self {
            orders,
            docs,
            engine,
            cache,
            calibrator,
            backtester,
            transfers: None,
            clock,
            config,
        }
    }

    pub fn with_transfer_planner(mut self, planner: Arc<TransferPlanner>) -> Self {
        self.transfers = Some(planner);
        self
    }

    /// Interval loop; finishes the current tick on shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.orchestrator.interval_seconds,
            "retrain orchestrator started"
        );
        loop {
            if *shutdown.borrow() {
                info!("retrain orchestrator stopping");
                return;
            }
            if let Err(error) = self.tick().await {
                error!(%error, "retrain tick failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(
                    self.config.orchestrator.interval_seconds,
                )) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// One full pass over the synced routes.
    pub async fn tick(&self) -> crate::domain::Result<Vec<RouteTickReport>> {
        let routes = self.orders.synced_routes().await?;
        if routes.is_empty() {
            debug!("no synced routes");
            return Ok(Vec::new());
        }
        info!(routes = routes.len(), "retrain tick starting");

        let mut reports = Vec::new();
        let mut retrained_routes: HashSet<String> = HashSet::new();
        for route in &routes {
            let report = self.check_route(route).await;
            if report.retrained {
                retrained_routes.insert(route.clone());
            }
            if let Some(error) = &report.error {
                warn!(route, error, "route tick finished with error");
            }
            reports.push(report);
        }

        // Weekly snapshot refresh; retrained routes are forced.
        if self.config.orchestrator.learning_refresh_enabled {
            match refresh_learning_snapshots(
                self.backtester.as_ref(),
                self.orders.clone(),
                self.clock.clone(),
                &self.config.backtest,
                &routes,
                &retrained_routes,
            )
            .await
            {
                Ok(SnapshotRefreshOutcome::Refreshed {
                    routes_refreshed,
                    routes_no_data,
                    ..
                }) => {
                    info!(
                        refreshed = routes_refreshed.len(),
                        no_data = routes_no_data.len(),
                        "learning snapshots refreshed"
                    );
                }
                Ok(SnapshotRefreshOutcome::SkippedNotDue) => {
                    debug!("learning snapshot refresh not due");
                }
                Ok(_) => {}
                Err(error) => warn!(%error, "learning snapshot refresh failed"),
            }
        }

        Ok(reports)
    }

    /// The strict per-route sequence. Every failure is recorded and
    /// contained.
    pub async fn check_route(&self, route: &str) -> RouteTickReport {
        let mut report = RouteTickReport {
            route_number: route.to_string(),
            ..Default::default()
        };

        // 1. Cycle check.
        let (complete, missing) = match self.cycle_status(route).await {
            Ok(result) => result,
            Err(error) => {
                report.error = Some(error.to_string());
                return report;
            }
        };
        report.cycle_complete = complete;
        report.missing_schedules = missing;

        // 2. Status publish happens unconditionally.
        if let Err(error) = self.publish_status(route).await {
            warn!(route, %error, "forecast status publish failed");
        }

        // 3. Conditional retrain.
        if complete {
            match self.maybe_retrain(route).await {
                Ok(retrained) => report.retrained = retrained,
                Err(error) => {
                    // Training failure is logged and non-fatal.
                    warn!(route, %error, "training failed");
                }
            }
        } else {
            debug!(route, missing = ?report.missing_schedules, "cycle incomplete; retrain skipped");
        }

        // 4. Forecast the single next unordered delivery.
        match self.forecast_next_delivery(route).await {
            Ok(Some(reason)) => report.forecast_skipped_reason = Some(reason),
            Ok(None) => report.forecast_generated = true,
            Err(error) => {
                report.error = Some(error.to_string());
            }
        }

        // 5. Band calibration hook.
        if self.config.orchestrator.band_calibration_enabled {
            match self.maybe_calibrate(route).await {
                Ok(status) => report.calibration = Some(status),
                Err(error) => warn!(route, %error, "band calibration failed"),
            }
        }

        report
    }

    /// The cycle is complete iff every active schedule has at least one
    /// order in the trailing window.
    async fn cycle_status(&self, route: &str) -> crate::domain::Result<(bool, Vec<String>)> {
        let cycles = self.orders.active_cycles(route).await?;
        if cycles.is_empty() {
            return Ok((false, Vec::new()));
        }

        let cutoff = self.clock.today_utc() - ChronoDuration::days(CYCLE_WINDOW_DAYS);
        let recent = self
            .orders
            .orders_in_window(route, (CYCLE_WINDOW_DAYS * 2) as u32, None)
            .await?;

        let mut recent_by_schedule: HashSet<&str> = HashSet::new();
        for order in &recent {
            if order.order_date.map_or(false, |date| date >= cutoff) {
                recent_by_schedule.insert(order.schedule_key.as_str());
            }
        }

        let mut missing = Vec::new();
        for cycle in &cycles {
            let key = cycle.schedule_key();
            if !recent_by_schedule.contains(key) && !missing.contains(&key.to_string()) {
                missing.push(key.to_string());
            }
        }
        Ok((missing.is_empty(), missing))
    }

    async fn publish_status(&self, route: &str) -> crate::domain::Result<()> {
        let order_count = self.orders.order_count(route, None, true).await?;
        let has_trained_model = self.orders.has_trained_model(route).await?;
        self.docs
            .merge(
                STATUS_COLLECTION,
                route,
                json!({
                    "order_count": order_count,
                    "min_orders_required": self.config.orchestrator.min_orders_for_training,
                    "has_trained_model": has_trained_model,
                    "last_updated": self.clock.now_utc(),
                }),
            )
            .await
    }

    /// Retrain only when every schedule clears the non-holiday minimum.
    async fn maybe_retrain(&self, route: &str) -> crate::domain::Result<bool> {
        let cycles = self.orders.active_cycles(route).await?;
        let minimum = self.config.orchestrator.min_orders_for_training;

        let mut schedule_keys: Vec<&str> = cycles.iter().map(|c| c.schedule_key()).collect();
        schedule_keys.sort();
        schedule_keys.dedup();

        for key in &schedule_keys {
            let count = self.orders.order_count(route, Some(key), true).await?;
            if count < minimum {
                debug!(
                    route,
                    schedule = key,
                    count,
                    minimum,
                    "not enough non-holiday orders; retrain skipped"
                );
                return Ok(false);
            }
        }

        match run_training_pipeline(
            self.orders.clone(),
            route,
            &self.config.forecast,
            &ValidationGate::default(),
        )
        .await
        {
            Ok(outcome) => {
                counter!("retrain_runs_total", 1);
                info!(
                    route,
                    mae = outcome.mae,
                    rmse = outcome.rmse,
                    passed = outcome.passed,
                    "training pipeline finished"
                );
                Ok(outcome.passed)
            }
            Err(error) if error.is_logical() => {
                debug!(route, %error, "training gated");
                Ok(false)
            }
            Err(error) => Err(crate::domain::CoreError::Config(error.to_string())),
        }
    }

    /// Generate a forecast for the single next unordered delivery. Returns
    /// a skip reason when nothing was generated.
    async fn forecast_next_delivery(
        &self,
        route: &str,
    ) -> crate::domain::Result<Option<String>> {
        let cycles = self.orders.active_cycles(route).await?;
        if cycles.is_empty() {
            return Ok(Some("no_schedules".to_string()));
        }

        let timezone = self.orders.route_timezone(route).await?;
        let today = self.clock.today_in(timezone.as_deref());
        let ordered: HashSet<(String, chrono::NaiveDate)> = self
            .orders
            .finalized_deliveries_after(route, today)
            .await?
            .into_iter()
            .collect();

        let Some(next) = next_unordered_delivery(&cycles, today, &ordered) else {
            return Ok(Some("no_upcoming_delivery".to_string()));
        };

        if self
            .cache
            .has_fresh_payload(route, next.delivery_date, &next.schedule_key)
            .await?
        {
            debug!(
                route,
                delivery = %next.delivery_date,
                schedule = %next.schedule_key,
                "fresh forecast exists; skipped"
            );
            return Ok(Some("forecast_exists".to_string()));
        }

        let request = ForecastRequest {
            route_number: route.to_string(),
            delivery_date: next.delivery_date,
            schedule_key: Some(next.schedule_key.clone()),
            active_promos: HashSet::new(),
        };
        match self.engine.generate(&request).await {
            Ok(payload) => {
                self.cache.store_payload(&payload).await?;
                counter!("forecasts_generated_total", 1);
                if self.config.forecast.enable_transfer_suggestions {
                    if let Err(error) = self.maybe_plan_transfers(route, &payload).await {
                        warn!(route, %error, "transfer planning failed");
                    }
                }
                Ok(None)
            }
            Err(error) if error.is_logical() => {
                // Hard gates keep the daemon running.
                info!(route, %error, "forecast skipped by engine gate");
                Ok(Some(error.to_string()))
            }
            Err(error) => Err(crate::domain::CoreError::Config(error.to_string())),
        }
    }

    /// Optional pooled-transfer planning for multi-route groups.
    async fn maybe_plan_transfers(
        &self,
        route: &str,
        payload: &crate::domain::ForecastPayload,
    ) -> crate::domain::Result<()> {
        let Some(planner) = &self.transfers else {
            return Ok(());
        };

        // Find the group containing this route.
        let mut group: Option<RouteGroup> = None;
        for doc in self.docs.list(ROUTE_GROUP_COLLECTION).await? {
            if let Ok(candidate) = decode::<RouteGroup>(ROUTE_GROUP_COLLECTION, &doc) {
                if candidate.route_numbers.iter().any(|r| r == route) {
                    group = Some(candidate);
                    break;
                }
            }
        }
        let Some(group) = group else {
            return Ok(());
        };
        if group.policy == PoolingPolicy::Disabled || group.route_numbers.len() < 2 {
            return Ok(());
        }

        // Same-cycle cached forecasts per group route.
        let mut cycle_forecasts = HashMap::new();
        for member in &group.route_numbers {
            let lookup = self
                .cache
                .lookup(member, payload.delivery_date, &payload.schedule_key)
                .await?;
            if let Some(member_payload) = lookup.forecast {
                cycle_forecasts.insert(member.clone(), member_payload);
            }
        }

        let allowed = match group.policy {
            PoolingPolicy::EligibleList => {
                Some(group.pooled_saps.iter().cloned().collect::<HashSet<_>>())
            }
            PoolingPolicy::AutoSlowMovers => {
                let mut pooled_orders = Vec::new();
                for member in &group.route_numbers {
                    pooled_orders.extend(
                        self.orders
                            .orders_in_window(member, 180, Some(&payload.schedule_key))
                            .await?,
                    );
                }
                let case_packs = self.orders.case_packs(route).await?;
                Some(auto_slow_mover_allowlist(&pooled_orders, &case_packs))
            }
            PoolingPolicy::Disabled => None,
        };

        planner
            .plan_for_cycle(&group, payload, &cycle_forecasts, allowed.as_ref())
            .await?;
        Ok(())
    }

    /// Run the calibrator when due, feeding it a fresh backtest.
    async fn maybe_calibrate(&self, route: &str) -> crate::domain::Result<String> {
        let due = self
            .calibrator
            .is_due(route)
            .await
            .map_err(|e| crate::domain::CoreError::Config(e.to_string()))?;
        if !due {
            return Ok("skipped_recent".to_string());
        }

        let run = self
            .backtester
            .run(&[route.to_string()])
            .await
            .map_err(|e| crate::domain::CoreError::Config(e.to_string()))?;
        let outcome = self
            .calibrator
            .calibrate_route_if_due(route, &run.folds, &run.sources)
            .await
            .map_err(|e| crate::domain::CoreError::Config(e.to_string()))?;

        Ok(match outcome {
            CalibrationOutcome::SkippedRecent { .. } => "skipped_recent".to_string(),
            CalibrationOutcome::NoData => "no_data".to_string(),
            CalibrationOutcome::Updated { schedules } => {
                let updated = schedules.iter().filter(|s| s.updated).count();
                counter!("band_calibrations_total", updated as u64);
                format!("updated_{updated}")
            }
        })
    }
}
