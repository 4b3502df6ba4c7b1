//! Training pipeline: fit, validate against the naive baseline, and flip the
//! route's trained-model flag only when the gate passes.

use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::ForecastConfig;
use crate::features::build_training_frame;
use crate::schedule::median_delivery_gap;
use crate::storage::OrderStore;

use super::model::{BoostedStumpModel, DemandModel};
use super::{EngineError, EngineResult};

/// Deployment gate thresholds for a freshly trained model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationGate {
    pub mae_threshold: f64,
    pub rmse_threshold: f64,
}

impl Default for ValidationGate {
    fn default() -> Self {
        Self {
            mae_threshold: 5.0,
            rmse_threshold: 8.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingReport {
    pub route_number: String,
    pub training_rows: usize,
    pub holdout_rows: usize,
    pub mae: f64,
    pub rmse: f64,
    pub naive_mae: f64,
    pub naive_rmse: f64,
    pub passed: bool,
}

/// Compare model predictions against actuals and the copy-last-value naive
/// baseline.
pub fn validate_predictions(
    actual: &[f64],
    predicted: &[f64],
    naive: &[f64],
    gate: &ValidationGate,
) -> TrainingMetrics {
    let n = actual.len().max(1) as f64;
    let mae = actual
        .iter()
        .zip(predicted)
        .map(|(y, p)| (y - p).abs())
        .sum::<f64>()
        / n;
    let rmse = (actual
        .iter()
        .zip(predicted)
        .map(|(y, p)| (y - p) * (y - p))
        .sum::<f64>()
        / n)
        .sqrt();
    let naive_mae = actual
        .iter()
        .zip(naive)
        .map(|(y, p)| (y - p).abs())
        .sum::<f64>()
        / n;
    let naive_rmse = (actual
        .iter()
        .zip(naive)
        .map(|(y, p)| (y - p) * (y - p))
        .sum::<f64>()
        / n)
        .sqrt();

    TrainingMetrics {
        mae,
        rmse,
        naive_mae,
        naive_rmse,
        passed: mae <= gate.mae_threshold && rmse <= gate.rmse_threshold,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingMetrics {
    pub mae: f64,
    pub rmse: f64,
    pub naive_mae: f64,
    pub naive_rmse: f64,
    pub passed: bool,
}

/// Retrain a route: fit on all but the newest delivery, validate on the
/// newest, and persist the trained-model flag when the gate passes.
pub async fn run_training_pipeline(
    store: Arc<dyn OrderStore>,
    route: &str,
    config: &ForecastConfig,
    gate: &ValidationGate,
) -> EngineResult<TrainingReport> {
    let orders = store
        .orders_in_window(route, config.since_days, None)
        .await?;
    if orders.is_empty() {
        return Err(EngineError::InsufficientHistory(format!(
            "no finalized orders for route {route}"
        )));
    }

    let holdout_date: NaiveDate = orders
        .iter()
        .map(|o| o.delivery_date)
        .max()
        .expect("non-empty orders");

    let train: Vec<_> = orders
        .iter()
        .filter(|o| o.delivery_date < holdout_date)
        .cloned()
        .collect();
    if train.is_empty() {
        return Err(EngineError::InsufficientHistory(format!(
            "single delivery of history for route {route}"
        )));
    }

    let gap = median_delivery_gap(orders.iter().map(|o| o.delivery_date).collect());
    let corrections = Vec::new();
    let train_frame = build_training_frame(&train, &corrections, gap);
    let full_frame = build_training_frame(&orders, &corrections, gap);

    let holdout: Vec<_> = full_frame
        .rows
        .iter()
        .filter(|row| row.delivery_date == holdout_date)
        .collect();
    if train_frame.is_empty() || holdout.is_empty() {
        return Err(EngineError::InsufficientHistory(format!(
            "not enough lagged rows for route {route}"
        )));
    }

    let covariates: Vec<Vec<f64>> = train_frame.rows.iter().map(|r| r.covariates()).collect();
    let targets: Vec<f64> = train_frame.rows.iter().map(|r| r.units).collect();
    let mut model = BoostedStumpModel::new();
    model.fit(&covariates, &targets)?;

    let actual: Vec<f64> = holdout.iter().map(|r| r.units).collect();
    let predicted: Vec<f64> = holdout.iter().map(|r| model.predict(&r.covariates())).collect();
    let naive: Vec<f64> = holdout.iter().map(|r| r.lag_1).collect();

    let metrics = validate_predictions(&actual, &predicted, &naive, gate);
    let report = TrainingReport {
        route_number: route.to_string(),
        training_rows: train_frame.len(),
        holdout_rows: holdout.len(),
        mae: metrics.mae,
        rmse: metrics.rmse,
        naive_mae: metrics.naive_mae,
        naive_rmse: metrics.naive_rmse,
        passed: metrics.passed,
    };

    if report.passed {
        store.set_trained_model(route, true).await?;
        info!(
            route,
            mae = report.mae,
            rmse = report.rmse,
            rows = report.training_rows,
            "training gate passed; model deployed"
        );
    } else {
        warn!(
            route,
            mae = report.mae,
            rmse = report.rmse,
            naive_mae = report.naive_mae,
            "training gate failed; keeping previous model state"
        );
    }

    Ok(report)
}
