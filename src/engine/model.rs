//! Demand model abstraction and the default boosted-stump regressor.
//!
//! The regression algorithm is a pluggable seam: anything that can fit the
//! covariate matrix and predict a point estimate works. The default is
//! least-squares gradient boosting over depth-1 trees, which handles the
//! mixed lag/calendar/correction covariates without scaling or encoding.

use crate::domain::SourceTag;
use crate::features::{FeatureFrame, FeatureRow};

use super::{EngineError, EngineResult};

pub trait DemandModel: Send + Sync {
    fn name(&self) -> &str;

    fn fit(&mut self, covariates: &[Vec<f64>], targets: &[f64]) -> EngineResult<()>;

    fn predict(&self, covariates: &[f64]) -> f64;
}

/// Gradient-boosted decision stumps (depth-1 regression trees).
pub struct BoostedStumpModel {
    rounds: usize,
    learning_rate: f64,
    base: f64,
    stumps: Vec<Stump>,
    trained: bool,
}

#[derive(Debug, Clone)]
struct Stump {
    feature: usize,
    threshold: f64,
    left_value: f64,
    right_value: f64,
}

impl Stump {
    fn apply(&self, covariates: &[f64]) -> f64 {
        let value = covariates.get(self.feature).copied().unwrap_or(0.0);
        if value <= self.threshold {
            self.left_value
        } else {
            self.right_value
        }
    }
}

const THRESHOLD_CANDIDATES: usize = 16;

impl BoostedStumpModel {
    pub fn new() -> Self {
        Self::with_params(60, 0.1)
    }

    pub fn with_params(rounds: usize, learning_rate: f64) -> Self {
        Self {
            rounds,
            learning_rate,
            base: 0.0,
            stumps: Vec::new(),
            trained: false,
        }
    }

    /// Candidate split points: quantile midpoints over the observed values.
    fn thresholds(values: &mut Vec<f64>) -> Vec<f64> {
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        values.dedup();
        if values.len() < 2 {
            return Vec::new();
        }
        if values.len() <= THRESHOLD_CANDIDATES {
            return values
                .windows(2)
                .map(|pair| (pair[0] + pair[1]) / 2.0)
                .collect();
        }
        (1..=THRESHOLD_CANDIDATES)
            .map(|i| {
                let idx = i * (values.len() - 1) / (THRESHOLD_CANDIDATES + 1);
                (values[idx] + values[idx + 1]) / 2.0
            })
            .collect()
    }

    fn best_stump(covariates: &[Vec<f64>], residuals: &[f64]) -> Option<(Stump, f64)> {
        let n = residuals.len();
        let n_features = covariates.first().map(Vec::len).unwrap_or(0);
        let total_sum: f64 = residuals.iter().sum();
        let base_sse: f64 = residuals.iter().map(|r| r * r).sum();

        let mut best: Option<(Stump, f64)> = None;
        for feature in 0..n_features {
            let mut values: Vec<f64> = covariates.iter().map(|row| row[feature]).collect();
            for threshold in Self::thresholds(&mut values) {
                let mut left_sum = 0.0;
                let mut left_count = 0usize;
                for (row, residual) in covariates.iter().zip(residuals) {
                    if row[feature] <= threshold {
                        left_sum += residual;
                        left_count += 1;
                    }
                }
                if left_count == 0 || left_count == n {
                    continue;
                }
                let right_count = n - left_count;
                let left_mean = left_sum / left_count as f64;
                let right_mean = (total_sum - left_sum) / right_count as f64;
                // SSE after split = base - n_l*mean_l^2 - n_r*mean_r^2.
                let sse = base_sse
                    - left_count as f64 * left_mean * left_mean
                    - right_count as f64 * right_mean * right_mean;
                if best.as_ref().map_or(true, |(_, best_sse)| sse < *best_sse) {
                    best = Some((
                        Stump {
                            feature,
                            threshold,
                            left_value: left_mean,
                            right_value: right_mean,
                        },
                        sse,
                    ));
                }
            }
        }
        best.map(|(stump, sse)| (stump, base_sse - sse))
    }

    fn raw_predict(&self, covariates: &[f64]) -> f64 {
        let mut value = self.base;
        for stump in &self.stumps {
            value += self.learning_rate * stump.apply(covariates);
        }
        value
    }
}

impl Default for BoostedStumpModel {
    fn default() -> Self {
        Self::new()
    }
}

impl DemandModel for BoostedStumpModel {
    fn name(&self) -> &str {
        "boosted_stumps"
    }

    fn fit(&mut self, covariates: &[Vec<f64>], targets: &[f64]) -> EngineResult<()> {
        if covariates.len() != targets.len() {
            return Err(EngineError::Model(format!(
                "covariate/target length mismatch: {} vs {}",
                covariates.len(),
                targets.len()
            )));
        }
        if targets.is_empty() {
            return Err(EngineError::Model("empty training frame".to_string()));
        }

        self.base = targets.iter().sum::<f64>() / targets.len() as f64;
        self.stumps.clear();

        let mut predictions = vec![self.base; targets.len()];
        let min_gain = 1e-9 * targets.len() as f64;

        for _ in 0..self.rounds {
            let residuals: Vec<f64> = targets
                .iter()
                .zip(&predictions)
                .map(|(y, p)| y - p)
                .collect();
            let Some((stump, gain)) = Self::best_stump(covariates, &residuals) else {
                break;
            };
            if gain <= min_gain {
                break;
            }
            for (row, prediction) in covariates.iter().zip(predictions.iter_mut()) {
                *prediction += self.learning_rate * stump.apply(row);
            }
            self.stumps.push(stump);
        }

        self.trained = true;
        Ok(())
    }

    fn predict(&self, covariates: &[f64]) -> f64 {
        if !self.trained {
            return 0.0;
        }
        self.raw_predict(covariates).max(0.0)
    }
}

/// One predicted line before calibration and whole-case enforcement.
#[derive(Debug, Clone)]
pub struct LinePrediction {
    pub store_id: String,
    pub store_name: String,
    pub sap: String,
    pub p10_units: f64,
    pub p50_units: f64,
    pub p90_units: f64,
    pub confidence: f64,
    pub source: SourceTag,
    pub is_slow_mover: bool,
    pub days_since_last_order: f64,
    pub corr_removal_rate: f64,
    pub corr_samples: f64,
    pub last_order_quantity: Option<u32>,
}

/// A fitted model plus the residual quantiles that seed the p10/p90 band.
pub struct TrainedPredictor {
    model: Box<dyn DemandModel>,
    residual_q10: f64,
    residual_q90: f64,
}

fn quantile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let pos = q * (sorted.len() - 1) as f64;
    let low = pos.floor() as usize;
    let high = pos.ceil() as usize;
    if low == high {
        sorted[low]
    } else {
        let weight = pos - low as f64;
        sorted[low] * (1.0 - weight) + sorted[high] * weight
    }
}

impl TrainedPredictor {
    /// Fit a model on the training frame and capture residual quantiles.
    pub fn fit(mut model: Box<dyn DemandModel>, frame: &FeatureFrame) -> EngineResult<Self> {
        if frame.is_empty() {
            return Err(EngineError::InsufficientHistory(
                "no trainable feature rows".to_string(),
            ));
        }
        let covariates: Vec<Vec<f64>> = frame.rows.iter().map(FeatureRow::covariates).collect();
        let targets: Vec<f64> = frame.rows.iter().map(|row| row.units).collect();
        model.fit(&covariates, &targets)?;

        let mut residuals: Vec<f64> = covariates
            .iter()
            .zip(&targets)
            .map(|(row, y)| y - model.predict(row))
            .collect();
        residuals.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let residual_q10 = quantile(&residuals, 0.10).min(0.0);
        let residual_q90 = quantile(&residuals, 0.90).max(0.0);

        Ok(Self {
            model,
            residual_q10,
            residual_q90,
        })
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    /// Predict each row and attach the residual band. The branch tag comes
    /// from the caller; slow movers are re-tagged `slow_intermittent`.
    pub fn predict_lines(
        &self,
        rows: &[FeatureRow],
        branch_source: SourceTag,
    ) -> Vec<LinePrediction> {
        rows.iter()
            .map(|row| {
                let point = self.model.predict(&row.covariates());
                let p50 = point.max(0.0);
                let p10 = (p50 + self.residual_q10).max(0.0);
                let p90 = (p50 + self.residual_q90).max(p50);
                let width = p90 - p10;
                let confidence =
                    (1.0 - width / (2.0 * p50.max(1.0))).clamp(0.25, 0.95);
                let source = if row.is_slow_mover {
                    SourceTag::SlowIntermittent
                } else {
                    branch_source
                };
                LinePrediction {
                    store_id: row.store_id.clone(),
                    store_name: row.store_name.clone(),
                    sap: row.sap.clone(),
                    p10_units: p10,
                    p50_units: p50,
                    p90_units: p90,
                    confidence,
                    source,
                    is_slow_mover: row.is_slow_mover,
                    days_since_last_order: row.days_since_last_order,
                    corr_removal_rate: row.corr_removal_rate,
                    corr_samples: row.corr_samples,
                    last_order_quantity: Some(row.lag_1.round().max(0.0) as u32),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::build_training_frame;
    use crate::domain::{LineItem, Order, OrderStatus, StoreOrder};
    use chrono::NaiveDate;

    #[test]
    fn stump_model_learns_a_step_function() {
        let covariates: Vec<Vec<f64>> = (0..40)
            .map(|i| vec![i as f64, (i % 3) as f64])
            .collect();
        let targets: Vec<f64> = (0..40)
            .map(|i| if i < 20 { 5.0 } else { 15.0 })
            .collect();

        let mut model = BoostedStumpModel::new();
        model.fit(&covariates, &targets).unwrap();

        assert!(model.predict(&[5.0, 0.0]) < 9.0);
        assert!(model.predict(&[30.0, 0.0]) > 11.0);
    }

    #[test]
    fn fit_rejects_empty_frame() {
        let mut model = BoostedStumpModel::new();
        assert!(model.fit(&[], &[]).is_err());
    }

    fn simple_order(id: &str, day: u32, units: u32) -> Order {
        let delivery = NaiveDate::from_ymd_opt(2025, 1, day).unwrap();
        Order {
            order_id: id.to_string(),
            route_number: "989262".to_string(),
            schedule_key: "monday".to_string(),
            delivery_date: delivery,
            order_date: Some(delivery - chrono::Duration::days(3)),
            status: OrderStatus::Finalized,
            is_holiday_week: false,
            stores: vec![StoreOrder {
                store_id: "s1".to_string(),
                store_name: "Store One".to_string(),
                items: vec![LineItem {
                    sap: "31032".to_string(),
                    units,
                    cases: None,
                    promo_active: false,
                    user_adjusted: false,
                    forecasted_units: None,
                    forecasted_cases: None,
                }],
                entered_at: None,
            }],
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn predictor_bands_are_monotone() {
        let orders: Vec<Order> = (0..10u32)
            .map(|i| simple_order(&format!("o{i}"), 2 + i * 3, 10 + (i % 4)))
            .collect();
        let frame = build_training_frame(&orders, &[], 3);
        let predictor =
            TrainedPredictor::fit(Box::new(BoostedStumpModel::new()), &frame).unwrap();
        let lines = predictor.predict_lines(&frame.rows, SourceTag::ScheduleAware);
        assert!(!lines.is_empty());
        for line in lines {
            assert!(line.p10_units <= line.p50_units);
            assert!(line.p50_units <= line.p90_units);
            assert!(line.confidence >= 0.25 && line.confidence <= 0.95);
        }
    }
}
