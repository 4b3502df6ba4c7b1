//! Feature frame construction for the demand model.
//!
//! Orders become a dense frame keyed by (store, sap, delivery_date). Rows
//! without a lag_1 value are dropped; remaining gaps follow fixed defaulting
//! rules so the model never sees NaN.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{Datelike, NaiveDate};

use crate::domain::{CorrectionAggregate, Order};
use crate::schedule::{
    covers_first_weekend, covers_weekend, days_until_first_weekend, is_first_weekend_of_month,
    is_holiday_week, is_last_weekend_of_month,
};

const ROLLING_WINDOW: usize = 4;
/// A line is a slow mover when it appears in at most this share of the
/// window's orders.
const SLOW_MOVER_MAX_ORDER_RATE: f64 = 0.34;

/// One observation row, fully defaulted.
#[derive(Debug, Clone)]
pub struct FeatureRow {
    pub store_id: String,
    pub store_name: String,
    pub sap: String,
    pub delivery_date: NaiveDate,
    /// Target units; zero for prediction rows.
    pub units: f64,

    pub lag_1: f64,
    pub lag_2: f64,
    pub rolling_mean_4: f64,

    pub day_of_week: f64,
    pub month: f64,
    pub is_first_weekend_of_month: f64,
    pub is_last_weekend_of_month: f64,
    pub is_holiday_week: f64,
    pub days_until_first_weekend: f64,
    pub days_until_next_delivery: f64,
    pub covers_first_weekend: f64,
    pub covers_weekend: f64,
    pub lead_time_days: f64,

    pub promo_active: f64,

    pub corr_samples: f64,
    pub corr_avg_delta: f64,
    pub corr_avg_ratio: f64,
    pub corr_ratio_stddev: f64,
    pub corr_removal_rate: f64,
    pub corr_promo_rate: f64,

    // Context meta propagated downstream, not used as covariates.
    pub is_slow_mover: bool,
    pub days_since_last_order: f64,
}

impl FeatureRow {
    /// Covariate vector consumed by the model. Order is stable; the target
    /// (`units`) and context meta are excluded.
    pub fn covariates(&self) -> Vec<f64> {
        vec![
            self.lag_1,
            self.lag_2,
            self.rolling_mean_4,
            self.day_of_week,
            self.month,
            self.is_first_weekend_of_month,
            self.is_last_weekend_of_month,
            self.is_holiday_week,
            self.days_until_first_weekend,
            self.days_until_next_delivery,
            self.covers_first_weekend,
            self.covers_weekend,
            self.lead_time_days,
            self.promo_active,
            self.corr_samples,
            self.corr_avg_delta,
            self.corr_avg_ratio,
            self.corr_ratio_stddev,
            self.corr_removal_rate,
            self.corr_promo_rate,
        ]
    }
}

#[derive(Debug, Clone, Default)]
pub struct FeatureFrame {
    pub rows: Vec<FeatureRow>,
}

impl FeatureFrame {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

type LineKey = (String, String);

#[derive(Debug, Clone)]
struct Observation {
    delivery_date: NaiveDate,
    units: f64,
    promo_active: bool,
    store_name: String,
    lead_time_days: Option<f64>,
}

fn observations_by_key(orders: &[Order]) -> BTreeMap<LineKey, Vec<Observation>> {
    let mut out: BTreeMap<LineKey, Vec<Observation>> = BTreeMap::new();
    for order in orders {
        let lead_time = order
            .order_date
            .map(|od| (order.delivery_date - od).num_days() as f64);
        for store in &order.stores {
            if store.store_id.is_empty() {
                continue;
            }
            for item in &store.items {
                if item.sap.is_empty() || item.units == 0 {
                    continue;
                }
                out.entry((store.store_id.clone(), item.sap.clone()))
                    .or_default()
                    .push(Observation {
                        delivery_date: order.delivery_date,
                        units: item.units as f64,
                        promo_active: item.promo_active,
                        store_name: store.store_name.clone(),
                        lead_time_days: lead_time,
                    });
            }
        }
    }
    for observations in out.values_mut() {
        observations.sort_by_key(|obs| obs.delivery_date);
    }
    out
}

fn median(values: &mut Vec<f64>) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 1 {
        values[mid]
    } else {
        (values[mid - 1] + values[mid]) / 2.0
    })
}

fn correction_index(
    corrections: &[CorrectionAggregate],
) -> HashMap<(String, String), &CorrectionAggregate> {
    corrections
        .iter()
        .map(|agg| ((agg.store_id.clone(), agg.sap.clone()), agg))
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn base_row(
    key: &LineKey,
    store_name: &str,
    delivery_date: NaiveDate,
    days_until_next: i64,
    lead_time_days: f64,
    promo_active: bool,
    corrections: &HashMap<(String, String), &CorrectionAggregate>,
) -> FeatureRow {
    let corr = corrections.get(key);
    FeatureRow {
        store_id: key.0.clone(),
        store_name: store_name.to_string(),
        sap: key.1.clone(),
        delivery_date,
        units: 0.0,
        lag_1: 0.0,
        lag_2: 0.0,
        rolling_mean_4: 0.0,
        day_of_week: delivery_date.weekday().number_from_monday() as f64,
        month: delivery_date.month() as f64,
        is_first_weekend_of_month: is_first_weekend_of_month(delivery_date) as u8 as f64,
        is_last_weekend_of_month: is_last_weekend_of_month(delivery_date) as u8 as f64,
        is_holiday_week: is_holiday_week(delivery_date) as u8 as f64,
        days_until_first_weekend: days_until_first_weekend(delivery_date) as f64,
        days_until_next_delivery: days_until_next as f64,
        covers_first_weekend: covers_first_weekend(delivery_date, days_until_next) as u8 as f64,
        covers_weekend: covers_weekend(delivery_date, days_until_next) as u8 as f64,
        lead_time_days,
        promo_active: promo_active as u8 as f64,
        corr_samples: corr.map_or(0.0, |c| c.samples as f64),
        corr_avg_delta: corr.map_or(0.0, |c| c.avg_delta),
        corr_avg_ratio: corr.map_or(0.0, |c| c.avg_ratio),
        corr_ratio_stddev: corr.map_or(0.0, |c| c.ratio_stddev),
        corr_removal_rate: corr.map_or(0.0, |c| c.removal_rate),
        corr_promo_rate: corr.map_or(0.0, |c| c.promo_rate),
        is_slow_mover: false,
        days_since_last_order: 0.0,
    }
}

/// Build the training frame from historical orders.
///
/// `days_until_next` should be the route's median inter-delivery gap (see
/// `schedule::median_delivery_gap`).
pub fn build_training_frame(
    orders: &[Order],
    corrections: &[CorrectionAggregate],
    days_until_next: i64,
) -> FeatureFrame {
    let by_key = observations_by_key(orders);
    let corr_index = correction_index(corrections);

    let mut lead_times: Vec<f64> = by_key
        .values()
        .flatten()
        .filter_map(|obs| obs.lead_time_days)
        .collect();
    let median_lead = median(&mut lead_times).unwrap_or(2.0);

    let total_orders = orders.len().max(1) as f64;

    let mut rows = Vec::new();
    for (key, observations) in &by_key {
        let order_rate = observations.len() as f64 / total_orders;
        for (idx, obs) in observations.iter().enumerate() {
            if idx == 0 {
                // No lag_1 available.
                continue;
            }
            let mut row = base_row(
                key,
                &obs.store_name,
                obs.delivery_date,
                days_until_next,
                obs.lead_time_days.unwrap_or(median_lead),
                obs.promo_active,
                &corr_index,
            );
            row.units = obs.units;
            row.lag_1 = observations[idx - 1].units;
            row.lag_2 = if idx >= 2 {
                observations[idx - 2].units
            } else {
                0.0
            };
            let window_start = idx.saturating_sub(ROLLING_WINDOW);
            let window = &observations[window_start..idx];
            row.rolling_mean_4 = if window.is_empty() {
                row.lag_1
            } else {
                window.iter().map(|o| o.units).sum::<f64>() / window.len() as f64
            };
            row.is_slow_mover = order_rate <= SLOW_MOVER_MAX_ORDER_RATE;
            row.days_since_last_order =
                (obs.delivery_date - observations[idx - 1].delivery_date).num_days() as f64;
            rows.push(row);
        }
    }

    FeatureFrame { rows }
}

/// Build one prediction row per line observed in history, anchored on the
/// target delivery date. `active_promos` holds (store_id, sap) pairs under
/// promotion for the target window.
pub fn build_prediction_rows(
    orders: &[Order],
    corrections: &[CorrectionAggregate],
    target_date: NaiveDate,
    days_until_next: i64,
    active_promos: &HashSet<(String, String)>,
) -> Vec<FeatureRow> {
    let by_key = observations_by_key(orders);
    let corr_index = correction_index(corrections);

    let mut lead_times: Vec<f64> = by_key
        .values()
        .flatten()
        .filter_map(|obs| obs.lead_time_days)
        .collect();
    let median_lead = median(&mut lead_times).unwrap_or(2.0);

    let total_orders = orders.len().max(1) as f64;

    let mut rows = Vec::new();
    for (key, observations) in &by_key {
        let last = match observations.last() {
            Some(last) => last,
            None => continue,
        };
        let promo = active_promos.contains(key);
        let mut row = base_row(
            key,
            &last.store_name,
            target_date,
            days_until_next,
            median_lead,
            promo,
            &corr_index,
        );
        row.lag_1 = last.units;
        row.lag_2 = if observations.len() >= 2 {
            observations[observations.len() - 2].units
        } else {
            0.0
        };
        let window_start = observations.len().saturating_sub(ROLLING_WINDOW);
        let window = &observations[window_start..];
        row.rolling_mean_4 = if window.is_empty() {
            row.lag_1
        } else {
            window.iter().map(|o| o.units).sum::<f64>() / window.len() as f64
        };
        row.is_slow_mover =
            observations.len() as f64 / total_orders <= SLOW_MOVER_MAX_ORDER_RATE;
        row.days_since_last_order = (target_date - last.delivery_date).num_days().max(0) as f64;
        rows.push(row);
    }
    rows
}
