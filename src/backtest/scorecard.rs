//! Scorecard aggregation: fold rows grouped by (route, schedule).

use serde::{Deserialize, Serialize};

use super::metrics::FoldMetrics;

/// Aggregated quality summary for one (route, schedule).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scorecard {
    pub route_number: String,
    pub schedule_key: String,
    pub fold_count: u32,

    pub mean_line_mae_model: f64,
    pub mean_line_mae_naive: f64,
    pub line_mae_improvement_pct: f64,
    pub mean_line_wape_model: f64,
    pub mean_line_wape_naive: f64,

    pub mean_sap_case_match_rate_model: f64,
    pub mean_sap_case_match_rate_naive: f64,
    pub mean_sap_wape_model: f64,
    pub mean_sap_wape_naive: f64,
    pub sap_wape_improvement_pct: f64,

    pub mean_order_total_wape_model: f64,
    pub mean_order_total_wape_naive: f64,
    pub order_wape_improvement_pct: f64,

    pub mean_line_edit_rate_proxy_model: f64,
    pub mean_line_edit_rate_proxy_naive: f64,
    pub mean_line_edit_magnitude_proxy_model: f64,
    pub mean_line_edit_magnitude_proxy_naive: f64,

    pub mean_line_band_coverage_10_90: f64,
    pub mean_line_band_under_rate_10_90: f64,
    pub mean_line_band_over_rate_10_90: f64,
    pub mean_line_band_avg_width_units_10_90: f64,
    pub mean_line_band_median_width_units_10_90: f64,

    pub order_zero_touch_rate_model: f64,
    pub order_zero_touch_rate_naive: f64,

    pub mean_segment_slow_line_wape_model: f64,
    pub mean_segment_slow_over_rate_model: f64,
    pub mean_segment_stale14_line_wape_model: f64,
    pub mean_segment_stale14_over_rate_model: f64,
    pub mean_segment_stale21_line_wape_model: f64,
    pub mean_segment_stale21_over_rate_model: f64,
    pub mean_segment_high_removal_line_wape_model: f64,
    pub mean_segment_high_removal_over_rate_model: f64,

    pub observed_correction_line_rate_proxy: f64,
    pub observed_corrected_order_rate_proxy: f64,
    pub observed_avg_abs_correction_delta: f64,
}

/// Improvement of the model over the naive baseline, in percent of the
/// naive value.
pub fn improvement_pct(model_value: f64, naive_value: f64) -> f64 {
    if naive_value == 0.0 {
        0.0
    } else {
        (naive_value - model_value) / naive_value.abs() * 100.0
    }
}

/// Mean of `values` weighted by `weights`; plain mean when the weights sum
/// to zero.
pub fn weighted_mean(values: &[f64], weights: &[f64]) -> f64 {
    let weight_sum: f64 = weights.iter().sum();
    if weight_sum > 0.0 {
        values
            .iter()
            .zip(weights)
            .map(|(v, w)| v * w)
            .sum::<f64>()
            / weight_sum
    } else if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Observed correction rates joined into the scorecard for one schedule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorrectionProxy {
    pub schedule_key: String,
    pub correction_line_rate: f64,
    pub corrected_order_rate: f64,
    pub avg_abs_correction_delta: f64,
}

/// Aggregate fold rows into per (route, schedule) scorecards.
pub fn summarize_scorecard(folds: &[FoldMetrics], proxies: &[CorrectionProxy]) -> Vec<Scorecard> {
    let mut groups: Vec<(String, String)> = folds
        .iter()
        .map(|f| (f.route_number.clone(), f.schedule_key.clone()))
        .collect();
    groups.sort();
    groups.dedup();

    groups
        .into_iter()
        .map(|(route, schedule)| {
            let group: Vec<&FoldMetrics> = folds
                .iter()
                .filter(|f| f.route_number == route && f.schedule_key == schedule)
                .collect();
            let mean = |f: &dyn Fn(&FoldMetrics) -> f64| -> f64 {
                group.iter().map(|row| f(row)).sum::<f64>() / group.len().max(1) as f64
            };

            let line_mae_model = mean(&|f| f.line_mae_model);
            let line_mae_naive = mean(&|f| f.line_mae_naive);
            let sap_wape_model = mean(&|f| f.sap_wape_model);
            let sap_wape_naive = mean(&|f| f.sap_wape_naive);
            let order_wape_model = mean(&|f| f.order_total_wape_model);
            let order_wape_naive = mean(&|f| f.order_total_wape_naive);

            let proxy = proxies
                .iter()
                .find(|p| p.schedule_key == schedule)
                .cloned()
                .unwrap_or_default();

            Scorecard {
                route_number: route,
                schedule_key: schedule,
                fold_count: group.len() as u32,
                mean_line_mae_model: line_mae_model,
                mean_line_mae_naive: line_mae_naive,
                line_mae_improvement_pct: improvement_pct(line_mae_model, line_mae_naive),
                mean_line_wape_model: mean(&|f| f.line_wape_model),
                mean_line_wape_naive: mean(&|f| f.line_wape_naive),
                mean_sap_case_match_rate_model: mean(&|f| f.sap_case_match_rate_model),
                mean_sap_case_match_rate_naive: mean(&|f| f.sap_case_match_rate_naive),
                mean_sap_wape_model: sap_wape_model,
                mean_sap_wape_naive: sap_wape_naive,
                sap_wape_improvement_pct: improvement_pct(sap_wape_model, sap_wape_naive),
                mean_order_total_wape_model: order_wape_model,
                mean_order_total_wape_naive: order_wape_naive,
                order_wape_improvement_pct: improvement_pct(order_wape_model, order_wape_naive),
                mean_line_edit_rate_proxy_model: mean(&|f| f.line_edit_rate_proxy_model),
                mean_line_edit_rate_proxy_naive: mean(&|f| f.line_edit_rate_proxy_naive),
                mean_line_edit_magnitude_proxy_model: mean(&|f| {
                    f.line_edit_magnitude_proxy_model
                }),
                mean_line_edit_magnitude_proxy_naive: mean(&|f| {
                    f.line_edit_magnitude_proxy_naive
                }),
                mean_line_band_coverage_10_90: mean(&|f| f.line_band_coverage_10_90),
                mean_line_band_under_rate_10_90: mean(&|f| f.line_band_under_rate_10_90),
                mean_line_band_over_rate_10_90: mean(&|f| f.line_band_over_rate_10_90),
                mean_line_band_avg_width_units_10_90: mean(&|f| {
                    f.line_band_avg_width_units_10_90
                }),
                mean_line_band_median_width_units_10_90: mean(&|f| {
                    f.line_band_median_width_units_10_90
                }),
                order_zero_touch_rate_model: mean(&|f| f.order_zero_touch_model as f64),
                order_zero_touch_rate_naive: mean(&|f| f.order_zero_touch_naive as f64),
                mean_segment_slow_line_wape_model: mean(&|f| f.segment_slow_line_wape_model),
                mean_segment_slow_over_rate_model: mean(&|f| f.segment_slow_over_rate_model),
                mean_segment_stale14_line_wape_model: mean(&|f| {
                    f.segment_stale14_line_wape_model
                }),
                mean_segment_stale14_over_rate_model: mean(&|f| {
                    f.segment_stale14_over_rate_model
                }),
                mean_segment_stale21_line_wape_model: mean(&|f| {
                    f.segment_stale21_line_wape_model
                }),
                mean_segment_stale21_over_rate_model: mean(&|f| {
                    f.segment_stale21_over_rate_model
                }),
                mean_segment_high_removal_line_wape_model: mean(&|f| {
                    f.segment_high_removal_line_wape_model
                }),
                mean_segment_high_removal_over_rate_model: mean(&|f| {
                    f.segment_high_removal_over_rate_model
                }),
                observed_correction_line_rate_proxy: proxy.correction_line_rate,
                observed_corrected_order_rate_proxy: proxy.corrected_order_rate,
                observed_avg_abs_correction_delta: proxy.avg_abs_correction_delta,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn improvement_pct_handles_zero_naive() {
        assert_eq!(improvement_pct(1.0, 0.0), 0.0);
        assert_eq!(improvement_pct(1.0, 2.0), 50.0);
        assert_eq!(improvement_pct(3.0, 2.0), -50.0);
    }

    #[test]
    fn weighted_mean_weights_by_fold_count() {
        let values = [0.9, 0.5];
        let weights = [3.0, 1.0];
        assert!((weighted_mean(&values, &weights) - 0.8).abs() < 1e-9);
        // Zero weights fall back to the plain mean.
        assert!((weighted_mean(&values, &[0.0, 0.0]) - 0.7).abs() < 1e-9);
    }
}
