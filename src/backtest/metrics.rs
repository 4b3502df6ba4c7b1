//! Per-fold metric computation.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub type LineKey = (String, String);

/// (p10, p50, p90, confidence) for one predicted line.
pub type BandTuple = (f64, f64, f64, f64);

/// One evaluated fold: a single held-out delivery for a route/schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoldMetrics {
    pub route_number: String,
    pub schedule_key: String,
    pub target_delivery_date: NaiveDate,
    pub fold_index: u32,
    pub train_orders: u32,
    pub mode: String,
    pub training_scope: String,
    pub mode_reason: String,

    pub line_items_eval_count: u32,
    pub saps_eval_count: u32,

    pub line_mae_model: f64,
    pub line_mae_naive: f64,
    pub line_rmse_model: f64,
    pub line_rmse_naive: f64,
    pub line_wape_model: f64,
    pub line_wape_naive: f64,
    pub line_exact_match_rate_model: f64,
    pub line_exact_match_rate_naive: f64,
    pub line_edit_rate_proxy_model: f64,
    pub line_edit_rate_proxy_naive: f64,
    pub line_edit_magnitude_proxy_model: f64,
    pub line_edit_magnitude_proxy_naive: f64,

    pub line_band_coverage_10_90: f64,
    pub line_band_under_rate_10_90: f64,
    pub line_band_over_rate_10_90: f64,
    pub line_band_avg_width_units_10_90: f64,
    pub line_band_median_width_units_10_90: f64,

    pub order_zero_touch_model: u8,
    pub order_zero_touch_naive: u8,

    pub sap_case_match_rate_model: f64,
    pub sap_case_match_rate_naive: f64,
    pub sap_mae_model: f64,
    pub sap_mae_naive: f64,
    pub sap_wape_model: f64,
    pub sap_wape_naive: f64,

    pub order_total_units_actual: i64,
    pub order_total_units_model: i64,
    pub order_total_units_naive: i64,
    pub order_total_abs_error_model: f64,
    pub order_total_abs_error_naive: f64,
    pub order_total_wape_model: f64,
    pub order_total_wape_naive: f64,

    pub segment_slow_line_count: u32,
    pub segment_slow_line_wape_model: f64,
    pub segment_slow_over_rate_model: f64,
    pub segment_stale14_line_count: u32,
    pub segment_stale14_line_wape_model: f64,
    pub segment_stale14_over_rate_model: f64,
    pub segment_stale21_line_count: u32,
    pub segment_stale21_line_wape_model: f64,
    pub segment_stale21_over_rate_model: f64,
    pub segment_high_removal_line_count: u32,
    pub segment_high_removal_line_wape_model: f64,
    pub segment_high_removal_over_rate_model: f64,
}

/// Coverage/error stats for one (fold, source) group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceBreakdownRow {
    pub route_number: String,
    pub schedule_key: String,
    pub target_delivery_date: NaiveDate,
    pub fold_index: u32,
    pub train_orders: u32,
    pub source: String,
    pub line_count: u32,
    pub line_mae_units: f64,
    pub line_wape: f64,
    pub line_band_coverage_10_90: f64,
    pub line_band_under_rate_10_90: f64,
    pub line_band_over_rate_10_90: f64,
    pub line_band_avg_width_units_10_90: f64,
}

/// Per-line context carried into segment breakdowns.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineMeta {
    pub is_slow_mover: bool,
    pub days_since_last_order: f64,
    pub corr_removal_rate: f64,
}

pub fn wape(actual: &[f64], predicted: &[f64]) -> f64 {
    let denom: f64 = actual.iter().map(|v| v.abs()).sum();
    if denom <= 0.0 {
        return 0.0;
    }
    actual
        .iter()
        .zip(predicted)
        .map(|(a, p)| (a - p).abs())
        .sum::<f64>()
        / denom
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        values[mid]
    } else {
        (values[mid - 1] + values[mid]) / 2.0
    }
}

/// Round up to the next case multiple; used only for SAP-level case-match
/// metrics, not forecast emission.
fn round_up_to_case(units: i64, case_pack: Option<u32>) -> i64 {
    if units <= 0 {
        return 0;
    }
    match case_pack {
        Some(pack) if pack > 0 => {
            let pack = pack as i64;
            let remainder = units % pack;
            if remainder == 0 {
                units
            } else {
                units + pack - remainder
            }
        }
        _ => units,
    }
}

fn sap_totals(lines: &BTreeMap<LineKey, u32>) -> BTreeMap<String, i64> {
    let mut out = BTreeMap::new();
    for ((_, sap), units) in lines {
        *out.entry(sap.clone()).or_insert(0) += *units as i64;
    }
    out
}

fn band_for_key<'a>(
    key: &LineKey,
    pred_bands: &'a BTreeMap<LineKey, BandTuple>,
    cold_start_p90: &HashMap<String, u32>,
    fallback: f64,
) -> (f64, f64) {
    if let Some((p10, _p50, p90, _conf)) = pred_bands.get(key) {
        let lo = p10.min(*p90);
        let hi = p10.max(*p90);
        return (lo, hi);
    }
    match cold_start_p90.get(&key.1) {
        Some(p90) if *p90 > 0 => (0.0, *p90 as f64),
        _ => (fallback, fallback),
    }
}

pub struct FoldInputs<'a> {
    pub route_number: &'a str,
    pub schedule_key: &'a str,
    pub target_delivery_date: NaiveDate,
    pub fold_index: u32,
    pub train_orders: u32,
    pub predicted: &'a BTreeMap<LineKey, u32>,
    pub predicted_bands: &'a BTreeMap<LineKey, BandTuple>,
    pub sources: &'a BTreeMap<LineKey, String>,
    pub meta: &'a BTreeMap<LineKey, LineMeta>,
    pub naive: &'a BTreeMap<LineKey, u32>,
    pub actual: &'a BTreeMap<LineKey, u32>,
    pub case_packs: &'a HashMap<String, u32>,
    pub cold_start_p90: &'a HashMap<String, u32>,
}

/// Compute the full fold record. Returns None when there is nothing to
/// evaluate.
pub fn compute_fold_metrics(inputs: &FoldInputs<'_>) -> Option<FoldMetrics> {
    let keys: BTreeSet<LineKey> = inputs
        .actual
        .keys()
        .chain(inputs.predicted.keys())
        .chain(inputs.naive.keys())
        .cloned()
        .collect();
    if keys.is_empty() {
        return None;
    }

    let actual: Vec<f64> = keys
        .iter()
        .map(|k| *inputs.actual.get(k).unwrap_or(&0) as f64)
        .collect();
    let predicted: Vec<f64> = keys
        .iter()
        .map(|k| *inputs.predicted.get(k).unwrap_or(&0) as f64)
        .collect();
    let naive: Vec<f64> = keys
        .iter()
        .map(|k| *inputs.naive.get(k).unwrap_or(&0) as f64)
        .collect();

    let n = keys.len() as f64;

    let mae = |p: &[f64]| -> f64 {
        actual.iter().zip(p).map(|(a, v)| (a - v).abs()).sum::<f64>() / n
    };
    let rmse = |p: &[f64]| -> f64 {
        (actual
            .iter()
            .zip(p)
            .map(|(a, v)| (a - v) * (a - v))
            .sum::<f64>()
            / n)
            .sqrt()
    };

    let mut hits = Vec::with_capacity(keys.len());
    let mut under = Vec::with_capacity(keys.len());
    let mut over = Vec::with_capacity(keys.len());
    let mut widths = Vec::with_capacity(keys.len());
    for (key, a) in keys.iter().zip(&actual) {
        let fallback = *inputs.predicted.get(key).unwrap_or(&0) as f64;
        let (lo, hi) = band_for_key(key, inputs.predicted_bands, inputs.cold_start_p90, fallback);
        hits.push(((*a >= lo) && (*a <= hi)) as u8 as f64);
        under.push((*a < lo) as u8 as f64);
        over.push((*a > hi) as u8 as f64);
        widths.push((hi - lo).max(0.0));
    }

    let exact = |p: &[f64]| -> f64 {
        actual.iter().zip(p).filter(|(a, v)| a == v).count() as f64 / n
    };
    let edit_magnitude = |p: &[f64]| -> f64 {
        let edited: Vec<f64> = actual
            .iter()
            .zip(p)
            .map(|(a, v)| (a - v).abs())
            .filter(|d| *d > 0.0)
            .collect();
        mean(&edited)
    };

    // SAP-level totals with case-rounded predictions.
    let actual_sap = sap_totals(inputs.actual);
    let pred_sap = sap_totals(inputs.predicted);
    let naive_sap = sap_totals(inputs.naive);
    let all_saps: BTreeSet<String> = actual_sap
        .keys()
        .chain(pred_sap.keys())
        .chain(naive_sap.keys())
        .cloned()
        .collect();

    let mut sap_true = Vec::new();
    let mut sap_pred = Vec::new();
    let mut sap_naive = Vec::new();
    let mut case_match_model = 0usize;
    let mut case_match_naive = 0usize;
    for sap in &all_saps {
        let pack = inputs.case_packs.get(sap).copied();
        let a = *actual_sap.get(sap).unwrap_or(&0);
        let p = round_up_to_case(*pred_sap.get(sap).unwrap_or(&0), pack);
        let v = round_up_to_case(*naive_sap.get(sap).unwrap_or(&0), pack);
        sap_true.push(a as f64);
        sap_pred.push(p as f64);
        sap_naive.push(v as f64);
        if p == a {
            case_match_model += 1;
        }
        if v == a {
            case_match_naive += 1;
        }
    }

    let sap_count = all_saps.len().max(1) as f64;
    let sap_mae = |p: &[f64]| -> f64 {
        sap_true
            .iter()
            .zip(p)
            .map(|(a, v)| (a - v).abs())
            .sum::<f64>()
            / sap_count
    };

    let order_actual: i64 = sap_true.iter().sum::<f64>() as i64;
    let order_pred: i64 = sap_pred.iter().sum::<f64>() as i64;
    let order_naive: i64 = sap_naive.iter().sum::<f64>() as i64;
    let order_err_model = (order_pred - order_actual).abs() as f64;
    let order_err_naive = (order_naive - order_actual).abs() as f64;
    let order_wape = |err: f64| -> f64 {
        if order_actual > 0 {
            err / order_actual as f64
        } else {
            0.0
        }
    };

    let segment = |selector: &dyn Fn(&LineKey) -> bool| -> (u32, f64, f64) {
        let seg: Vec<usize> = keys
            .iter()
            .enumerate()
            .filter(|(_, k)| selector(k))
            .map(|(i, _)| i)
            .collect();
        if seg.is_empty() {
            return (0, 0.0, 0.0);
        }
        let a: Vec<f64> = seg.iter().map(|&i| actual[i]).collect();
        let p: Vec<f64> = seg.iter().map(|&i| predicted[i]).collect();
        let over_rate =
            seg.iter().filter(|&&i| predicted[i] > actual[i]).count() as f64 / seg.len() as f64;
        (seg.len() as u32, wape(&a, &p), over_rate)
    };

    let default_meta = LineMeta::default();
    let meta_of = |k: &LineKey| *inputs.meta.get(k).unwrap_or(&default_meta);
    let source_of = |k: &LineKey| {
        inputs
            .sources
            .get(k)
            .map(String::as_str)
            .unwrap_or("missing_pred")
    };

    let slow = segment(&|k| source_of(k) == "slow_intermittent" || meta_of(k).is_slow_mover);
    let stale14 = segment(&|k| meta_of(k).days_since_last_order >= 14.0);
    let stale21 = segment(&|k| meta_of(k).days_since_last_order >= 21.0);
    let high_removal = segment(&|k| meta_of(k).corr_removal_rate >= 0.50);

    let zero_touch_model = actual.iter().zip(&predicted).all(|(a, p)| a == p);
    let zero_touch_naive = actual.iter().zip(&naive).all(|(a, p)| a == p);

    Some(FoldMetrics {
        route_number: inputs.route_number.to_string(),
        schedule_key: inputs.schedule_key.to_string(),
        target_delivery_date: inputs.target_delivery_date,
        fold_index: inputs.fold_index,
        train_orders: inputs.train_orders,
        mode: String::new(),
        training_scope: String::new(),
        mode_reason: String::new(),
        line_items_eval_count: keys.len() as u32,
        saps_eval_count: all_saps.len() as u32,
        line_mae_model: mae(&predicted),
        line_mae_naive: mae(&naive),
        line_rmse_model: rmse(&predicted),
        line_rmse_naive: rmse(&naive),
        line_wape_model: wape(&actual, &predicted),
        line_wape_naive: wape(&actual, &naive),
        line_exact_match_rate_model: exact(&predicted),
        line_exact_match_rate_naive: exact(&naive),
        line_edit_rate_proxy_model: 1.0 - exact(&predicted),
        line_edit_rate_proxy_naive: 1.0 - exact(&naive),
        line_edit_magnitude_proxy_model: edit_magnitude(&predicted),
        line_edit_magnitude_proxy_naive: edit_magnitude(&naive),
        line_band_coverage_10_90: mean(&hits),
        line_band_under_rate_10_90: mean(&under),
        line_band_over_rate_10_90: mean(&over),
        line_band_avg_width_units_10_90: mean(&widths),
        line_band_median_width_units_10_90: median(&mut widths.clone()),
        order_zero_touch_model: zero_touch_model as u8,
        order_zero_touch_naive: zero_touch_naive as u8,
        sap_case_match_rate_model: case_match_model as f64 / sap_count,
        sap_case_match_rate_naive: case_match_naive as f64 / sap_count,
        sap_mae_model: sap_mae(&sap_pred),
        sap_mae_naive: sap_mae(&sap_naive),
        sap_wape_model: wape(&sap_true, &sap_pred),
        sap_wape_naive: wape(&sap_true, &sap_naive),
        order_total_units_actual: order_actual,
        order_total_units_model: order_pred,
        order_total_units_naive: order_naive,
        order_total_abs_error_model: order_err_model,
        order_total_abs_error_naive: order_err_naive,
        order_total_wape_model: order_wape(order_err_model),
        order_total_wape_naive: order_wape(order_err_naive),
        segment_slow_line_count: slow.0,
        segment_slow_line_wape_model: slow.1,
        segment_slow_over_rate_model: slow.2,
        segment_stale14_line_count: stale14.0,
        segment_stale14_line_wape_model: stale14.1,
        segment_stale14_over_rate_model: stale14.2,
        segment_stale21_line_count: stale21.0,
        segment_stale21_line_wape_model: stale21.1,
        segment_stale21_over_rate_model: stale21.2,
        segment_high_removal_line_count: high_removal.0,
        segment_high_removal_line_wape_model: high_removal.1,
        segment_high_removal_over_rate_model: high_removal.2,
    })
}

/// Group a fold's lines by source tag and emit coverage/error rows. Lines
/// without a prediction fall into a synthetic `missing_pred` group that is
/// excluded from the emitted rows.
pub fn compute_source_breakdown(inputs: &FoldInputs<'_>) -> Vec<SourceBreakdownRow> {
    let keys: BTreeSet<LineKey> = inputs
        .actual
        .keys()
        .chain(inputs.predicted.keys())
        .cloned()
        .collect();
    if keys.is_empty() {
        return Vec::new();
    }

    #[derive(Default)]
    struct Group {
        line_count: f64,
        sum_abs_error: f64,
        sum_actual: f64,
        sum_width: f64,
        hits: f64,
        under: f64,
        over: f64,
    }

    let mut grouped: BTreeMap<String, Group> = BTreeMap::new();
    for key in &keys {
        let source = inputs
            .sources
            .get(key)
            .cloned()
            .unwrap_or_else(|| "missing_pred".to_string());
        let a = *inputs.actual.get(key).unwrap_or(&0) as f64;
        let p = *inputs.predicted.get(key).unwrap_or(&0) as f64;
        let (lo, hi) = band_for_key(key, inputs.predicted_bands, inputs.cold_start_p90, p);

        let group = grouped.entry(source).or_default();
        group.line_count += 1.0;
        group.sum_abs_error += (p - a).abs();
        group.sum_actual += a.abs();
        group.sum_width += (hi - lo).max(0.0);
        group.hits += ((a >= lo) && (a <= hi)) as u8 as f64;
        group.under += (a < lo) as u8 as f64;
        group.over += (a > hi) as u8 as f64;
    }

    grouped
        .into_iter()
        .filter(|(source, group)| source != "missing_pred" && group.line_count > 0.0)
        .map(|(source, group)| SourceBreakdownRow {
            route_number: inputs.route_number.to_string(),
            schedule_key: inputs.schedule_key.to_string(),
            target_delivery_date: inputs.target_delivery_date,
            fold_index: inputs.fold_index,
            train_orders: inputs.train_orders,
            source,
            line_count: group.line_count as u32,
            line_mae_units: group.sum_abs_error / group.line_count,
            line_wape: if group.sum_actual > 0.0 {
                group.sum_abs_error / group.sum_actual
            } else {
                0.0
            },
            line_band_coverage_10_90: group.hits / group.line_count,
            line_band_under_rate_10_90: group.under / group.line_count,
            line_band_over_rate_10_90: group.over / group.line_count,
            line_band_avg_width_units_10_90: group.sum_width / group.line_count,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(store: &str, sap: &str) -> LineKey {
        (store.to_string(), sap.to_string())
    }

    fn d() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 30).unwrap()
    }

    #[test]
    fn wape_basics() {
        assert_eq!(wape(&[10.0, 10.0], &[10.0, 10.0]), 0.0);
        assert_eq!(wape(&[10.0, 10.0], &[5.0, 15.0]), 0.5);
        assert_eq!(wape(&[], &[]), 0.0);
    }

    #[test]
    fn fold_metrics_counts_and_coverage() {
        let mut actual = BTreeMap::new();
        actual.insert(key("s1", "100"), 10u32);
        actual.insert(key("s1", "200"), 4u32);

        let mut predicted = BTreeMap::new();
        predicted.insert(key("s1", "100"), 10u32);
        predicted.insert(key("s1", "200"), 6u32);

        let mut bands = BTreeMap::new();
        bands.insert(key("s1", "100"), (8.0, 10.0, 12.0, 0.8));
        bands.insert(key("s1", "200"), (5.0, 6.0, 8.0, 0.8));

        let naive = predicted.clone();
        let sources: BTreeMap<LineKey, String> = predicted
            .keys()
            .map(|k| (k.clone(), "schedule_aware".to_string()))
            .collect();

        let inputs = FoldInputs {
            route_number: "989262",
            schedule_key: "monday",
            target_delivery_date: d(),
            fold_index: 1,
            train_orders: 8,
            predicted: &predicted,
            predicted_bands: &bands,
            sources: &sources,
            meta: &BTreeMap::new(),
            naive: &naive,
            actual: &actual,
            case_packs: &HashMap::new(),
            cold_start_p90: &HashMap::new(),
        };

        let metrics = compute_fold_metrics(&inputs).unwrap();
        assert_eq!(metrics.line_items_eval_count, 2);
        // 10 in [8,12]; 4 below [5,8].
        assert_eq!(metrics.line_band_coverage_10_90, 0.5);
        assert_eq!(metrics.line_band_under_rate_10_90, 0.5);
        assert_eq!(metrics.line_exact_match_rate_model, 0.5);
        assert_eq!(metrics.order_zero_touch_model, 0);
    }

    #[test]
    fn zero_touch_when_all_lines_match() {
        let mut actual = BTreeMap::new();
        actual.insert(key("s1", "100"), 10u32);
        let predicted = actual.clone();
        let naive = actual.clone();

        let inputs = FoldInputs {
            route_number: "989262",
            schedule_key: "monday",
            target_delivery_date: d(),
            fold_index: 1,
            train_orders: 8,
            predicted: &predicted,
            predicted_bands: &BTreeMap::new(),
            sources: &BTreeMap::new(),
            meta: &BTreeMap::new(),
            naive: &naive,
            actual: &actual,
            case_packs: &HashMap::new(),
            cold_start_p90: &HashMap::new(),
        };
        let metrics = compute_fold_metrics(&inputs).unwrap();
        assert_eq!(metrics.order_zero_touch_model, 1);
        assert_eq!(metrics.order_zero_touch_naive, 1);
    }

    #[test]
    fn cold_start_band_fallback_is_used_for_missing_pred() {
        let mut actual = BTreeMap::new();
        actual.insert(key("s1", "100"), 5u32);

        let mut cold = HashMap::new();
        cold.insert("100".to_string(), 8u32);

        let inputs = FoldInputs {
            route_number: "989262",
            schedule_key: "monday",
            target_delivery_date: d(),
            fold_index: 1,
            train_orders: 8,
            predicted: &BTreeMap::new(),
            predicted_bands: &BTreeMap::new(),
            sources: &BTreeMap::new(),
            meta: &BTreeMap::new(),
            naive: &BTreeMap::new(),
            actual: &actual,
            case_packs: &HashMap::new(),
            cold_start_p90: &cold,
        };
        let metrics = compute_fold_metrics(&inputs).unwrap();
        // 5 lies inside [0, 8].
        assert_eq!(metrics.line_band_coverage_10_90, 1.0);
    }

    #[test]
    fn source_breakdown_excludes_the_missing_pred_group() {
        let mut actual = BTreeMap::new();
        actual.insert(key("s1", "100"), 10u32);
        // This line has no prediction and would land in `missing_pred`.
        actual.insert(key("s1", "200"), 4u32);

        let mut predicted = BTreeMap::new();
        predicted.insert(key("s1", "100"), 10u32);

        let mut sources = BTreeMap::new();
        sources.insert(key("s1", "100"), "schedule_aware".to_string());

        let inputs = FoldInputs {
            route_number: "989262",
            schedule_key: "monday",
            target_delivery_date: d(),
            fold_index: 1,
            train_orders: 8,
            predicted: &predicted,
            predicted_bands: &BTreeMap::new(),
            sources: &sources,
            meta: &BTreeMap::new(),
            naive: &BTreeMap::new(),
            actual: &actual,
            case_packs: &HashMap::new(),
            cold_start_p90: &HashMap::new(),
        };
        let rows = compute_source_breakdown(&inputs);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].source, "schedule_aware");
        assert_eq!(rows[0].line_count, 1);
    }
}
