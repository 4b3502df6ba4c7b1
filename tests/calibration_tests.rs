//! Band calibrator tests: update laws, persistence, cadence, and the
//! per-source pass.

mod helpers;

use std::sync::Arc;

use chrono::Duration;
use pretty_assertions::assert_eq;
use proptest::prelude::*;

use helpers::builders::{date, fixed_now, ROUTE};
use helpers::stores::MemoryOrderStore;
use routespark::backtest::{FoldMetrics, SourceBreakdownRow};
use routespark::calibration::{
    compute_center_update, compute_scale_update, BandCalibrator, CalibrationOutcome,
    CalibratorSettings,
};
use routespark::clock::FixedClock;
use routespark::config::BandConfig;
use routespark::storage::CalibrationStore;

fn settings() -> CalibratorSettings {
    let mut settings = CalibratorSettings::from(&BandConfig::default());
    // Small fixtures: lower the line minimums so updates actually run.
    settings.min_lines = 10;
    settings.source_min_lines = 10;
    settings
}

fn fold(schedule: &str, lines: u32, coverage: f64, under: f64, over: f64, width: f64) -> FoldMetrics {
    FoldMetrics {
        route_number: ROUTE.to_string(),
        schedule_key: schedule.to_string(),
        target_delivery_date: date(2025, 1, 30),
        fold_index: 1,
        train_orders: 8,
        mode: "schedule_aware".to_string(),
        training_scope: "schedule_only".to_string(),
        mode_reason: "adaptive_depth_insufficient".to_string(),
        line_items_eval_count: lines,
        saps_eval_count: lines,
        line_mae_model: 1.0,
        line_mae_naive: 1.5,
        line_rmse_model: 1.4,
        line_rmse_naive: 2.0,
        line_wape_model: 0.2,
        line_wape_naive: 0.3,
        line_exact_match_rate_model: 0.5,
        line_exact_match_rate_naive: 0.4,
        line_edit_rate_proxy_model: 0.5,
        line_edit_rate_proxy_naive: 0.6,
        line_edit_magnitude_proxy_model: 2.0,
        line_edit_magnitude_proxy_naive: 3.0,
        line_band_coverage_10_90: coverage,
        line_band_under_rate_10_90: under,
        line_band_over_rate_10_90: over,
        line_band_avg_width_units_10_90: width,
        line_band_median_width_units_10_90: width,
        order_zero_touch_model: 0,
        order_zero_touch_naive: 0,
        sap_case_match_rate_model: 0.5,
        sap_case_match_rate_naive: 0.4,
        sap_mae_model: 1.0,
        sap_mae_naive: 1.5,
        sap_wape_model: 0.2,
        sap_wape_naive: 0.3,
        order_total_units_actual: 100,
        order_total_units_model: 105,
        order_total_units_naive: 110,
        order_total_abs_error_model: 5.0,
        order_total_abs_error_naive: 10.0,
        order_total_wape_model: 0.05,
        order_total_wape_naive: 0.10,
        segment_slow_line_count: 0,
        segment_slow_line_wape_model: 0.0,
        segment_slow_over_rate_model: 0.0,
        segment_stale14_line_count: 0,
        segment_stale14_line_wape_model: 0.0,
        segment_stale14_over_rate_model: 0.0,
        segment_stale21_line_count: 0,
        segment_stale21_line_wape_model: 0.0,
        segment_stale21_over_rate_model: 0.0,
        segment_high_removal_line_count: 0,
        segment_high_removal_line_wape_model: 0.0,
        segment_high_removal_over_rate_model: 0.0,
    }
}

fn source_row(schedule: &str, source: &str, lines: u32, coverage: f64) -> SourceBreakdownRow {
    SourceBreakdownRow {
        route_number: ROUTE.to_string(),
        schedule_key: schedule.to_string(),
        target_delivery_date: date(2025, 1, 30),
        fold_index: 1,
        train_orders: 8,
        source: source.to_string(),
        line_count: lines,
        line_mae_units: 1.0,
        line_wape: 0.2,
        line_band_coverage_10_90: coverage,
        line_band_under_rate_10_90: (1.0 - coverage) / 2.0,
        line_band_over_rate_10_90: (1.0 - coverage) / 2.0,
        line_band_avg_width_units_10_90: 6.0,
    }
}

// === Update laws ===

#[test]
fn observed_coverage_at_target_is_a_fixpoint() {
    for scale in [0.6, 1.0, 2.5, 7.9] {
        let next = compute_scale_update(scale, 0.80, 0.80, 0.5, 8.0, 1.0);
        assert!((next - scale).abs() < 1e-9, "scale {scale} moved to {next}");
    }
}

#[test]
fn known_convergence_step() {
    // Coverage 0.60 against target 0.80 from scale 1.0 lands near 1.523.
    let next = compute_scale_update(1.0, 0.60, 0.80, 0.5, 8.0, 1.0);
    assert!((next - 1.523).abs() < 0.01, "got {next}");
}

#[test]
fn balanced_rates_leave_center_unchanged() {
    assert_eq!(
        compute_center_update(3.0, 0.12, 0.12, 10.0, 1.0, 12.0, 64.0),
        3.0
    );
}

proptest! {
    #[test]
    fn scale_always_lands_inside_bounds(
        old_scale in 0.5f64..8.0,
        observed in 0.0f64..1.0,
        target in 0.0f64..1.0,
        damping in 0.1f64..1.0,
    ) {
        let next = compute_scale_update(old_scale, observed, target, 0.5, 8.0, damping);
        prop_assert!((0.5..=8.0).contains(&next));
    }

    #[test]
    fn center_respects_step_and_absolute_caps(
        old_center in -64.0f64..64.0,
        under in 0.0f64..1.0,
        over in 0.0f64..1.0,
        width in 0.0f64..200.0,
    ) {
        let next = compute_center_update(old_center, under, over, width, 1.0, 12.0, 64.0);
        prop_assert!((next - old_center).abs() <= 12.0 + 1e-9);
        prop_assert!((-64.0..=64.0).contains(&next));
    }
}

// === Calibrator persistence ===

#[tokio::test]
async fn calibration_persists_schedule_and_center_rows() {
    let store = Arc::new(MemoryOrderStore::new(fixed_now()));
    let clock = Arc::new(FixedClock::new(fixed_now()));
    let calibrator = BandCalibrator::new(store.clone(), clock, settings());

    let folds = vec![
        fold("monday", 120, 0.60, 0.30, 0.10, 8.0),
        fold("monday", 120, 0.60, 0.30, 0.10, 8.0),
    ];
    let outcome = calibrator
        .calibrate_route(ROUTE, &folds, &[])
        .await
        .unwrap();

    let CalibrationOutcome::Updated { schedules } = outcome else {
        panic!("expected an update");
    };
    assert_eq!(schedules.len(), 1);
    assert!(schedules[0].updated);
    assert!((schedules[0].new_scale - 1.523).abs() < 0.01);
    // Under-coverage skew is negative (more under than over): center down.
    assert!(schedules[0].new_center_offset_units < 0.0);

    let row = store
        .band_calibration_get(ROUTE, "monday", "p10_p90")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.sample_lines, Some(240));
    assert_eq!(row.fold_count, Some(2));
    assert!((row.band_scale - schedules[0].new_scale).abs() < 1e-9);

    let center = store
        .center_calibration_get(ROUTE, "monday", "p10_p90")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        center.center_offset_units,
        schedules[0].new_center_offset_units
    );
}

#[tokio::test]
async fn thin_schedules_are_reported_but_unchanged() {
    let store = Arc::new(MemoryOrderStore::new(fixed_now()));
    let clock = Arc::new(FixedClock::new(fixed_now()));
    let calibrator = BandCalibrator::new(store.clone(), clock, settings());

    let folds = vec![fold("monday", 4, 0.50, 0.40, 0.10, 8.0)];
    let CalibrationOutcome::Updated { schedules } = calibrator
        .calibrate_route(ROUTE, &folds, &[])
        .await
        .unwrap()
    else {
        panic!("expected a report");
    };
    assert!(!schedules[0].updated);
    assert_eq!(schedules[0].new_scale, schedules[0].old_scale);
    assert!(store
        .band_calibration_get(ROUTE, "monday", "p10_p90")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn weekly_cadence_skips_recent_runs() {
    let store = Arc::new(MemoryOrderStore::new(fixed_now()));
    let clock = Arc::new(FixedClock::new(fixed_now()));
    let calibrator = BandCalibrator::new(store.clone(), clock.clone(), settings());

    let folds = vec![fold("monday", 120, 0.70, 0.20, 0.10, 8.0)];
    calibrator
        .calibrate_route_if_due(ROUTE, &folds, &[])
        .await
        .unwrap();

    // Two days later the cadence gate holds.
    clock.advance(Duration::days(2));
    let outcome = calibrator
        .calibrate_route_if_due(ROUTE, &folds, &[])
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        CalibrationOutcome::SkippedRecent { .. }
    ));
    assert!(!calibrator.is_due(ROUTE).await.unwrap());

    // Past the weekly threshold it runs again.
    clock.advance(Duration::days(6));
    assert!(calibrator.is_due(ROUTE).await.unwrap());
    let outcome = calibrator
        .calibrate_route_if_due(ROUTE, &folds, &[])
        .await
        .unwrap();
    assert!(matches!(outcome, CalibrationOutcome::Updated { .. }));
}

#[tokio::test]
async fn source_pass_writes_rows_and_skips_missing_pred() {
    let store = Arc::new(MemoryOrderStore::new(fixed_now()));
    let clock = Arc::new(FixedClock::new(fixed_now()));
    let calibrator = BandCalibrator::new(store.clone(), clock, settings());

    let folds = vec![fold("monday", 120, 0.60, 0.30, 0.10, 8.0)];
    let sources = vec![
        source_row("monday", "schedule_aware", 80, 0.65),
        source_row("monday", "slow_intermittent", 40, 0.50),
        source_row("monday", "missing_pred", 500, 0.10),
    ];
    calibrator
        .calibrate_route(ROUTE, &folds, &sources)
        .await
        .unwrap();

    let rows = store
        .source_calibrations(ROUTE, "monday", "p10_p90")
        .await
        .unwrap();
    let names: Vec<&str> = rows.iter().map(|r| r.source.as_str()).collect();
    assert!(names.contains(&"schedule_aware"));
    assert!(names.contains(&"slow_intermittent"));
    assert!(!names.contains(&"missing_pred"));

    // The worse-covered source widens more; source bounds cap at 4.0.
    let slow = rows.iter().find(|r| r.source == "slow_intermittent").unwrap();
    let schedule_aware = rows.iter().find(|r| r.source == "schedule_aware").unwrap();
    assert!(slow.band_scale_mult > schedule_aware.band_scale_mult);
    assert!(slow.band_scale_mult <= 4.0);
}

#[tokio::test]
async fn no_folds_is_no_data() {
    let store = Arc::new(MemoryOrderStore::new(fixed_now()));
    let clock = Arc::new(FixedClock::new(fixed_now()));
    let calibrator = BandCalibrator::new(store, clock, settings());
    let outcome = calibrator.calibrate_route(ROUTE, &[], &[]).await.unwrap();
    assert_eq!(outcome, CalibrationOutcome::NoData);
}
