//! Walk-forward backtester tests: fold generation, scorecards, and the
//! learning snapshot refresh cycle.

mod helpers;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Duration;
use pretty_assertions::assert_eq;
use tempfile::tempdir;

use helpers::builders::{date, fixed_now, two_cycle_route, weekly_orders, CorrectionBuilder, ROUTE};
use helpers::stores::MemoryOrderStore;
use routespark::backtest::{
    refresh_learning_snapshots, summarize_scorecard, Backtester, SnapshotRefreshOutcome,
};
use routespark::clock::FixedClock;
use routespark::config::{BacktestConfig, BandConfig, ForecastConfig};
use routespark::domain::RefreshStatus;
use routespark::storage::OrderStore;

fn backtest_config(output_dir: &std::path::Path) -> BacktestConfig {
    BacktestConfig {
        min_train_orders: 4,
        max_folds: 0,
        temporal_corrections: true,
        store_centric_context: true,
        output_dir: output_dir.display().to_string(),
        refresh_min_days_between_runs: 7,
    }
}

fn fixture(output_dir: &std::path::Path) -> (Arc<MemoryOrderStore>, Arc<FixedClock>, Backtester) {
    let store = Arc::new(MemoryOrderStore::new(fixed_now()));
    store.set_cycles(ROUTE, two_cycle_route());
    store.set_synced_routes(vec![ROUTE.to_string()]);
    let clock = Arc::new(FixedClock::new(fixed_now()));
    let backtester = Backtester::new(
        store.clone(),
        store.clone(),
        clock.clone(),
        ForecastConfig::default(),
        BandConfig::default(),
        backtest_config(output_dir),
    );
    (store, clock, backtester)
}

fn seed_history(store: &MemoryOrderStore, weeks: usize) {
    store.add_orders(weekly_orders(
        weeks,
        date(2024, 9, 5),
        "monday",
        "s1",
        "31032",
        12,
    ));
    store.add_corrections(
        (0..5)
            .map(|i| {
                CorrectionBuilder::new(&format!("o_monday_{i}"), date(2024, 10, 3))
                    .units(10.0, 12.0)
                    .submitted_at(fixed_now() - Duration::days(90))
                    .build()
            })
            .collect(),
    );
}

#[tokio::test]
async fn folds_cover_every_order_past_the_minimum() {
    let dir = tempdir().unwrap();
    let (store, _clock, backtester) = fixture(dir.path());
    seed_history(&store, 12);

    let run = backtester.run(&[ROUTE.to_string()]).await.unwrap();
    // 12 orders, min_train_orders = 4: folds at indices 4..11.
    assert_eq!(run.folds.len(), 8);
    for (i, fold) in run.folds.iter().enumerate() {
        assert_eq!(fold.fold_index, i as u32 + 1);
        assert_eq!(fold.schedule_key, "monday");
        assert!(fold.train_orders >= 4);
        assert!(fold.line_items_eval_count > 0);
    }
    // Folds are strictly chronological.
    let dates: Vec<_> = run.folds.iter().map(|f| f.target_delivery_date).collect();
    let mut sorted = dates.clone();
    sorted.sort();
    assert_eq!(dates, sorted);
}

#[tokio::test]
async fn max_folds_caps_evaluation() {
    let dir = tempdir().unwrap();
    let (store, clock, _unused) = fixture(dir.path());
    seed_history(&store, 12);
    let mut config = backtest_config(dir.path());
    config.max_folds = 3;
    let backtester = Backtester::new(
        store.clone(),
        store.clone(),
        clock,
        ForecastConfig::default(),
        BandConfig::default(),
        config,
    );

    let run = backtester.run(&[ROUTE.to_string()]).await.unwrap();
    assert_eq!(run.folds.len(), 3);
}

#[tokio::test]
async fn cold_start_folds_use_last_order_anchor() {
    let dir = tempdir().unwrap();
    let (store, _clock, backtester) = fixture(dir.path());
    // History but no corrections: the selector stays in copy-last-order.
    store.add_orders(weekly_orders(
        10,
        date(2024, 11, 7),
        "monday",
        "s1",
        "31032",
        12,
    ));

    let run = backtester.run(&[ROUTE.to_string()]).await.unwrap();
    assert!(!run.folds.is_empty());
    for fold in &run.folds {
        assert_eq!(fold.mode, "copy_last_order");
        assert!(fold.mode_reason.starts_with("cold_start:"));
    }
    for row in &run.sources {
        assert_eq!(row.source, "last_order_anchor");
    }
}

#[tokio::test]
async fn scorecard_groups_by_route_and_schedule() {
    let dir = tempdir().unwrap();
    let (store, _clock, backtester) = fixture(dir.path());
    seed_history(&store, 12);
    store.add_orders(weekly_orders(
        8,
        date(2024, 9, 9),
        "tuesday",
        "s1",
        "40100",
        6,
    ));

    let run = backtester.run(&[ROUTE.to_string()]).await.unwrap();
    let scorecards = summarize_scorecard(&run.folds, &[]);
    assert_eq!(scorecards.len(), 2);
    let monday = scorecards
        .iter()
        .find(|s| s.schedule_key == "monday")
        .unwrap();
    assert_eq!(monday.route_number, ROUTE);
    assert_eq!(monday.fold_count, 8);
    assert!(monday.mean_line_band_coverage_10_90 >= 0.0);
    assert!(monday.mean_line_band_coverage_10_90 <= 1.0);
}

#[tokio::test]
async fn snapshot_refresh_writes_csvs_and_state() {
    let dir = tempdir().unwrap();
    let (store, clock, backtester) = fixture(dir.path());
    seed_history(&store, 12);

    let outcome = refresh_learning_snapshots(
        &backtester,
        store.clone(),
        clock.clone(),
        &backtest_config(dir.path()),
        &[ROUTE.to_string()],
        &HashSet::new(),
    )
    .await
    .unwrap();

    let SnapshotRefreshOutcome::Refreshed {
        routes_refreshed,
        paths,
        ..
    } = outcome
    else {
        panic!("expected a refresh");
    };
    assert_eq!(routes_refreshed, vec![ROUTE.to_string()]);
    assert!(paths.folds.exists());
    assert!(paths.scorecard.exists());

    let folds_csv = std::fs::read_to_string(&paths.folds).unwrap();
    assert!(folds_csv.lines().count() > 1);
    assert!(folds_csv.starts_with("route_number,"));

    let state = store.refresh_state_get(ROUTE).await.unwrap().unwrap();
    assert_eq!(state.last_status, RefreshStatus::Refreshed);
    assert_eq!(state.last_fold_count, 8);
    assert!(state.last_scorecard_file.is_some());
}

#[tokio::test]
async fn snapshot_refresh_honors_weekly_cadence_and_force() {
    let dir = tempdir().unwrap();
    let (store, clock, backtester) = fixture(dir.path());
    seed_history(&store, 12);
    let config = backtest_config(dir.path());

    refresh_learning_snapshots(
        &backtester,
        store.clone(),
        clock.clone(),
        &config,
        &[ROUTE.to_string()],
        &HashSet::new(),
    )
    .await
    .unwrap();

    // A day later nothing is due.
    clock.advance(Duration::days(1));
    let outcome = refresh_learning_snapshots(
        &backtester,
        store.clone(),
        clock.clone(),
        &config,
        &[ROUTE.to_string()],
        &HashSet::new(),
    )
    .await
    .unwrap();
    assert_eq!(outcome, SnapshotRefreshOutcome::SkippedNotDue);

    // Unless the route was just retrained and is forced.
    let force: HashSet<String> = [ROUTE.to_string()].into_iter().collect();
    let outcome = refresh_learning_snapshots(
        &backtester,
        store.clone(),
        clock.clone(),
        &config,
        &[ROUTE.to_string()],
        &force,
    )
    .await
    .unwrap();
    assert!(matches!(outcome, SnapshotRefreshOutcome::Refreshed { .. }));
}
