//! Retrain orchestrator tests: the serial forecast chain, the
//! single-forecast-per-tick rule, status publication, and retrain gating.

mod helpers;

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use pretty_assertions::assert_eq;

use helpers::builders::{date, two_cycle_route, weekly_orders, OrderBuilder, ROUTE};
use helpers::stores::MemoryOrderStore;
use routespark::backtest::Backtester;
use routespark::cache::ForecastCache;
use routespark::calibration::{BandCalibrator, CalibratorSettings};
use routespark::clock::{Clock, FixedClock};
use routespark::config::Config;
use routespark::docstore::{DocumentStore, MemoryDocumentStore};
use routespark::engine::{ForecastEngine, NoLowQuantity};
use routespark::orchestrator::{RetrainOrchestrator, STATUS_COLLECTION};
use routespark::storage::OrderStore;

/// Tuesday 2025-01-28, mid-morning UTC.
fn tuesday_now() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 28, 10, 0, 0).unwrap()
}

struct Fixture {
    store: Arc<MemoryOrderStore>,
    docs: Arc<MemoryDocumentStore>,
    clock: Arc<FixedClock>,
    orchestrator: RetrainOrchestrator,
    _snapshot_dir: tempfile::TempDir,
}

fn fixture(now: chrono::DateTime<Utc>) -> Fixture {
    let store = Arc::new(MemoryOrderStore::new(now));
    store.set_cycles(ROUTE, two_cycle_route());
    store.set_synced_routes(vec![ROUTE.to_string()]);

    let docs = Arc::new(MemoryDocumentStore::new());
    let clock = Arc::new(FixedClock::new(now));
    let snapshot_dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.backtest.output_dir = snapshot_dir.path().display().to_string();

    let engine = Arc::new(ForecastEngine::new(
        store.clone(),
        store.clone(),
        Arc::new(NoLowQuantity),
        clock.clone(),
        config.forecast.clone(),
        config.bands.clone(),
    ));
    let cache = Arc::new(ForecastCache::new(
        docs.clone(),
        store.clone(),
        clock.clone(),
    ));
    let calibrator = Arc::new(BandCalibrator::new(
        store.clone(),
        clock.clone(),
        CalibratorSettings::from(&config.bands),
    ));
    let backtester = Arc::new(Backtester::new(
        store.clone(),
        store.clone(),
        clock.clone(),
        config.forecast.clone(),
        config.bands.clone(),
        config.backtest.clone(),
    ));

    let orchestrator = RetrainOrchestrator::new(
        store.clone(),
        docs.clone(),
        engine,
        cache,
        calibrator,
        backtester,
        clock.clone(),
        config,
    );

    Fixture {
        store,
        docs,
        clock,
        orchestrator,
        _snapshot_dir: snapshot_dir,
    }
}

fn seed_monday_history(store: &MemoryOrderStore) {
    // Monday-schedule orders deliver on Thursdays; newest is Jan 23.
    store.add_orders(weekly_orders(
        8,
        date(2024, 12, 5),
        "monday",
        "s1",
        "31032",
        12,
    ));
}

fn seed_tuesday_history(store: &MemoryOrderStore) {
    // Tuesday-schedule orders deliver on Mondays; newest is Jan 27.
    store.add_orders(weekly_orders(
        8,
        date(2024, 12, 9),
        "tuesday",
        "s1",
        "40100",
        6,
    ));
}

async fn cached_forecasts(docs: &MemoryDocumentStore) -> Vec<serde_json::Value> {
    docs.list(&format!("forecasts/{ROUTE}/cached"))
        .await
        .unwrap()
        .into_iter()
        .map(|doc| doc.data)
        .collect()
}

#[tokio::test]
async fn one_forecast_per_tick_targets_the_soonest_delivery() {
    let f = fixture(tuesday_now());
    seed_monday_history(&f.store);
    seed_tuesday_history(&f.store);

    let reports = f.orchestrator.tick().await.unwrap();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].forecast_generated);

    // Both schedules are active, but only the soonest delivery (Thursday
    // Jan 30, monday schedule) is forecast this tick.
    let cached = cached_forecasts(&f.docs).await;
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0]["delivery_date"], "2025-01-30");
    assert_eq!(cached[0]["schedule_key"], "monday");
}

#[tokio::test]
async fn serial_chain_moves_to_monday_after_thursday_finalizes() {
    let f = fixture(tuesday_now());
    seed_monday_history(&f.store);
    seed_tuesday_history(&f.store);

    f.orchestrator.tick().await.unwrap();

    // Thursday's order is finalized; it is Friday now.
    f.store.add_orders(vec![OrderBuilder::new("o_thu", date(2025, 1, 30))
        .line("s1", "31032", 12)
        .build()]);
    f.clock.advance(Duration::days(3));

    let reports = f.orchestrator.tick().await.unwrap();
    assert!(reports[0].forecast_generated);

    let cached = cached_forecasts(&f.docs).await;
    let deliveries: Vec<&str> = cached
        .iter()
        .map(|data| data["delivery_date"].as_str().unwrap())
        .collect();
    // The Monday Feb 3 (tuesday-schedule) forecast now exists.
    assert!(deliveries.contains(&"2025-02-03"));
    let monday_delivery = cached
        .iter()
        .find(|data| data["delivery_date"] == "2025-02-03")
        .unwrap();
    assert_eq!(monday_delivery["schedule_key"], "tuesday");
}

#[tokio::test]
async fn fresh_payload_short_circuits_regeneration() {
    let f = fixture(tuesday_now());
    seed_monday_history(&f.store);
    seed_tuesday_history(&f.store);

    let first = f.orchestrator.tick().await.unwrap();
    assert!(first[0].forecast_generated);

    let second = f.orchestrator.tick().await.unwrap();
    assert!(!second[0].forecast_generated);
    assert_eq!(
        second[0].forecast_skipped_reason.as_deref(),
        Some("forecast_exists")
    );
    assert_eq!(cached_forecasts(&f.docs).await.len(), 1);
}

#[tokio::test]
async fn status_is_published_even_when_cycle_is_incomplete() {
    let f = fixture(tuesday_now());
    seed_monday_history(&f.store);
    // No tuesday orders at all: cycle incomplete, no retrain.

    let reports = f.orchestrator.tick().await.unwrap();
    assert!(!reports[0].cycle_complete);
    assert!(reports[0].missing_schedules.contains(&"tuesday".to_string()));
    assert!(!reports[0].retrained);

    let status = f
        .docs
        .get(STATUS_COLLECTION, ROUTE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.data["order_count"], 8);
    assert_eq!(status.data["min_orders_required"], 7);
    assert_eq!(status.data["has_trained_model"], false);
}

#[tokio::test]
async fn complete_cycle_with_enough_history_retrains() {
    let f = fixture(tuesday_now());
    // Recent order dates inside the trailing week for both schedules.
    let mut monday = weekly_orders(8, date(2024, 12, 5), "monday", "s1", "31032", 12);
    monday.push(
        OrderBuilder::new("o_recent_mon", date(2025, 1, 23))
            .order_date(date(2025, 1, 22))
            .line("s1", "31032", 12)
            .build(),
    );
    let mut tuesday = weekly_orders(8, date(2024, 12, 9), "tuesday", "s1", "40100", 6);
    tuesday.push(
        OrderBuilder::new("o_recent_tue", date(2025, 1, 27))
            .order_date(date(2025, 1, 24))
            .line("s1", "40100", 6)
            .build(),
    );
    f.store.add_orders(monday);
    f.store.add_orders(tuesday);

    let reports = f.orchestrator.tick().await.unwrap();
    assert!(reports[0].cycle_complete);
    assert!(reports[0].retrained);
    assert!(f.store.has_trained_model(ROUTE).await.unwrap());

    // A refreshed learning snapshot was forced for the retrained route.
    let state = f.store.refresh_state_get(ROUTE).await.unwrap();
    assert!(state.is_some());
}

#[tokio::test]
async fn route_failures_do_not_skip_other_routes() {
    let f = fixture(tuesday_now());
    // Route A has no cycles at all; route B is healthy.
    f.store
        .set_synced_routes(vec!["111".to_string(), ROUTE.to_string()]);
    seed_monday_history(&f.store);
    seed_tuesday_history(&f.store);

    let reports = f.orchestrator.tick().await.unwrap();
    assert_eq!(reports.len(), 2);
    let healthy = reports
        .iter()
        .find(|r| r.route_number == ROUTE)
        .unwrap();
    assert!(healthy.forecast_generated);
}

#[tokio::test]
async fn timezone_shifts_the_scan_anchor() {
    // 02:00 UTC Wednesday is still Tuesday in Denver; the Thursday delivery
    // remains in scope for a Denver route.
    let now = Utc.with_ymd_and_hms(2025, 1, 29, 2, 0, 0).unwrap();
    let f = fixture(now);
    seed_monday_history(&f.store);
    seed_tuesday_history(&f.store);

    let clock = FixedClock::new(now);
    assert_eq!(
        clock.today_in(Some("America/Denver")),
        date(2025, 1, 28)
    );

    let reports = f.orchestrator.tick().await.unwrap();
    assert!(reports[0].forecast_generated);
}
