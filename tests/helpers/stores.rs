//! In-memory implementations of the storage traits.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};

use routespark::backtest::CorrectionProxy;
use routespark::domain::{
    AllocationRow, BandCalibration, CenterCalibration, Correction, CorrectionAggregate, Order,
    OrderCycle, PurgeCheckpoint, RefreshState, Result, SourceCalibration, StoreItemShare,
};
use routespark::storage::{CalibrationStore, OrderStore};

#[derive(Default)]
struct State {
    orders: Vec<Order>,
    corrections: Vec<Correction>,
    cycles: HashMap<String, Vec<OrderCycle>>,
    case_packs: HashMap<String, HashMap<String, u32>>,
    shares: HashMap<String, Vec<StoreItemShare>>,
    allocations: HashMap<String, Vec<AllocationRow>>,
    synced_routes: Vec<String>,
    trained: HashMap<String, bool>,
    timezones: HashMap<String, String>,
    route_start: HashMap<String, NaiveDate>,
    last_finalized: HashMap<String, DateTime<Utc>>,
    checkpoints: HashMap<(String, String), PurgeCheckpoint>,
    refresh_states: HashMap<String, RefreshState>,
    band: BTreeMap<(String, String, String), BandCalibration>,
    center: BTreeMap<(String, String, String), CenterCalibration>,
    source: BTreeMap<(String, String, String, String), SourceCalibration>,
}

/// Deterministic in-memory order + calibration store.
pub struct MemoryOrderStore {
    state: Mutex<State>,
    now: DateTime<Utc>,
}

impl MemoryOrderStore {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            now,
        }
    }

    pub fn add_orders(&self, orders: Vec<Order>) {
        let now = self.now;
        let mut state = self.state.lock().unwrap();
        for order in &orders {
            let candidate = order.updated_at.unwrap_or(now);
            let finalized = state
                .last_finalized
                .entry(order.route_number.clone())
                .or_insert(candidate);
            if candidate > *finalized {
                *finalized = candidate;
            }
        }
        state.orders.extend(orders);
    }

    pub fn add_corrections(&self, corrections: Vec<Correction>) {
        self.state.lock().unwrap().corrections.extend(corrections);
    }

    pub fn set_cycles(&self, route: &str, cycles: Vec<OrderCycle>) {
        self.state
            .lock()
            .unwrap()
            .cycles
            .insert(route.to_string(), cycles);
    }

    pub fn set_case_pack(&self, route: &str, sap: &str, case_pack: u32) {
        self.state
            .lock()
            .unwrap()
            .case_packs
            .entry(route.to_string())
            .or_default()
            .insert(sap.to_string(), case_pack);
    }

    pub fn set_allocations(&self, route: &str, allocations: Vec<AllocationRow>) {
        self.state
            .lock()
            .unwrap()
            .allocations
            .insert(route.to_string(), allocations);
    }

    pub fn set_synced_routes(&self, routes: Vec<String>) {
        self.state.lock().unwrap().synced_routes = routes;
    }

    pub fn set_last_finalized(&self, route: &str, at: DateTime<Utc>) {
        self.state
            .lock()
            .unwrap()
            .last_finalized
            .insert(route.to_string(), at);
    }

    pub fn set_route_start(&self, route: &str, start: NaiveDate) {
        self.state
            .lock()
            .unwrap()
            .route_start
            .insert(route.to_string(), start);
    }

    pub fn band_scale(&self, route: &str, schedule: &str, interval: &str) -> Option<f64> {
        self.state
            .lock()
            .unwrap()
            .band
            .get(&(route.to_string(), schedule.to_string(), interval.to_string()))
            .map(|row| row.band_scale)
    }

    pub fn checkpoint_count(&self) -> usize {
        self.state.lock().unwrap().checkpoints.len()
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn orders_in_window(
        &self,
        route: &str,
        since_days: u32,
        schedule: Option<&str>,
    ) -> Result<Vec<Order>> {
        let state = self.state.lock().unwrap();
        let cutoff = self.now.date_naive() - Duration::days(since_days as i64);
        let mut out: Vec<Order> = state
            .orders
            .iter()
            .filter(|o| o.route_number == route)
            .filter(|o| o.delivery_date >= cutoff)
            .filter(|o| schedule.map_or(true, |s| o.schedule_key == s))
            .cloned()
            .collect();
        out.sort_by_key(|o| o.delivery_date);
        Ok(out)
    }

    async fn corrections_up_to(
        &self,
        route: &str,
        schedule: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<CorrectionAggregate>> {
        let state = self.state.lock().unwrap();
        let mut grouped: BTreeMap<(String, String), Vec<&Correction>> = BTreeMap::new();
        for correction in state
            .corrections
            .iter()
            .filter(|c| c.route_number == route)
            .filter(|c| c.schedule_key == schedule)
            .filter(|c| !c.is_holiday_week)
            .filter(|c| c.submitted_at < cutoff)
        {
            grouped
                .entry((correction.store_id.clone(), correction.sap.clone()))
                .or_default()
                .push(correction);
        }

        Ok(grouped
            .into_iter()
            .map(|((store_id, sap), rows)| {
                let n = rows.len() as f64;
                let ratios: Vec<f64> = rows.iter().map(|c| c.ratio()).collect();
                let mean_ratio = ratios.iter().sum::<f64>() / n;
                let variance = ratios
                    .iter()
                    .map(|r| (r - mean_ratio) * (r - mean_ratio))
                    .sum::<f64>()
                    / n;
                CorrectionAggregate {
                    store_id,
                    sap,
                    schedule_key: schedule.to_string(),
                    samples: rows.len() as u32,
                    avg_delta: rows.iter().map(|c| c.delta()).sum::<f64>() / n,
                    avg_ratio: mean_ratio,
                    ratio_stddev: variance.sqrt(),
                    removal_rate: rows.iter().filter(|c| c.was_removed).count() as f64 / n,
                    promo_rate: rows.iter().filter(|c| c.promo_active).count() as f64 / n,
                }
            })
            .collect())
    }

    async fn corrected_order_count_before(
        &self,
        route: &str,
        schedule: &str,
        cutoff: DateTime<Utc>,
        since_days: u32,
    ) -> Result<u32> {
        let state = self.state.lock().unwrap();
        let window_start = cutoff.date_naive() - Duration::days(since_days as i64);
        let mut order_ids: Vec<&str> = state
            .corrections
            .iter()
            .filter(|c| c.route_number == route)
            .filter(|c| c.schedule_key == schedule)
            .filter(|c| !c.is_holiday_week)
            .filter(|c| c.submitted_at <= cutoff)
            .filter(|c| c.delivery_date >= window_start)
            .map(|c| c.order_id.as_str())
            .collect();
        order_ids.sort_unstable();
        order_ids.dedup();
        Ok(order_ids.len() as u32)
    }

    async fn store_item_shares(
        &self,
        route: &str,
        schedule: Option<&str>,
    ) -> Result<Vec<StoreItemShare>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .shares
            .get(route)
            .map(|rows| {
                rows.iter()
                    .filter(|row| schedule.map_or(true, |s| row.schedule_key == s))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn item_allocation_cache(&self, route: &str) -> Result<Vec<AllocationRow>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .allocations
            .get(route)
            .cloned()
            .unwrap_or_default())
    }

    async fn last_finalized_at(
        &self,
        route: &str,
        _schedule: Option<&str>,
    ) -> Result<Option<DateTime<Utc>>> {
        Ok(self.state.lock().unwrap().last_finalized.get(route).copied())
    }

    async fn synced_routes(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().unwrap().synced_routes.clone())
    }

    async fn active_cycles(&self, route: &str) -> Result<Vec<OrderCycle>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .cycles
            .get(route)
            .cloned()
            .unwrap_or_default())
    }

    async fn order_count(
        &self,
        route: &str,
        schedule: Option<&str>,
        exclude_holidays: bool,
    ) -> Result<u32> {
        let state = self.state.lock().unwrap();
        Ok(state
            .orders
            .iter()
            .filter(|o| o.route_number == route)
            .filter(|o| schedule.map_or(true, |s| o.schedule_key == s))
            .filter(|o| !exclude_holidays || !o.is_holiday_week)
            .count() as u32)
    }

    async fn finalized_deliveries_after(
        &self,
        route: &str,
        after: NaiveDate,
    ) -> Result<Vec<(String, NaiveDate)>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .orders
            .iter()
            .filter(|o| o.route_number == route)
            .filter(|o| o.delivery_date >= after)
            .map(|o| (o.schedule_key.clone(), o.delivery_date))
            .collect())
    }

    async fn has_trained_model(&self, route: &str) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .trained
            .get(route)
            .copied()
            .unwrap_or(false))
    }

    async fn set_trained_model(&self, route: &str, trained: bool) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .trained
            .insert(route.to_string(), trained);
        Ok(())
    }

    async fn route_timezone(&self, route: &str) -> Result<Option<String>> {
        Ok(self.state.lock().unwrap().timezones.get(route).cloned())
    }

    async fn route_start_date(&self, route: &str) -> Result<Option<NaiveDate>> {
        let state = self.state.lock().unwrap();
        Ok(state.route_start.get(route).copied().or_else(|| {
            state
                .orders
                .iter()
                .filter(|o| o.route_number == route)
                .map(|o| o.delivery_date)
                .min()
        }))
    }

    async fn case_packs(&self, route: &str) -> Result<HashMap<String, u32>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .case_packs
            .get(route)
            .cloned()
            .unwrap_or_default())
    }

    async fn purge_checkpoint_get(
        &self,
        route: &str,
        delivery: &str,
    ) -> Result<Option<PurgeCheckpoint>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .checkpoints
            .get(&(route.to_string(), delivery.to_string()))
            .cloned())
    }

    async fn purge_checkpoint_set(&self, checkpoint: &PurgeCheckpoint) -> Result<()> {
        self.state.lock().unwrap().checkpoints.insert(
            (
                checkpoint.route_number.clone(),
                checkpoint.delivery_number.clone(),
            ),
            checkpoint.clone(),
        );
        Ok(())
    }

    async fn refresh_state_get(&self, route: &str) -> Result<Option<RefreshState>> {
        Ok(self.state.lock().unwrap().refresh_states.get(route).cloned())
    }

    async fn refresh_state_upsert(&self, state_row: &RefreshState) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .refresh_states
            .insert(state_row.route_number.clone(), state_row.clone());
        Ok(())
    }

    async fn correction_proxies(
        &self,
        route: &str,
        _since_days: u32,
    ) -> Result<Vec<CorrectionProxy>> {
        let state = self.state.lock().unwrap();
        let mut schedules: Vec<String> = state
            .corrections
            .iter()
            .filter(|c| c.route_number == route)
            .map(|c| c.schedule_key.clone())
            .collect();
        schedules.sort();
        schedules.dedup();
        Ok(schedules
            .into_iter()
            .map(|schedule| {
                let rows: Vec<&Correction> = state
                    .corrections
                    .iter()
                    .filter(|c| c.route_number == route && c.schedule_key == schedule)
                    .collect();
                let avg_abs = rows.iter().map(|c| c.delta().abs()).sum::<f64>()
                    / rows.len().max(1) as f64;
                CorrectionProxy {
                    schedule_key: schedule,
                    correction_line_rate: 0.0,
                    corrected_order_rate: 0.0,
                    avg_abs_correction_delta: avg_abs,
                }
            })
            .collect())
    }
}

/// Low-quantity service double returning a fixed floor list.
pub struct FixedLowQuantity {
    floors: Vec<routespark::domain::ExpiryFloor>,
}

impl FixedLowQuantity {
    pub fn new(floors: Vec<routespark::domain::ExpiryFloor>) -> Self {
        Self { floors }
    }
}

#[async_trait]
impl routespark::engine::LowQuantitySource for FixedLowQuantity {
    async fn floors_for_route(
        &self,
        _route: &str,
    ) -> routespark::engine::EngineResult<Vec<routespark::domain::ExpiryFloor>> {
        Ok(self.floors.clone())
    }
}

#[async_trait]
impl CalibrationStore for MemoryOrderStore {
    async fn band_calibration_get(
        &self,
        route: &str,
        schedule: &str,
        interval: &str,
    ) -> Result<Option<BandCalibration>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .band
            .get(&(route.to_string(), schedule.to_string(), interval.to_string()))
            .cloned())
    }

    async fn band_calibration_upsert(&self, row: &BandCalibration) -> Result<()> {
        self.state.lock().unwrap().band.insert(
            (
                row.route_number.clone(),
                row.schedule_key.clone(),
                row.interval_name.clone(),
            ),
            row.clone(),
        );
        Ok(())
    }

    async fn center_calibration_get(
        &self,
        route: &str,
        schedule: &str,
        interval: &str,
    ) -> Result<Option<CenterCalibration>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .center
            .get(&(route.to_string(), schedule.to_string(), interval.to_string()))
            .cloned())
    }

    async fn center_calibration_upsert(&self, row: &CenterCalibration) -> Result<()> {
        self.state.lock().unwrap().center.insert(
            (
                row.route_number.clone(),
                row.schedule_key.clone(),
                row.interval_name.clone(),
            ),
            row.clone(),
        );
        Ok(())
    }

    async fn source_calibrations(
        &self,
        route: &str,
        schedule: &str,
        interval: &str,
    ) -> Result<Vec<SourceCalibration>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .source
            .iter()
            .filter(|((r, s, _, i), _)| r == route && s == schedule && i == interval)
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn source_calibration_upsert(&self, row: &SourceCalibration) -> Result<()> {
        self.state.lock().unwrap().source.insert(
            (
                row.route_number.clone(),
                row.schedule_key.clone(),
                row.source.clone(),
                row.interval_name.clone(),
            ),
            row.clone(),
        );
        Ok(())
    }

    async fn last_calibration_update(
        &self,
        route: &str,
        interval: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .band
            .iter()
            .filter(|((r, _, i), _)| r == route && i == interval)
            .map(|(_, row)| row.updated_at)
            .max())
    }
}
