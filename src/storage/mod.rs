//! Relational store adapter: typed accessors over the Postgres schema.
//!
//! Reads used by forecast generation observe writes committed by the
//! ingestion boundary before the call begins; every method is a single
//! statement (or an upsert) against the pool, so read-your-writes holds at
//! request granularity.

pub mod database;
pub mod models;

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use sqlx::PgPool;

use crate::domain::{
    AllocationRow, BandCalibration, CenterCalibration, CorrectionAggregate, LineItem, Order,
    OrderCycle, OrderStatus, PurgeCheckpoint, PurgeCheckpointStatus, RefreshState, Result,
    SourceCalibration, StoreItemShare, StoreOrder,
};

pub use database::connect;

use models::{
    AllocationCacheRow, BandCalibrationRow, CenterCalibrationRow, CorrectionAggRow, LineItemRow,
    OrderRow, PurgeCheckpointRow, RefreshStateRow, ScheduleRow, ShareRow, SourceCalibrationRow,
};

/// Typed accessors for order history, shares, checkpoints, and route state.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn orders_in_window(
        &self,
        route: &str,
        since_days: u32,
        schedule: Option<&str>,
    ) -> Result<Vec<Order>>;

    /// Correction aggregates grouped by (store, sap, schedule) with a strict
    /// temporal cutoff; holiday-week corrections are excluded.
    async fn corrections_up_to(
        &self,
        route: &str,
        schedule: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<CorrectionAggregate>>;

    /// Distinct corrected orders submitted strictly before the cutoff.
    async fn corrected_order_count_before(
        &self,
        route: &str,
        schedule: &str,
        cutoff: DateTime<Utc>,
        since_days: u32,
    ) -> Result<u32>;

    async fn store_item_shares(
        &self,
        route: &str,
        schedule: Option<&str>,
    ) -> Result<Vec<StoreItemShare>>;

    async fn item_allocation_cache(&self, route: &str) -> Result<Vec<AllocationRow>>;

    async fn last_finalized_at(
        &self,
        route: &str,
        schedule: Option<&str>,
    ) -> Result<Option<DateTime<Utc>>>;

    async fn synced_routes(&self) -> Result<Vec<String>>;

    async fn active_cycles(&self, route: &str) -> Result<Vec<OrderCycle>>;

    async fn order_count(
        &self,
        route: &str,
        schedule: Option<&str>,
        exclude_holidays: bool,
    ) -> Result<u32>;

    /// Finalized (schedule_key, delivery_date) pairs with delivery on or
    /// after `after`; feeds the next-delivery scan.
    async fn finalized_deliveries_after(
        &self,
        route: &str,
        after: NaiveDate,
    ) -> Result<Vec<(String, NaiveDate)>>;

    async fn has_trained_model(&self, route: &str) -> Result<bool>;

    async fn set_trained_model(&self, route: &str, trained: bool) -> Result<()>;

    async fn route_timezone(&self, route: &str) -> Result<Option<String>>;

    async fn route_start_date(&self, route: &str) -> Result<Option<NaiveDate>>;

    /// Units-per-case by SAP from the product catalog (tray as fallback).
    async fn case_packs(&self, route: &str) -> Result<HashMap<String, u32>>;

    async fn purge_checkpoint_get(
        &self,
        route: &str,
        delivery: &str,
    ) -> Result<Option<PurgeCheckpoint>>;

    async fn purge_checkpoint_set(&self, checkpoint: &PurgeCheckpoint) -> Result<()>;

    async fn refresh_state_get(&self, route: &str) -> Result<Option<RefreshState>>;

    async fn refresh_state_upsert(&self, state: &RefreshState) -> Result<()>;

    /// Observed correction-rate proxies per schedule over the lookback
    /// window; joined into the backtest scorecard.
    async fn correction_proxies(
        &self,
        route: &str,
        since_days: u32,
    ) -> Result<Vec<crate::backtest::CorrectionProxy>>;
}

/// Band/center/source calibration persistence with upsert semantics.
#[async_trait]
pub trait CalibrationStore: Send + Sync {
    async fn band_calibration_get(
        &self,
        route: &str,
        schedule: &str,
        interval: &str,
    ) -> Result<Option<BandCalibration>>;

    async fn band_calibration_upsert(&self, row: &BandCalibration) -> Result<()>;

    async fn center_calibration_get(
        &self,
        route: &str,
        schedule: &str,
        interval: &str,
    ) -> Result<Option<CenterCalibration>>;

    async fn center_calibration_upsert(&self, row: &CenterCalibration) -> Result<()>;

    async fn source_calibrations(
        &self,
        route: &str,
        schedule: &str,
        interval: &str,
    ) -> Result<Vec<SourceCalibration>>;

    async fn source_calibration_upsert(&self, row: &SourceCalibration) -> Result<()>;

    /// Newest `updated_at` across a route's schedule calibrations; drives the
    /// weekly due check.
    async fn last_calibration_update(
        &self,
        route: &str,
        interval: &str,
    ) -> Result<Option<DateTime<Utc>>>;
}

/// Postgres-backed implementation of both store traits.
#[derive(Clone)]
pub struct PgOrderStore {
    pool: PgPool,
}

impl PgOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn assemble_orders(order_rows: Vec<OrderRow>, line_rows: Vec<LineItemRow>) -> Vec<Order> {
        let mut lines_by_order: HashMap<String, BTreeMap<String, StoreOrder>> = HashMap::new();
        for line in line_rows {
            let stores = lines_by_order.entry(line.order_id.clone()).or_default();
            let store = stores
                .entry(line.store_id.clone())
                .or_insert_with(|| StoreOrder {
                    store_id: line.store_id.clone(),
                    store_name: line.store_name.clone().unwrap_or_default(),
                    items: Vec::new(),
                    entered_at: None,
                });
            store.items.push(LineItem {
                sap: line.sap,
                units: line.quantity.max(0) as u32,
                cases: line.cases.map(f64::from),
                promo_active: line.promo_active,
                user_adjusted: line.user_adjusted,
                forecasted_units: line.forecasted_units.map(f64::from),
                forecasted_cases: line.forecasted_cases.map(f64::from),
            });
        }

        order_rows
            .into_iter()
            .map(|row| {
                let stores = lines_by_order
                    .remove(&row.order_id)
                    .map(|by_store| by_store.into_values().collect())
                    .unwrap_or_default();
                Order {
                    order_id: row.order_id,
                    route_number: row.route_number,
                    schedule_key: row.schedule_key,
                    delivery_date: row.delivery_date,
                    order_date: row.order_date,
                    status: match row.status.as_str() {
                        "draft" => OrderStatus::Draft,
                        "deleted" => OrderStatus::Deleted,
                        _ => OrderStatus::Finalized,
                    },
                    is_holiday_week: row.is_holiday_week,
                    stores,
                    created_at: Some(row.created_at),
                    updated_at: Some(row.synced_at),
                }
            })
            .collect()
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn orders_in_window(
        &self,
        route: &str,
        since_days: u32,
        schedule: Option<&str>,
    ) -> Result<Vec<Order>> {
        let cutoff = Utc::now().date_naive() - Duration::days(since_days as i64);
        let order_rows: Vec<OrderRow> = sqlx::query_as(
            r#"
            SELECT order_id, route_number, schedule_key, delivery_date, order_date,
                   status, is_holiday_week, created_at, synced_at
            FROM orders_historical
            WHERE route_number = $1
              AND status = 'finalized'
              AND delivery_date >= $2
              AND ($3::text IS NULL OR schedule_key = $3)
            ORDER BY delivery_date ASC
            "#,
        )
        .bind(route)
        .bind(cutoff)
        .bind(schedule)
        .fetch_all(&self.pool)
        .await?;

        if order_rows.is_empty() {
            return Ok(Vec::new());
        }

        let order_ids: Vec<String> = order_rows.iter().map(|r| r.order_id.clone()).collect();
        let line_rows: Vec<LineItemRow> = sqlx::query_as(
            r#"
            SELECT order_id, store_id, store_name, sap, quantity, cases,
                   promo_active, user_adjusted, forecasted_units, forecasted_cases
            FROM order_line_items
            WHERE order_id = ANY($1)
            "#,
        )
        .bind(&order_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(Self::assemble_orders(order_rows, line_rows))
    }

    async fn corrections_up_to(
        &self,
        route: &str,
        schedule: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<CorrectionAggregate>> {
        let rows: Vec<CorrectionAggRow> = sqlx::query_as(
            r#"
            SELECT
                store_id,
                sap,
                schedule_key,
                COUNT(*) AS samples,
                AVG(correction_delta)::float8 AS avg_delta,
                AVG(correction_ratio)::float8 AS avg_ratio,
                COALESCE(STDDEV(correction_ratio), 0)::float8 AS ratio_stddev,
                (SUM(CASE WHEN was_removed THEN 1 ELSE 0 END)::float8 / COUNT(*)) AS removal_rate,
                (SUM(CASE WHEN promo_active THEN 1 ELSE 0 END)::float8 / COUNT(*)) AS promo_rate
            FROM forecast_corrections
            WHERE route_number = $1
              AND schedule_key = $2
              AND is_holiday_week = FALSE
              AND submitted_at < $3
            GROUP BY store_id, sap, schedule_key
            HAVING COUNT(*) >= 1
            "#,
        )
        .bind(route)
        .bind(schedule)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn corrected_order_count_before(
        &self,
        route: &str,
        schedule: &str,
        cutoff: DateTime<Utc>,
        since_days: u32,
    ) -> Result<u32> {
        let window_start = cutoff.date_naive() - Duration::days(since_days as i64);
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(DISTINCT order_id)
            FROM forecast_corrections
            WHERE route_number = $1
              AND schedule_key = $2
              AND is_holiday_week = FALSE
              AND submitted_at <= $3
              AND delivery_date >= $4
            "#,
        )
        .bind(route)
        .bind(schedule)
        .bind(cutoff)
        .bind(window_start)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.0.max(0) as u32)
    }

    async fn store_item_shares(
        &self,
        route: &str,
        schedule: Option<&str>,
    ) -> Result<Vec<StoreItemShare>> {
        let rows: Vec<ShareRow> = sqlx::query_as(
            r#"
            SELECT store_id, sap, schedule_key, blended_share, recent_share,
                   base_share, trend
            FROM store_item_shares
            WHERE route_number = $1
              AND ($2::text IS NULL OR schedule_key = $2)
            "#,
        )
        .bind(route)
        .bind(schedule)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn item_allocation_cache(&self, route: &str) -> Result<Vec<AllocationRow>> {
        let rows: Vec<AllocationCacheRow> = sqlx::query_as(
            r#"
            SELECT sap, split_pattern, primary_store_id, store_count
            FROM item_allocation_cache
            WHERE route_number = $1
            "#,
        )
        .bind(route)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn last_finalized_at(
        &self,
        route: &str,
        schedule: Option<&str>,
    ) -> Result<Option<DateTime<Utc>>> {
        let row: (Option<DateTime<Utc>>,) = sqlx::query_as(
            r#"
            SELECT MAX(synced_at)
            FROM orders_historical
            WHERE route_number = $1
              AND status = 'finalized'
              AND ($2::text IS NULL OR schedule_key = $2)
            "#,
        )
        .bind(route)
        .bind(schedule)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    async fn synced_routes(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT route_number
            FROM routes_synced
            WHERE sync_status = 'ready'
            ORDER BY route_number
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    async fn active_cycles(&self, route: &str) -> Result<Vec<OrderCycle>> {
        let rows: Vec<ScheduleRow> = sqlx::query_as(
            r#"
            SELECT schedule_key, order_day, load_day, delivery_day
            FROM user_schedules
            WHERE route_number = $1 AND is_active = TRUE
            ORDER BY order_day
            "#,
        )
        .bind(route)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|r| {
                OrderCycle::new(
                    r.order_day.max(0) as u8,
                    r.load_day.max(0) as u8,
                    r.delivery_day.max(0) as u8,
                )
            })
            .collect())
    }

    async fn order_count(
        &self,
        route: &str,
        schedule: Option<&str>,
        exclude_holidays: bool,
    ) -> Result<u32> {
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM orders_historical
            WHERE route_number = $1
              AND status = 'finalized'
              AND ($2::text IS NULL OR schedule_key = $2)
              AND ($3 = FALSE OR is_holiday_week = FALSE)
            "#,
        )
        .bind(route)
        .bind(schedule)
        .bind(exclude_holidays)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.0.max(0) as u32)
    }

    async fn finalized_deliveries_after(
        &self,
        route: &str,
        after: NaiveDate,
    ) -> Result<Vec<(String, NaiveDate)>> {
        let rows: Vec<(String, NaiveDate)> = sqlx::query_as(
            r#"
            SELECT schedule_key, delivery_date
            FROM orders_historical
            WHERE route_number = $1
              AND status = 'finalized'
              AND delivery_date >= $2
            "#,
        )
        .bind(route)
        .bind(after)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn has_trained_model(&self, route: &str) -> Result<bool> {
        let row: Option<(bool,)> = sqlx::query_as(
            r#"SELECT has_trained_model FROM routes_synced WHERE route_number = $1"#,
        )
        .bind(route)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.0).unwrap_or(false))
    }

    async fn set_trained_model(&self, route: &str, trained: bool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO routes_synced (route_number, sync_status, has_trained_model, updated_at)
            VALUES ($1, 'ready', $2, NOW())
            ON CONFLICT (route_number)
            DO UPDATE SET has_trained_model = EXCLUDED.has_trained_model,
                          updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(route)
        .bind(trained)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn route_timezone(&self, route: &str) -> Result<Option<String>> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as(r#"SELECT timezone FROM routes_synced WHERE route_number = $1"#)
                .bind(route)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.and_then(|r| r.0))
    }

    async fn route_start_date(&self, route: &str) -> Result<Option<NaiveDate>> {
        let row: Option<(Option<NaiveDate>,)> = sqlx::query_as(
            r#"
            SELECT COALESCE(
                (SELECT first_order_date FROM routes_synced WHERE route_number = $1),
                (SELECT MIN(delivery_date) FROM orders_historical WHERE route_number = $1)
            )
            "#,
        )
        .bind(route)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(|r| r.0))
    }

    async fn case_packs(&self, route: &str) -> Result<HashMap<String, u32>> {
        let rows: Vec<(String, Option<i32>, Option<i32>)> = sqlx::query_as(
            r#"
            SELECT sap, case_pack, tray
            FROM product_catalog
            WHERE route_number = $1
            "#,
        )
        .bind(route)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(sap, case_pack, tray)| {
                let pack = case_pack.or(tray)?;
                (pack > 0).then_some((sap, pack as u32))
            })
            .collect())
    }

    async fn purge_checkpoint_get(
        &self,
        route: &str,
        delivery: &str,
    ) -> Result<Option<PurgeCheckpoint>> {
        let row: Option<PurgeCheckpointRow> = sqlx::query_as(
            r#"
            SELECT route_number, delivery_number, status, event_id, worker_id,
                   details, purged_at
            FROM archive_purge_checkpoints
            WHERE route_number = $1 AND delivery_number = $2
            "#,
        )
        .bind(route)
        .bind(delivery)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn purge_checkpoint_set(&self, checkpoint: &PurgeCheckpoint) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO archive_purge_checkpoints (
                route_number, delivery_number, status, event_id, worker_id,
                details, purged_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6,
                    CASE WHEN $3 = 'completed' THEN NOW() ELSE NULL END, NOW())
            ON CONFLICT (route_number, delivery_number)
            DO UPDATE SET
                status = EXCLUDED.status,
                event_id = EXCLUDED.event_id,
                worker_id = EXCLUDED.worker_id,
                details = EXCLUDED.details,
                purged_at = COALESCE(EXCLUDED.purged_at, archive_purge_checkpoints.purged_at),
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&checkpoint.route_number)
        .bind(&checkpoint.delivery_number)
        .bind(match checkpoint.status {
            PurgeCheckpointStatus::Completed => "completed",
            PurgeCheckpointStatus::Failed => "failed",
        })
        .bind(&checkpoint.event_id)
        .bind(&checkpoint.worker_id)
        .bind(&checkpoint.details)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn refresh_state_get(&self, route: &str) -> Result<Option<RefreshState>> {
        let row: Option<RefreshStateRow> = sqlx::query_as(
            r#"
            SELECT route_number, last_refreshed_at, last_status, last_scorecard_file,
                   last_folds_file, last_sources_file, last_fold_count, last_error
            FROM forecast_learning_refresh_state
            WHERE route_number = $1
            "#,
        )
        .bind(route)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn refresh_state_upsert(&self, state: &RefreshState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO forecast_learning_refresh_state (
                route_number, last_refreshed_at, last_status, last_scorecard_file,
                last_folds_file, last_sources_file, last_fold_count, last_error,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
            ON CONFLICT (route_number)
            DO UPDATE SET
                last_refreshed_at = EXCLUDED.last_refreshed_at,
                last_status = EXCLUDED.last_status,
                last_scorecard_file = EXCLUDED.last_scorecard_file,
                last_folds_file = EXCLUDED.last_folds_file,
                last_sources_file = EXCLUDED.last_sources_file,
                last_fold_count = EXCLUDED.last_fold_count,
                last_error = EXCLUDED.last_error,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&state.route_number)
        .bind(state.last_refreshed_at)
        .bind(state.last_status.as_str())
        .bind(&state.last_scorecard_file)
        .bind(&state.last_folds_file)
        .bind(&state.last_sources_file)
        .bind(state.last_fold_count as i32)
        .bind(&state.last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn correction_proxies(
        &self,
        route: &str,
        since_days: u32,
    ) -> Result<Vec<crate::backtest::CorrectionProxy>> {
        let window_start = Utc::now().date_naive() - Duration::days(since_days as i64);

        let correction_rows: Vec<(String, i64, i64, Option<f64>)> = sqlx::query_as(
            r#"
            SELECT
                schedule_key,
                COUNT(*),
                COUNT(DISTINCT order_id),
                AVG(ABS(correction_delta))::float8
            FROM forecast_corrections
            WHERE route_number = $1
              AND submitted_at >= $2
            GROUP BY schedule_key
            "#,
        )
        .bind(route)
        .bind(window_start.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc()))
        .fetch_all(&self.pool)
        .await?;

        let line_rows: Vec<(String, i64, i64)> = sqlx::query_as(
            r#"
            SELECT
                o.schedule_key,
                COUNT(li.line_item_id),
                COUNT(DISTINCT o.order_id)
            FROM orders_historical o
            LEFT JOIN order_line_items li ON li.order_id = o.order_id
            WHERE o.route_number = $1
              AND o.delivery_date >= $2
            GROUP BY o.schedule_key
            "#,
        )
        .bind(route)
        .bind(window_start)
        .fetch_all(&self.pool)
        .await?;

        let mut schedules: Vec<String> = correction_rows
            .iter()
            .map(|r| r.0.clone())
            .chain(line_rows.iter().map(|r| r.0.clone()))
            .collect();
        schedules.sort();
        schedules.dedup();

        Ok(schedules
            .into_iter()
            .map(|schedule| {
                let corr = correction_rows.iter().find(|r| r.0 == schedule);
                let lines = line_rows.iter().find(|r| r.0 == schedule);
                let total_lines = lines.map(|r| r.1).unwrap_or(0) as f64;
                let total_orders = lines.map(|r| r.2).unwrap_or(0) as f64;
                let correction_count = corr.map(|r| r.1).unwrap_or(0) as f64;
                let corrected_orders = corr.map(|r| r.2).unwrap_or(0) as f64;
                crate::backtest::CorrectionProxy {
                    schedule_key: schedule,
                    correction_line_rate: if total_lines > 0.0 {
                        correction_count / total_lines
                    } else {
                        0.0
                    },
                    corrected_order_rate: if total_orders > 0.0 {
                        corrected_orders / total_orders
                    } else {
                        0.0
                    },
                    avg_abs_correction_delta: corr.and_then(|r| r.3).unwrap_or(0.0),
                }
            })
            .collect())
    }
}

#[async_trait]
impl CalibrationStore for PgOrderStore {
    async fn band_calibration_get(
        &self,
        route: &str,
        schedule: &str,
        interval: &str,
    ) -> Result<Option<BandCalibration>> {
        let row: Option<BandCalibrationRow> = sqlx::query_as(
            r#"
            SELECT route_number, schedule_key, interval_name, band_scale,
                   target_coverage, observed_coverage, under_rate, over_rate,
                   sample_lines, fold_count, notes, last_backtest_at, updated_at
            FROM forecast_band_calibration
            WHERE route_number = $1 AND schedule_key = $2 AND interval_name = $3
            "#,
        )
        .bind(route)
        .bind(schedule)
        .bind(interval)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn band_calibration_upsert(&self, row: &BandCalibration) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO forecast_band_calibration (
                route_number, schedule_key, interval_name, band_scale,
                target_coverage, observed_coverage, under_rate, over_rate,
                sample_lines, fold_count, notes, last_backtest_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, NOW())
            ON CONFLICT (route_number, schedule_key, interval_name)
            DO UPDATE SET
                band_scale = EXCLUDED.band_scale,
                target_coverage = EXCLUDED.target_coverage,
                observed_coverage = EXCLUDED.observed_coverage,
                under_rate = EXCLUDED.under_rate,
                over_rate = EXCLUDED.over_rate,
                sample_lines = EXCLUDED.sample_lines,
                fold_count = EXCLUDED.fold_count,
                notes = EXCLUDED.notes,
                last_backtest_at = EXCLUDED.last_backtest_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&row.route_number)
        .bind(&row.schedule_key)
        .bind(&row.interval_name)
        .bind(row.band_scale as f32)
        .bind(row.target_coverage as f32)
        .bind(row.observed_coverage.map(|v| v as f32))
        .bind(row.under_rate.map(|v| v as f32))
        .bind(row.over_rate.map(|v| v as f32))
        .bind(row.sample_lines.map(|v| v as i32))
        .bind(row.fold_count.map(|v| v as i32))
        .bind(&row.notes)
        .bind(row.last_backtest_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn center_calibration_get(
        &self,
        route: &str,
        schedule: &str,
        interval: &str,
    ) -> Result<Option<CenterCalibration>> {
        let row: Option<CenterCalibrationRow> = sqlx::query_as(
            r#"
            SELECT route_number, schedule_key, interval_name, center_offset_units,
                   observed_under_rate, observed_over_rate, sample_lines,
                   fold_count, notes, last_backtest_at, updated_at
            FROM forecast_band_center_calibration
            WHERE route_number = $1 AND schedule_key = $2 AND interval_name = $3
            "#,
        )
        .bind(route)
        .bind(schedule)
        .bind(interval)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn center_calibration_upsert(&self, row: &CenterCalibration) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO forecast_band_center_calibration (
                route_number, schedule_key, interval_name, center_offset_units,
                observed_under_rate, observed_over_rate, sample_lines, fold_count,
                notes, last_backtest_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW())
            ON CONFLICT (route_number, schedule_key, interval_name)
            DO UPDATE SET
                center_offset_units = EXCLUDED.center_offset_units,
                observed_under_rate = EXCLUDED.observed_under_rate,
                observed_over_rate = EXCLUDED.observed_over_rate,
                sample_lines = EXCLUDED.sample_lines,
                fold_count = EXCLUDED.fold_count,
                notes = EXCLUDED.notes,
                last_backtest_at = EXCLUDED.last_backtest_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&row.route_number)
        .bind(&row.schedule_key)
        .bind(&row.interval_name)
        .bind(row.center_offset_units as f32)
        .bind(row.observed_under_rate.map(|v| v as f32))
        .bind(row.observed_over_rate.map(|v| v as f32))
        .bind(row.sample_lines.map(|v| v as i32))
        .bind(row.fold_count.map(|v| v as i32))
        .bind(&row.notes)
        .bind(row.last_backtest_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn source_calibrations(
        &self,
        route: &str,
        schedule: &str,
        interval: &str,
    ) -> Result<Vec<SourceCalibration>> {
        let rows: Vec<SourceCalibrationRow> = sqlx::query_as(
            r#"
            SELECT route_number, schedule_key, source, interval_name,
                   band_scale_mult, center_offset_units, target_coverage,
                   observed_coverage, observed_under_rate, observed_over_rate,
                   sample_lines, fold_count, last_backtest_at, updated_at
            FROM forecast_band_source_calibration
            WHERE route_number = $1 AND schedule_key = $2 AND interval_name = $3
            "#,
        )
        .bind(route)
        .bind(schedule)
        .bind(interval)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn source_calibration_upsert(&self, row: &SourceCalibration) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO forecast_band_source_calibration (
                route_number, schedule_key, source, interval_name,
                band_scale_mult, center_offset_units, target_coverage,
                observed_coverage, observed_under_rate, observed_over_rate,
                sample_lines, fold_count, last_backtest_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, NOW())
            ON CONFLICT (route_number, schedule_key, source, interval_name)
            DO UPDATE SET
                band_scale_mult = EXCLUDED.band_scale_mult,
                center_offset_units = EXCLUDED.center_offset_units,
                target_coverage = EXCLUDED.target_coverage,
                observed_coverage = EXCLUDED.observed_coverage,
                observed_under_rate = EXCLUDED.observed_under_rate,
                observed_over_rate = EXCLUDED.observed_over_rate,
                sample_lines = EXCLUDED.sample_lines,
                fold_count = EXCLUDED.fold_count,
                last_backtest_at = EXCLUDED.last_backtest_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&row.route_number)
        .bind(&row.schedule_key)
        .bind(&row.source)
        .bind(&row.interval_name)
        .bind(row.band_scale_mult as f32)
        .bind(row.center_offset_units as f32)
        .bind(row.target_coverage as f32)
        .bind(row.observed_coverage.map(|v| v as f32))
        .bind(row.observed_under_rate.map(|v| v as f32))
        .bind(row.observed_over_rate.map(|v| v as f32))
        .bind(row.sample_lines.map(|v| v as i32))
        .bind(row.fold_count.map(|v| v as i32))
        .bind(row.last_backtest_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn last_calibration_update(
        &self,
        route: &str,
        interval: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let row: (Option<DateTime<Utc>>,) = sqlx::query_as(
            r#"
            SELECT MAX(updated_at)
            FROM forecast_band_calibration
            WHERE route_number = $1 AND interval_name = $2
            "#,
        )
        .bind(route)
        .bind(interval)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }
}
