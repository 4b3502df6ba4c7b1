//! Row models mapped by `sqlx::query_as` and converted into domain types at
//! the adapter boundary.

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::FromRow;

use crate::domain::{
    AllocationRow, BandCalibration, CenterCalibration, CorrectionAggregate, PurgeCheckpoint,
    PurgeCheckpointStatus, RefreshState, RefreshStatus, SourceCalibration, SplitPattern,
    StoreItemShare,
};

#[derive(Debug, Clone, FromRow)]
pub struct OrderRow {
    pub order_id: String,
    pub route_number: String,
    pub schedule_key: String,
    pub delivery_date: NaiveDate,
    pub order_date: Option<NaiveDate>,
    pub status: String,
    pub is_holiday_week: bool,
    pub created_at: DateTime<Utc>,
    pub synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct LineItemRow {
    pub order_id: String,
    pub store_id: String,
    pub store_name: Option<String>,
    pub sap: String,
    pub quantity: i32,
    pub cases: Option<f32>,
    pub promo_active: bool,
    pub user_adjusted: bool,
    pub forecasted_units: Option<f32>,
    pub forecasted_cases: Option<f32>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ScheduleRow {
    pub schedule_key: String,
    pub order_day: i16,
    pub load_day: i16,
    pub delivery_day: i16,
}

#[derive(Debug, Clone, FromRow)]
pub struct CorrectionAggRow {
    pub store_id: String,
    pub sap: String,
    pub schedule_key: String,
    pub samples: i64,
    pub avg_delta: Option<f64>,
    pub avg_ratio: Option<f64>,
    pub ratio_stddev: Option<f64>,
    pub removal_rate: Option<f64>,
    pub promo_rate: Option<f64>,
}

impl From<CorrectionAggRow> for CorrectionAggregate {
    fn from(row: CorrectionAggRow) -> Self {
        CorrectionAggregate {
            store_id: row.store_id,
            sap: row.sap,
            schedule_key: row.schedule_key,
            samples: row.samples.max(0) as u32,
            avg_delta: row.avg_delta.unwrap_or(0.0),
            avg_ratio: row.avg_ratio.unwrap_or(0.0),
            ratio_stddev: row.ratio_stddev.unwrap_or(0.0),
            removal_rate: row.removal_rate.unwrap_or(0.0),
            promo_rate: row.promo_rate.unwrap_or(0.0),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ShareRow {
    pub store_id: String,
    pub sap: String,
    pub schedule_key: String,
    pub blended_share: f32,
    pub recent_share: f32,
    pub base_share: f32,
    pub trend: f32,
}

impl From<ShareRow> for StoreItemShare {
    fn from(row: ShareRow) -> Self {
        StoreItemShare {
            store_id: row.store_id,
            sap: row.sap,
            schedule_key: row.schedule_key,
            blended_share: row.blended_share as f64,
            recent_share: row.recent_share as f64,
            base_share: row.base_share as f64,
            trend: row.trend as f64,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct AllocationCacheRow {
    pub sap: String,
    pub split_pattern: String,
    pub primary_store_id: Option<String>,
    pub store_count: i32,
}

impl From<AllocationCacheRow> for AllocationRow {
    fn from(row: AllocationCacheRow) -> Self {
        let split_pattern = match row.split_pattern.as_str() {
            "single_store" => SplitPattern::SingleStore,
            "skewed" => SplitPattern::Skewed,
            "even_split" => SplitPattern::EvenSplit,
            _ => SplitPattern::Varies,
        };
        AllocationRow {
            sap: row.sap,
            split_pattern,
            primary_store_id: row.primary_store_id,
            store_count: row.store_count.max(0) as u32,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct BandCalibrationRow {
    pub route_number: String,
    pub schedule_key: String,
    pub interval_name: String,
    pub band_scale: f32,
    pub target_coverage: f32,
    pub observed_coverage: Option<f32>,
    pub under_rate: Option<f32>,
    pub over_rate: Option<f32>,
    pub sample_lines: Option<i32>,
    pub fold_count: Option<i32>,
    pub notes: Option<String>,
    pub last_backtest_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl From<BandCalibrationRow> for BandCalibration {
    fn from(row: BandCalibrationRow) -> Self {
        BandCalibration {
            route_number: row.route_number,
            schedule_key: row.schedule_key,
            interval_name: row.interval_name,
            band_scale: row.band_scale as f64,
            target_coverage: row.target_coverage as f64,
            observed_coverage: row.observed_coverage.map(f64::from),
            under_rate: row.under_rate.map(f64::from),
            over_rate: row.over_rate.map(f64::from),
            sample_lines: row.sample_lines.map(|v| v.max(0) as u32),
            fold_count: row.fold_count.map(|v| v.max(0) as u32),
            notes: row.notes,
            last_backtest_at: row.last_backtest_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct CenterCalibrationRow {
    pub route_number: String,
    pub schedule_key: String,
    pub interval_name: String,
    pub center_offset_units: f32,
    pub observed_under_rate: Option<f32>,
    pub observed_over_rate: Option<f32>,
    pub sample_lines: Option<i32>,
    pub fold_count: Option<i32>,
    pub notes: Option<String>,
    pub last_backtest_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl From<CenterCalibrationRow> for CenterCalibration {
    fn from(row: CenterCalibrationRow) -> Self {
        CenterCalibration {
            route_number: row.route_number,
            schedule_key: row.schedule_key,
            interval_name: row.interval_name,
            center_offset_units: row.center_offset_units as f64,
            observed_under_rate: row.observed_under_rate.map(f64::from),
            observed_over_rate: row.observed_over_rate.map(f64::from),
            sample_lines: row.sample_lines.map(|v| v.max(0) as u32),
            fold_count: row.fold_count.map(|v| v.max(0) as u32),
            notes: row.notes,
            last_backtest_at: row.last_backtest_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct SourceCalibrationRow {
    pub route_number: String,
    pub schedule_key: String,
    pub source: String,
    pub interval_name: String,
    pub band_scale_mult: f32,
    pub center_offset_units: f32,
    pub target_coverage: f32,
    pub observed_coverage: Option<f32>,
    pub observed_under_rate: Option<f32>,
    pub observed_over_rate: Option<f32>,
    pub sample_lines: Option<i32>,
    pub fold_count: Option<i32>,
    pub last_backtest_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl From<SourceCalibrationRow> for SourceCalibration {
    fn from(row: SourceCalibrationRow) -> Self {
        SourceCalibration {
            route_number: row.route_number,
            schedule_key: row.schedule_key,
            source: row.source,
            interval_name: row.interval_name,
            band_scale_mult: row.band_scale_mult as f64,
            center_offset_units: row.center_offset_units as f64,
            target_coverage: row.target_coverage as f64,
            observed_coverage: row.observed_coverage.map(f64::from),
            observed_under_rate: row.observed_under_rate.map(f64::from),
            observed_over_rate: row.observed_over_rate.map(f64::from),
            sample_lines: row.sample_lines.map(|v| v.max(0) as u32),
            fold_count: row.fold_count.map(|v| v.max(0) as u32),
            last_backtest_at: row.last_backtest_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct RefreshStateRow {
    pub route_number: String,
    pub last_refreshed_at: Option<DateTime<Utc>>,
    pub last_status: String,
    pub last_scorecard_file: Option<String>,
    pub last_folds_file: Option<String>,
    pub last_sources_file: Option<String>,
    pub last_fold_count: Option<i32>,
    pub last_error: Option<String>,
}

impl From<RefreshStateRow> for RefreshState {
    fn from(row: RefreshStateRow) -> Self {
        RefreshState {
            route_number: row.route_number,
            last_refreshed_at: row.last_refreshed_at,
            last_status: RefreshStatus::parse(&row.last_status),
            last_scorecard_file: row.last_scorecard_file,
            last_folds_file: row.last_folds_file,
            last_sources_file: row.last_sources_file,
            last_fold_count: row.last_fold_count.unwrap_or(0).max(0) as u32,
            last_error: row.last_error,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct PurgeCheckpointRow {
    pub route_number: String,
    pub delivery_number: String,
    pub status: String,
    pub event_id: String,
    pub worker_id: Option<String>,
    pub details: serde_json::Value,
    pub purged_at: Option<DateTime<Utc>>,
}

impl From<PurgeCheckpointRow> for PurgeCheckpoint {
    fn from(row: PurgeCheckpointRow) -> Self {
        PurgeCheckpoint {
            route_number: row.route_number,
            delivery_number: row.delivery_number,
            status: PurgeCheckpointStatus::parse(&row.status)
                .unwrap_or(PurgeCheckpointStatus::Failed),
            event_id: row.event_id,
            worker_id: row.worker_id,
            details: row.details,
            purged_at: row.purged_at,
        }
    }
}
