use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per (route, schedule, interval) uncertainty band width calibration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandCalibration {
    pub route_number: String,
    pub schedule_key: String,
    pub interval_name: String,
    pub band_scale: f64,
    pub target_coverage: f64,
    pub observed_coverage: Option<f64>,
    pub under_rate: Option<f64>,
    pub over_rate: Option<f64>,
    pub sample_lines: Option<u32>,
    pub fold_count: Option<u32>,
    pub notes: Option<String>,
    pub last_backtest_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Per (route, schedule, interval) additive center shift in units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CenterCalibration {
    pub route_number: String,
    pub schedule_key: String,
    pub interval_name: String,
    pub center_offset_units: f64,
    pub observed_under_rate: Option<f64>,
    pub observed_over_rate: Option<f64>,
    pub sample_lines: Option<u32>,
    pub fold_count: Option<u32>,
    pub notes: Option<String>,
    pub last_backtest_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Source-segmented calibration multipliers layered on top of the schedule
/// row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceCalibration {
    pub route_number: String,
    pub schedule_key: String,
    pub source: String,
    pub interval_name: String,
    pub band_scale_mult: f64,
    pub center_offset_units: f64,
    pub target_coverage: f64,
    pub observed_coverage: Option<f64>,
    pub observed_under_rate: Option<f64>,
    pub observed_over_rate: Option<f64>,
    pub sample_lines: Option<u32>,
    pub fold_count: Option<u32>,
    pub last_backtest_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshStatus {
    Never,
    Refreshed,
    NoData,
    Error,
}

impl RefreshStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RefreshStatus::Never => "never",
            RefreshStatus::Refreshed => "refreshed",
            RefreshStatus::NoData => "no_data",
            RefreshStatus::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "refreshed" => RefreshStatus::Refreshed,
            "no_data" => RefreshStatus::NoData,
            "error" => RefreshStatus::Error,
            _ => RefreshStatus::Never,
        }
    }
}

/// Weekly learning-snapshot bookkeeping per route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshState {
    pub route_number: String,
    pub last_refreshed_at: Option<DateTime<Utc>>,
    pub last_status: RefreshStatus,
    pub last_scorecard_file: Option<String>,
    pub last_folds_file: Option<String>,
    pub last_sources_file: Option<String>,
    pub last_fold_count: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurgeCheckpointStatus {
    Completed,
    Failed,
}

impl PurgeCheckpointStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PurgeCheckpointStatus::Completed => "completed",
            PurgeCheckpointStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "completed" => Some(PurgeCheckpointStatus::Completed),
            "failed" => Some(PurgeCheckpointStatus::Failed),
            _ => None,
        }
    }
}

/// Per (route, delivery) purge progress marker enabling at-most-once
/// deletion with safe retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeCheckpoint {
    pub route_number: String,
    pub delivery_number: String,
    pub status: PurgeCheckpointStatus,
    pub event_id: String,
    pub worker_id: Option<String>,
    pub details: serde_json::Value,
    pub purged_at: Option<DateTime<Utc>>,
}
