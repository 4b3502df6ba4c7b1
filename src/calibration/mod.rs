//! Weekly uncertainty-band calibration.
//!
//! Keeps p10/p90 coverage near the target per route/schedule by correcting
//! the band scale through Normal-quantile inversion and the band center
//! through a skew-proportional shift. A parallel per-source pass runs the
//! same equations with tighter bounds.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use thiserror::Error;
use tracing::{debug, info};

use crate::backtest::{FoldMetrics, SourceBreakdownRow};
use crate::clock::Clock;
use crate::config::BandConfig;
use crate::domain::{BandCalibration, CenterCalibration, SourceCalibration};
use crate::storage::CalibrationStore;

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error(transparent)]
    Storage(#[from] crate::domain::CoreError),
}

pub type CalibrationResult<T> = std::result::Result<T, CalibrationError>;

/// Tunables for one calibration pass; defaults come from `BandConfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibratorSettings {
    pub target_coverage: f64,
    pub min_lines: u32,
    pub interval_name: String,
    pub min_scale: f64,
    pub max_scale: f64,
    pub damping: f64,
    pub center_damping: f64,
    pub max_center_step_units: f64,
    pub max_center_abs_units: f64,
    pub source_min_lines: u32,
    pub source_min_scale: f64,
    pub source_max_scale: f64,
    pub source_max_center_step_units: f64,
    pub min_days_between_runs: u32,
}

impl From<&BandConfig> for CalibratorSettings {
    fn from(config: &BandConfig) -> Self {
        Self {
            target_coverage: config.target_coverage,
            min_lines: config.min_lines,
            interval_name: config.interval_name.clone(),
            min_scale: config.scale_min,
            max_scale: config.scale_max,
            damping: config.damping,
            center_damping: config.center_damping,
            max_center_step_units: config.max_center_step_units,
            max_center_abs_units: config.center_offset_max_abs,
            source_min_lines: config.source_min_lines,
            source_min_scale: config.source_scale_min.max(0.5),
            source_max_scale: config.source_scale_max.min(4.0),
            source_max_center_step_units: config.source_max_center_step_units,
            min_days_between_runs: config.min_days_between_runs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum CalibrationOutcome {
    /// Last run is newer than the weekly cadence.
    SkippedRecent { days_since_last: f64 },
    /// The backtest produced no folds.
    NoData,
    Updated {
        schedules: Vec<ScheduleCalibrationReport>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleCalibrationReport {
    pub schedule_key: String,
    pub updated: bool,
    pub sample_lines: u32,
    pub fold_count: u32,
    pub observed_coverage: f64,
    pub old_scale: f64,
    pub new_scale: f64,
    pub old_center_offset_units: f64,
    pub new_center_offset_units: f64,
    pub drift: f64,
    pub skew: f64,
}

/// Damped multiplicative scale correction through the Normal quantile at the
/// central-coverage level. Equal observed and target coverage is a fixpoint.
pub fn compute_scale_update(
    old_scale: f64,
    observed_coverage: f64,
    target_coverage: f64,
    min_scale: f64,
    max_scale: f64,
    damping: f64,
) -> f64 {
    let obs = observed_coverage.clamp(0.01, 0.99);
    let tgt = target_coverage.clamp(0.01, 0.99);

    let normal = Normal::new(0.0, 1.0).expect("unit normal");
    let z_obs = normal.inverse_cdf((1.0 + obs) / 2.0).max(0.05);
    let z_tgt = normal.inverse_cdf((1.0 + tgt) / 2.0);

    let damp = damping.clamp(0.1, 1.0);
    let factor = (z_tgt / z_obs).powf(damp);
    (old_scale * factor).clamp(min_scale, max_scale)
}

/// Additive center correction proportional to the over/under skew and half
/// the average band width, stepped and clamped.
pub fn compute_center_update(
    old_center: f64,
    under_rate: f64,
    over_rate: f64,
    avg_width_units: f64,
    center_damping: f64,
    max_step_units: f64,
    max_center_abs: f64,
) -> f64 {
    // Positive skew means actuals sit above the interval; shift up.
    let skew = over_rate - under_rate;
    let half_width = (avg_width_units / 2.0).max(1.0);
    let damp = center_damping.clamp(0.1, 1.0);
    let raw_step = skew * half_width * damp;
    let step = raw_step.clamp(-max_step_units, max_step_units);
    (old_center + step).clamp(-max_center_abs, max_center_abs)
}

pub struct BandCalibrator {
    store: Arc<dyn CalibrationStore>,
    clock: Arc<dyn Clock>,
    settings: CalibratorSettings,
}

impl BandCalibrator {
    pub fn new(
        store: Arc<dyn CalibrationStore>,
        clock: Arc<dyn Clock>,
        settings: CalibratorSettings,
    ) -> Self {
        Self {
            store,
            clock,
            settings,
        }
    }

    /// Whether the weekly cadence allows a calibration run now. Callers use
    /// this to avoid running a backtest whose output would be discarded.
    pub async fn is_due(&self, route: &str) -> CalibrationResult<bool> {
        match self
            .store
            .last_calibration_update(route, &self.settings.interval_name)
            .await?
        {
            Some(last) => Ok(self.clock.now_utc() - last
                >= Duration::days(self.settings.min_days_between_runs as i64)),
            None => Ok(true),
        }
    }

    /// Skip when the route's most recent calibration row is younger than the
    /// weekly cadence; otherwise calibrate.
    pub async fn calibrate_route_if_due(
        &self,
        route: &str,
        folds: &[FoldMetrics],
        sources: &[SourceBreakdownRow],
    ) -> CalibrationResult<CalibrationOutcome> {
        if let Some(last) = self
            .store
            .last_calibration_update(route, &self.settings.interval_name)
            .await?
        {
            let age = self.clock.now_utc() - last;
            if age < Duration::days(self.settings.min_days_between_runs as i64) {
                return Ok(CalibrationOutcome::SkippedRecent {
                    days_since_last: age.num_seconds() as f64 / 86_400.0,
                });
            }
        }
        self.calibrate_route(route, folds, sources).await
    }

    /// Unconditional calibration from backtest outputs.
    pub async fn calibrate_route(
        &self,
        route: &str,
        folds: &[FoldMetrics],
        sources: &[SourceBreakdownRow],
    ) -> CalibrationResult<CalibrationOutcome> {
        let route_folds: Vec<&FoldMetrics> =
            folds.iter().filter(|f| f.route_number == route).collect();
        if route_folds.is_empty() {
            return Ok(CalibrationOutcome::NoData);
        }

        let mut schedule_keys: Vec<String> = route_folds
            .iter()
            .map(|f| f.schedule_key.clone())
            .collect();
        schedule_keys.sort();
        schedule_keys.dedup();

        let now = self.clock.now_utc();
        let mut reports = Vec::new();

        for schedule_key in schedule_keys {
            let group: Vec<&&FoldMetrics> = route_folds
                .iter()
                .filter(|f| f.schedule_key == schedule_key)
                .collect();
            let fold_count = group.len() as u32;
            let lines: u32 = group.iter().map(|f| f.line_items_eval_count).sum();
            let observed = mean(group.iter().map(|f| f.line_band_coverage_10_90));
            let under_rate = mean(group.iter().map(|f| f.line_band_under_rate_10_90));
            let over_rate = mean(group.iter().map(|f| f.line_band_over_rate_10_90));
            let avg_width = mean(group.iter().map(|f| f.line_band_avg_width_units_10_90));
            let drift = self.settings.target_coverage - observed;
            let skew = over_rate - under_rate;

            let old_scale = self
                .store
                .band_calibration_get(route, &schedule_key, &self.settings.interval_name)
                .await?
                .map(|row| row.band_scale)
                .unwrap_or(1.0);
            let old_center = self
                .store
                .center_calibration_get(route, &schedule_key, &self.settings.interval_name)
                .await?
                .map(|row| row.center_offset_units)
                .unwrap_or(0.0);

            if lines < self.settings.min_lines {
                debug!(
                    route,
                    schedule = %schedule_key,
                    lines,
                    min_lines = self.settings.min_lines,
                    "insufficient lines; calibration unchanged"
                );
                reports.push(ScheduleCalibrationReport {
                    schedule_key,
                    updated: false,
                    sample_lines: lines,
                    fold_count,
                    observed_coverage: observed,
                    old_scale,
                    new_scale: old_scale,
                    old_center_offset_units: old_center,
                    new_center_offset_units: old_center,
                    drift,
                    skew,
                });
                continue;
            }

            let new_scale = compute_scale_update(
                old_scale,
                observed,
                self.settings.target_coverage,
                self.settings.min_scale,
                self.settings.max_scale,
                self.settings.damping,
            );
            let new_center = compute_center_update(
                old_center,
                under_rate,
                over_rate,
                avg_width,
                self.settings.center_damping,
                self.settings.max_center_step_units,
                self.settings.max_center_abs_units,
            );
            let notes = format!(
                "coverage_drift={drift:+.4}; under_rate={under_rate:.4}; \
                 over_rate={over_rate:.4}; skew(over-under)={skew:+.4}; \
                 avg_width={avg_width:.4}; center_offset={new_center:+.4}"
            );

            self.store
                .band_calibration_upsert(&BandCalibration {
                    route_number: route.to_string(),
                    schedule_key: schedule_key.clone(),
                    interval_name: self.settings.interval_name.clone(),
                    band_scale: new_scale,
                    target_coverage: self.settings.target_coverage,
                    observed_coverage: Some(observed),
                    under_rate: Some(under_rate),
                    over_rate: Some(over_rate),
                    sample_lines: Some(lines),
                    fold_count: Some(fold_count),
                    notes: Some(notes.clone()),
                    last_backtest_at: Some(now),
                    updated_at: now,
                })
                .await?;
            self.store
                .center_calibration_upsert(&CenterCalibration {
                    route_number: route.to_string(),
                    schedule_key: schedule_key.clone(),
                    interval_name: self.settings.interval_name.clone(),
                    center_offset_units: new_center,
                    observed_under_rate: Some(under_rate),
                    observed_over_rate: Some(over_rate),
                    sample_lines: Some(lines),
                    fold_count: Some(fold_count),
                    notes: Some(notes),
                    last_backtest_at: Some(now),
                    updated_at: now,
                })
                .await?;

            info!(
                route,
                schedule = %schedule_key,
                coverage = observed,
                old_scale,
                new_scale,
                drift,
                skew,
                "band calibration updated"
            );
            reports.push(ScheduleCalibrationReport {
                schedule_key,
                updated: true,
                sample_lines: lines,
                fold_count,
                observed_coverage: observed,
                old_scale,
                new_scale,
                old_center_offset_units: old_center,
                new_center_offset_units: new_center,
                drift,
                skew,
            });
        }

        self.calibrate_sources(route, sources, now).await?;

        Ok(CalibrationOutcome::Updated { schedules: reports })
    }

    /// Source-segmented pass, weighted by line count, excluding the
    /// synthetic `missing_pred` rows.
    async fn calibrate_sources(
        &self,
        route: &str,
        sources: &[SourceBreakdownRow],
        now: DateTime<Utc>,
    ) -> CalibrationResult<()> {
        let mut groups: Vec<(String, String)> = sources
            .iter()
            .filter(|row| row.route_number == route && row.source != "missing_pred")
            .map(|row| (row.schedule_key.clone(), row.source.clone()))
            .collect();
        groups.sort();
        groups.dedup();

        for (schedule_key, source) in groups {
            let rows: Vec<&SourceBreakdownRow> = sources
                .iter()
                .filter(|row| {
                    row.route_number == route
                        && row.schedule_key == schedule_key
                        && row.source == source
                })
                .collect();

            let sample_lines: u32 = rows.iter().map(|row| row.line_count).sum();
            if sample_lines < self.settings.source_min_lines {
                continue;
            }

            let weight_sum: f64 = rows.iter().map(|row| row.line_count as f64).sum();
            let weight_sum = if weight_sum > 0.0 { weight_sum } else { 1.0 };
            let weighted = |f: &dyn Fn(&SourceBreakdownRow) -> f64| -> f64 {
                rows.iter()
                    .map(|row| f(row) * row.line_count as f64)
                    .sum::<f64>()
                    / weight_sum
            };
            let observed = weighted(&|row| row.line_band_coverage_10_90);
            let under_rate = weighted(&|row| row.line_band_under_rate_10_90);
            let over_rate = weighted(&|row| row.line_band_over_rate_10_90);
            let avg_width = weighted(&|row| row.line_band_avg_width_units_10_90);
            let fold_count = {
                let mut folds: Vec<u32> = rows.iter().map(|row| row.fold_index).collect();
                folds.sort_unstable();
                folds.dedup();
                folds.len() as u32
            };

            let (old_scale, old_center) = self
                .store
                .source_calibrations(route, &schedule_key, &self.settings.interval_name)
                .await?
                .into_iter()
                .find(|row| row.source == source)
                .map(|row| (row.band_scale_mult, row.center_offset_units))
                .unwrap_or((1.0, 0.0));

            let new_scale = compute_scale_update(
                old_scale,
                observed,
                self.settings.target_coverage,
                self.settings.source_min_scale,
                self.settings.source_max_scale,
                self.settings.damping,
            );
            let new_center = compute_center_update(
                old_center,
                under_rate,
                over_rate,
                avg_width,
                self.settings.center_damping,
                self.settings.source_max_center_step_units,
                self.settings.max_center_abs_units,
            );

            self.store
                .source_calibration_upsert(&SourceCalibration {
                    route_number: route.to_string(),
                    schedule_key: schedule_key.clone(),
                    source: source.clone(),
                    interval_name: self.settings.interval_name.clone(),
                    band_scale_mult: new_scale,
                    center_offset_units: new_center,
                    target_coverage: self.settings.target_coverage,
                    observed_coverage: Some(observed),
                    observed_under_rate: Some(under_rate),
                    observed_over_rate: Some(over_rate),
                    sample_lines: Some(sample_lines),
                    fold_count: Some(fold_count),
                    last_backtest_at: Some(now),
                    updated_at: now,
                })
                .await?;
        }
        Ok(())
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let collected: Vec<f64> = values.collect();
    if collected.is_empty() {
        return 0.0;
    }
    collected.iter().sum::<f64>() / collected.len() as f64
}
