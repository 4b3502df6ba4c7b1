//! Application of persisted band calibration to predicted lines.

use std::collections::HashMap;

use crate::config::BandConfig;
use crate::domain::{Order, SourceTag};
use crate::storage::CalibrationStore;

use super::EngineResult;

/// Calibration snapshot for one (route, schedule): the schedule-level scale
/// and center plus per-source multipliers.
#[derive(Debug, Clone)]
pub struct BandAdjustments {
    pub band_scale: f64,
    pub center_offset_units: f64,
    /// source tag -> (scale multiplier, extra center offset)
    pub per_source: HashMap<String, (f64, f64)>,
}

impl Default for BandAdjustments {
    fn default() -> Self {
        Self {
            band_scale: 1.0,
            center_offset_units: 0.0,
            per_source: HashMap::new(),
        }
    }
}

impl BandAdjustments {
    /// Load the persisted calibration, clamped to configured bounds.
    /// Disabled calibration yields the identity adjustment.
    pub async fn load(
        store: &dyn CalibrationStore,
        config: &BandConfig,
        route: &str,
        schedule: &str,
    ) -> EngineResult<Self> {
        if !config.enabled {
            return Ok(Self::default());
        }

        let band_scale = store
            .band_calibration_get(route, schedule, &config.interval_name)
            .await?
            .map(|row| row.band_scale.clamp(config.scale_min, config.scale_max))
            .unwrap_or(1.0);

        let center_offset_units = store
            .center_calibration_get(route, schedule, &config.interval_name)
            .await?
            .map(|row| {
                row.center_offset_units
                    .clamp(-config.center_offset_max_abs, config.center_offset_max_abs)
            })
            .unwrap_or(0.0);

        let mut per_source = HashMap::new();
        for row in store
            .source_calibrations(route, schedule, &config.interval_name)
            .await?
        {
            let scale = row
                .band_scale_mult
                .clamp(config.source_scale_min, config.source_scale_max);
            let center = row
                .center_offset_units
                .clamp(-config.center_offset_max_abs, config.center_offset_max_abs);
            per_source.insert(row.source, (scale, center));
        }

        Ok(Self {
            band_scale,
            center_offset_units,
            per_source,
        })
    }

    fn source_adjustment(&self, source: SourceTag) -> (f64, f64) {
        self.per_source
            .get(source.as_str())
            .copied()
            .unwrap_or((1.0, 0.0))
    }
}

/// Scale the band around p50, shift by the combined center offset, clamp to
/// zero, and restore monotonicity. Returns (p10, p50, p90).
pub fn apply_band_adjustments(
    adjustments: &BandAdjustments,
    source: SourceTag,
    p10: f64,
    p50: f64,
    p90: f64,
) -> (f64, f64, f64) {
    let (source_scale, source_center) = adjustments.source_adjustment(source);
    let scale = (adjustments.band_scale * source_scale).max(0.1);

    let lo_span = (p50 - p10).max(0.0);
    let hi_span = (p90 - p50).max(0.0);
    let mut p10 = p50 - lo_span * scale;
    let mut p90 = p50 + hi_span * scale;
    let mut p50 = p50;

    let offset = adjustments.center_offset_units + source_center;
    if offset.abs() > 1e-9 {
        p10 = (p10 + offset).max(0.0);
        p50 = (p50 + offset).max(0.0);
        p90 = (p90 + offset).max(p50);
    }
    p10 = p10.max(0.0);

    if p10 > p90 {
        std::mem::swap(&mut p10, &mut p90);
    }
    let p50 = p50.clamp(p10, p90);
    (p10, p50, p90)
}

/// Conservative per-SAP p90 fallback for lines without a model band:
/// `max(2 * case_pack, q90(units), mean + std)` over route history.
pub fn cold_start_p90_by_sap(
    orders: &[Order],
    case_packs: &HashMap<String, u32>,
) -> HashMap<String, u32> {
    let mut units_by_sap: HashMap<String, Vec<f64>> = HashMap::new();
    for order in orders {
        for store in &order.stores {
            for item in &store.items {
                if item.units > 0 {
                    units_by_sap
                        .entry(item.sap.clone())
                        .or_default()
                        .push(item.units as f64);
                }
            }
        }
    }

    units_by_sap
        .into_iter()
        .map(|(sap, mut units)| {
            units.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let case_pack = case_packs.get(&sap).copied().unwrap_or(1).max(1) as f64;
            let pos = 0.90 * (units.len() - 1) as f64;
            let q90 = units[pos.round() as usize];
            let mean = units.iter().sum::<f64>() / units.len() as f64;
            let variance =
                units.iter().map(|u| (u - mean) * (u - mean)).sum::<f64>() / units.len() as f64;
            let fallback = (case_pack * 2.0).max(q90).max(mean + variance.sqrt());
            (sap, fallback.round().max(1.0) as u32)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_adjustment_is_noop() {
        let adj = BandAdjustments::default();
        let (p10, p50, p90) =
            apply_band_adjustments(&adj, SourceTag::ScheduleAware, 4.0, 10.0, 18.0);
        assert_eq!((p10, p50, p90), (4.0, 10.0, 18.0));
    }

    #[test]
    fn scale_widens_band_around_p50() {
        let adj = BandAdjustments {
            band_scale: 2.0,
            ..Default::default()
        };
        let (p10, p50, p90) =
            apply_band_adjustments(&adj, SourceTag::ScheduleAware, 8.0, 10.0, 13.0);
        assert_eq!(p50, 10.0);
        assert_eq!(p10, 6.0);
        assert_eq!(p90, 16.0);
    }

    #[test]
    fn source_multiplier_stacks_on_schedule_scale() {
        let mut per_source = HashMap::new();
        per_source.insert("slow_intermittent".to_string(), (2.0, 0.0));
        let adj = BandAdjustments {
            band_scale: 1.5,
            center_offset_units: 0.0,
            per_source,
        };
        let (p10, _, p90) =
            apply_band_adjustments(&adj, SourceTag::SlowIntermittent, 9.0, 10.0, 11.0);
        // Combined scale is 3.0: spans of 1 widen to 3.
        assert_eq!(p10, 7.0);
        assert_eq!(p90, 13.0);
    }

    #[test]
    fn center_shift_clamps_at_zero_and_stays_monotone() {
        let adj = BandAdjustments {
            band_scale: 1.0,
            center_offset_units: -8.0,
            per_source: HashMap::new(),
        };
        let (p10, p50, p90) =
            apply_band_adjustments(&adj, SourceTag::ScheduleAware, 2.0, 5.0, 9.0);
        assert!(p10 >= 0.0);
        assert!(p10 <= p50 && p50 <= p90);
    }
}
