//! Operational mode resolution for a forecast request.
//!
//! The selector mirrors the progression a route goes through as history
//! accumulates: copy-last-order until the cold-start gates clear, then
//! schedule-aware, then store-centric once cross-schedule depth exists.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::ForecastConfig;
use crate::schedule::ScheduleShape;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForecastMode {
    CopyLastOrder,
    ScheduleAware,
    StoreCentric,
}

impl ForecastMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ForecastMode::CopyLastOrder => "copy_last_order",
            ForecastMode::ScheduleAware => "schedule_aware",
            ForecastMode::StoreCentric => "store_centric",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingScope {
    /// Same schedule only.
    ScheduleOnly,
    /// All schedules for the route's stores.
    StoreAllCycles,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeDecision {
    pub mode: ForecastMode,
    pub scope: TrainingScope,
    /// Machine-readable reason recorded on folds and forecasts.
    pub reason: String,
}

/// Inputs gathered by the caller; resolution itself is pure.
#[derive(Debug, Clone)]
pub struct ModeInputs {
    pub schedule_order_count: u32,
    pub corrected_order_count: u32,
    pub total_order_count: u32,
    /// Orders per schedule key across the training window.
    pub per_schedule_counts: HashMap<String, u32>,
    pub shape: ScheduleShape,
}

pub fn resolve_mode(inputs: &ModeInputs, config: &ForecastConfig) -> ModeDecision {
    if inputs.schedule_order_count < config.min_schedule_orders_for_ml
        || inputs.corrected_order_count < config.min_corrected_orders_for_ml
    {
        return ModeDecision {
            mode: ForecastMode::CopyLastOrder,
            scope: TrainingScope::ScheduleOnly,
            reason: format!(
                "cold_start:schedule_orders={}<{},corrected_orders={}<{}",
                inputs.schedule_order_count,
                config.min_schedule_orders_for_ml,
                inputs.corrected_order_count,
                config.min_corrected_orders_for_ml
            ),
        };
    }

    if config.strict_schedule_validation && !inputs.shape.is_valid {
        return ModeDecision {
            mode: ForecastMode::ScheduleAware,
            scope: TrainingScope::ScheduleOnly,
            reason: format!(
                "invalid_schedule_config:invalid_cycles={}",
                inputs.shape.invalid_cycles
            ),
        };
    }

    if !config.allow_store_context_on_ambiguous_schedule
        && inputs.shape.same_order_to_multi_delivery
    {
        return ModeDecision {
            mode: ForecastMode::ScheduleAware,
            scope: TrainingScope::ScheduleOnly,
            reason: "ambiguous_schedule_mapping:same_order_to_multi_delivery".to_string(),
        };
    }

    let schedules_meeting_min = inputs
        .per_schedule_counts
        .values()
        .filter(|count| **count >= config.store_context_min_per_schedule)
        .count() as u32;
    let depth_ok = inputs.total_order_count >= config.store_context_min_total_orders
        && schedules_meeting_min >= config.store_context_min_schedules;

    if depth_ok {
        ModeDecision {
            mode: ForecastMode::StoreCentric,
            scope: TrainingScope::StoreAllCycles,
            reason: "adaptive_depth_ok".to_string(),
        }
    } else {
        ModeDecision {
            mode: ForecastMode::ScheduleAware,
            scope: TrainingScope::ScheduleOnly,
            reason: "adaptive_depth_insufficient".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape_ok() -> ScheduleShape {
        ScheduleShape {
            is_valid: true,
            invalid_cycles: 0,
            same_order_to_multi_delivery: false,
        }
    }

    fn inputs(schedule: u32, corrected: u32, total: u32) -> ModeInputs {
        let mut per_schedule = HashMap::new();
        per_schedule.insert("monday".to_string(), total / 2);
        per_schedule.insert("thursday".to_string(), total - total / 2);
        ModeInputs {
            schedule_order_count: schedule,
            corrected_order_count: corrected,
            total_order_count: total,
            per_schedule_counts: per_schedule,
            shape: shape_ok(),
        }
    }

    #[test]
    fn cold_start_wins_over_everything() {
        let config = ForecastConfig::default();
        let decision = resolve_mode(&inputs(3, 0, 40), &config);
        assert_eq!(decision.mode, ForecastMode::CopyLastOrder);
        assert_eq!(decision.scope, TrainingScope::ScheduleOnly);
        assert!(decision.reason.starts_with("cold_start:"));
    }

    #[test]
    fn few_corrections_also_cold_start() {
        let config = ForecastConfig::default();
        let decision = resolve_mode(&inputs(10, 2, 40), &config);
        assert_eq!(decision.mode, ForecastMode::CopyLastOrder);
    }

    #[test]
    fn invalid_shape_forces_schedule_aware_when_strict() {
        let config = ForecastConfig::default();
        let mut i = inputs(10, 5, 40);
        i.shape = ScheduleShape {
            is_valid: false,
            invalid_cycles: 1,
            same_order_to_multi_delivery: false,
        };
        let decision = resolve_mode(&i, &config);
        assert_eq!(decision.mode, ForecastMode::ScheduleAware);
        assert!(decision.reason.starts_with("invalid_schedule_config"));
    }

    #[test]
    fn ambiguous_shape_blocks_store_context_when_flag_off() {
        let mut config = ForecastConfig::default();
        config.allow_store_context_on_ambiguous_schedule = false;
        let mut i = inputs(10, 5, 40);
        i.shape.same_order_to_multi_delivery = true;
        let decision = resolve_mode(&i, &config);
        assert_eq!(decision.mode, ForecastMode::ScheduleAware);
        assert!(decision.reason.starts_with("ambiguous_schedule_mapping"));
    }

    #[test]
    fn deep_history_selects_store_centric() {
        let config = ForecastConfig::default();
        let decision = resolve_mode(&inputs(10, 5, 40), &config);
        assert_eq!(decision.mode, ForecastMode::StoreCentric);
        assert_eq!(decision.scope, TrainingScope::StoreAllCycles);
    }

    #[test]
    fn shallow_history_falls_back_to_schedule_aware() {
        let config = ForecastConfig::default();
        let decision = resolve_mode(&inputs(10, 5, 12), &config);
        assert_eq!(decision.mode, ForecastMode::ScheduleAware);
        assert_eq!(decision.reason, "adaptive_depth_insufficient");
    }
}
