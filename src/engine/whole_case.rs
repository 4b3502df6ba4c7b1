//! Whole-case enforcement: route-level SAP totals must land on case-pack
//! multiples, with the residual absorbed by a deterministic store.

use std::collections::{BTreeMap, HashMap};

use crate::domain::{ForecastItem, WholeCaseAdjustment};

use super::{EngineError, EngineResult};

#[derive(Debug, Clone)]
pub struct WholeCasePolicy {
    /// Round up only when the increment is at most this fraction of the case
    /// pack; otherwise round down.
    pub round_up_fraction: f64,
}

impl Default for WholeCasePolicy {
    fn default() -> Self {
        Self {
            round_up_fraction: 0.75,
        }
    }
}

fn rounded_target(total: u32, case_pack: u32, policy: &WholeCasePolicy) -> u32 {
    let remainder = total % case_pack;
    if remainder == 0 {
        return total;
    }
    let increment = case_pack - remainder;
    if increment as f64 <= policy.round_up_fraction * case_pack as f64 {
        total + increment
    } else {
        total - remainder
    }
}

/// Adjust items in place so every SAP total is a non-negative multiple of its
/// case pack. The absorber is the store with the largest pre-enforcement
/// demand (ties: lexicographically smallest store id); when a reduction
/// cannot be absorbed without violating floors, the total is rounded up
/// instead. Fails with `WholeCaseInvariantViolation` when no assignment
/// satisfies the invariant: a SAP whose floor demands units while every
/// store sits at zero has nothing to absorb the increase.
pub fn enforce_whole_cases(
    items: &mut [ForecastItem],
    case_packs: &HashMap<String, u32>,
    floors: &HashMap<(String, String), u32>,
    policy: &WholeCasePolicy,
) -> EngineResult<()> {
    // Indices per SAP, deterministic order.
    let mut by_sap: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (idx, item) in items.iter().enumerate() {
        by_sap.entry(item.sap.clone()).or_default().push(idx);
    }

    for (sap, indices) in by_sap {
        let case_pack = case_packs.get(&sap).copied().unwrap_or(1);
        if case_pack <= 1 {
            continue;
        }
        let total: u32 = indices.iter().map(|&i| items[i].recommended_units).sum();
        if total == 0 {
            // The sum cannot be increased from zero; a floor that still
            // demands units for this SAP is unsatisfiable.
            let floor_demands_units = floors
                .iter()
                .any(|((_, floor_sap), min_units)| *floor_sap == sap && *min_units > 0);
            if floor_demands_units {
                return Err(EngineError::WholeCaseInvariantViolation {
                    sap,
                    total: 0,
                    case_pack,
                });
            }
            continue;
        }
        if total % case_pack == 0 {
            continue;
        }

        let mut target = rounded_target(total, case_pack, policy);

        // Absorber: largest pre-enforcement demand, ties by smallest id.
        let absorber = indices
            .iter()
            .copied()
            .max_by(|&a, &b| {
                items[a]
                    .recommended_units
                    .cmp(&items[b].recommended_units)
                    .then_with(|| items[b].store_id.cmp(&items[a].store_id))
            })
            .expect("non-empty sap group");

        if target < total {
            // Check the reduction is absorbable without crossing a floor.
            let deficit = total - target;
            let floor = floors
                .get(&(items[absorber].store_id.clone(), sap.clone()))
                .copied()
                .unwrap_or(0);
            if items[absorber].recommended_units < deficit
                || items[absorber].recommended_units - deficit < floor
            {
                // Reduction not absorbable; go up instead.
                target = total + (case_pack - total % case_pack);
            }
        }

        if target >= total {
            let increment = target - total;
            let pre = items[absorber].recommended_units;
            items[absorber].recommended_units = pre + increment;
            items[absorber].whole_case_adjustment = Some(WholeCaseAdjustment {
                pre_units: pre,
                post_units: pre + increment,
                case_pack,
                trigger: "sap_total_round_up".to_string(),
                absorber_store_id: Some(items[absorber].store_id.clone()),
            });
        } else {
            let deficit = total - target;
            let pre = items[absorber].recommended_units;
            items[absorber].recommended_units = pre - deficit;
            items[absorber].whole_case_adjustment = Some(WholeCaseAdjustment {
                pre_units: pre,
                post_units: pre - deficit,
                case_pack,
                trigger: "sap_total_round_down".to_string(),
                absorber_store_id: Some(items[absorber].store_id.clone()),
            });
        }

        // Keep recommended_cases in sync for every touched line.
        for &i in &indices {
            items[i].recommended_cases =
                Some(items[i].recommended_units as f64 / case_pack as f64);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SourceTag;

    fn item(store: &str, sap: &str, units: u32) -> ForecastItem {
        ForecastItem {
            store_id: store.to_string(),
            store_name: format!("Store {store}"),
            sap: sap.to_string(),
            recommended_units: units,
            recommended_cases: None,
            p10_units: units as f64 * 0.7,
            p50_units: units as f64,
            p90_units: units as f64 * 1.3,
            promo_active: false,
            promo_lift_pct: None,
            is_first_weekend: None,
            confidence: 0.8,
            source: SourceTag::ScheduleAware,
            prior_order_context: None,
            last_order_quantity: None,
            expiry_replacement: None,
            whole_case_adjustment: None,
            extras: serde_json::Map::new(),
        }
    }

    fn case_packs(sap: &str, pack: u32) -> HashMap<String, u32> {
        let mut out = HashMap::new();
        out.insert(sap.to_string(), pack);
        out
    }

    #[test]
    fn sap_total_rounds_up_within_threshold() {
        // Units 5 + 7 + 3 = 15 with case pack 12: increment 9 <= 0.75 * 12,
        // so the total rounds to 24 and the largest store absorbs it.
        let mut items = vec![
            item("s1", "31032", 5),
            item("s2", "31032", 7),
            item("s3", "31032", 3),
        ];
        enforce_whole_cases(
            &mut items,
            &case_packs("31032", 12),
            &HashMap::new(),
            &WholeCasePolicy::default(),
        )
        .unwrap();

        let total: u32 = items.iter().map(|i| i.recommended_units).sum();
        assert_eq!(total, 24);
        let absorber = items.iter().find(|i| i.store_id == "s2").unwrap();
        assert_eq!(absorber.recommended_units, 16);
        let adjustment = absorber.whole_case_adjustment.as_ref().unwrap();
        assert_eq!(adjustment.pre_units, 7);
        assert_eq!(adjustment.post_units, 16);
        assert_eq!(adjustment.absorber_store_id.as_deref(), Some("s2"));
    }

    #[test]
    fn sap_total_rounds_down_past_threshold() {
        // Total 26, case pack 12: increment 10 > 9, round down to 24.
        let mut items = vec![item("s1", "31032", 20), item("s2", "31032", 6)];
        enforce_whole_cases(
            &mut items,
            &case_packs("31032", 12),
            &HashMap::new(),
            &WholeCasePolicy::default(),
        )
        .unwrap();
        let total: u32 = items.iter().map(|i| i.recommended_units).sum();
        assert_eq!(total, 24);
        assert_eq!(items[0].recommended_units, 18);
    }

    #[test]
    fn ties_break_by_smallest_store_id() {
        let mut items = vec![item("s9", "31032", 5), item("s1", "31032", 5)];
        enforce_whole_cases(
            &mut items,
            &case_packs("31032", 12),
            &HashMap::new(),
            &WholeCasePolicy::default(),
        )
        .unwrap();
        let absorber = items
            .iter()
            .find(|i| i.whole_case_adjustment.is_some())
            .unwrap();
        assert_eq!(absorber.store_id, "s1");
    }

    #[test]
    fn floors_flip_round_down_to_round_up() {
        // Total 13, pack 12: increment 11 > 9 so round down to 12 would take
        // one unit from the absorber, but its floor forbids it.
        let mut items = vec![item("s1", "31032", 12), item("s2", "31032", 1)];
        let mut floors = HashMap::new();
        floors.insert(("s1".to_string(), "31032".to_string()), 12u32);
        enforce_whole_cases(
            &mut items,
            &case_packs("31032", 12),
            &floors,
            &WholeCasePolicy::default(),
        )
        .unwrap();
        let total: u32 = items.iter().map(|i| i.recommended_units).sum();
        assert_eq!(total, 24);
    }

    #[test]
    fn aligned_totals_are_untouched() {
        let mut items = vec![item("s1", "31032", 12), item("s2", "31032", 12)];
        enforce_whole_cases(
            &mut items,
            &case_packs("31032", 12),
            &HashMap::new(),
            &WholeCasePolicy::default(),
        )
        .unwrap();
        assert!(items.iter().all(|i| i.whole_case_adjustment.is_none()));
    }

    #[test]
    fn all_zero_group_with_floor_is_a_violation() {
        // Every store is at zero, so the floored demand cannot be absorbed.
        let mut items = vec![item("s1", "31032", 0), item("s2", "31032", 0)];
        let mut floors = HashMap::new();
        floors.insert(("s1".to_string(), "31032".to_string()), 12u32);
        let error = enforce_whole_cases(
            &mut items,
            &case_packs("31032", 12),
            &floors,
            &WholeCasePolicy::default(),
        )
        .unwrap_err();
        assert!(matches!(
            error,
            EngineError::WholeCaseInvariantViolation {
                total: 0,
                case_pack: 12,
                ..
            }
        ));
    }

    #[test]
    fn all_zero_group_without_floor_is_compliant() {
        let mut items = vec![item("s1", "31032", 0), item("s2", "31032", 0)];
        enforce_whole_cases(
            &mut items,
            &case_packs("31032", 12),
            &HashMap::new(),
            &WholeCasePolicy::default(),
        )
        .unwrap();
        assert!(items.iter().all(|i| i.recommended_units == 0));
        assert!(items.iter().all(|i| i.whole_case_adjustment.is_none()));
    }

    #[test]
    fn unit_case_pack_is_ignored() {
        let mut items = vec![item("s1", "31032", 5)];
        enforce_whole_cases(
            &mut items,
            &case_packs("31032", 1),
            &HashMap::new(),
            &WholeCasePolicy::default(),
        )
        .unwrap();
        assert_eq!(items[0].recommended_units, 5);
    }
}
