//! Order-cycle resolution: schedule keys, shape validation, and the
//! single-result next-delivery scan that enforces the serial forecast chain.

use std::collections::{BTreeMap, HashSet};

use chrono::{Duration, NaiveDate};
use thiserror::Error;

use crate::domain::{OrderCycle, Weekday};

/// How far ahead the next-delivery scan looks. Two weeks handles the case
/// where the current week's delivery is already ordered.
pub const DELIVERY_SCAN_DAYS: i64 = 14;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("no_matching_cycle: no cycle delivers on {weekday} for route {route}")]
    NoMatchingCycle { route: String, weekday: String },

    #[error("no active cycles configured for route {route}")]
    NoCycles { route: String },
}

/// Structural summary of a route's cycle configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleShape {
    pub is_valid: bool,
    pub invalid_cycles: u32,
    /// Same order day mapping to more than one delivery day.
    pub same_order_to_multi_delivery: bool,
}

/// Resolve the canonical order-day schedule key for a delivery date.
///
/// Matches the cycle whose delivery day equals the date's weekday, falling
/// back to the load day for routes with same-day delivery.
pub fn schedule_key_for_delivery(
    route: &str,
    cycles: &[OrderCycle],
    delivery_date: NaiveDate,
) -> Result<&'static str, ScheduleError> {
    if cycles.is_empty() {
        return Err(ScheduleError::NoCycles {
            route: route.to_string(),
        });
    }
    let weekday = Weekday::from_date(delivery_date);
    for cycle in cycles {
        if cycle.delivery_day == weekday || cycle.load_day == weekday {
            return Ok(cycle.schedule_key());
        }
    }
    Err(ScheduleError::NoMatchingCycle {
        route: route.to_string(),
        weekday: weekday.key().to_string(),
    })
}

/// Validity and ambiguity summary used by the branch selector.
pub fn summarize_shape(cycles: &[OrderCycle], schedule_key: &str) -> ScheduleShape {
    let relevant: Vec<&OrderCycle> = cycles
        .iter()
        .filter(|c| c.schedule_key() == schedule_key)
        .collect();

    let invalid_cycles = relevant.iter().filter(|c| !c.is_valid()).count() as u32;

    let mut delivery_days_by_order: BTreeMap<u8, HashSet<u8>> = BTreeMap::new();
    for cycle in cycles {
        delivery_days_by_order
            .entry(cycle.order_day.number())
            .or_default()
            .insert(cycle.delivery_day.number());
    }
    let same_order_to_multi_delivery = delivery_days_by_order
        .values()
        .any(|deliveries| deliveries.len() > 1);

    ScheduleShape {
        is_valid: invalid_cycles == 0 && !relevant.is_empty(),
        invalid_cycles,
        same_order_to_multi_delivery,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextDelivery {
    pub delivery_date: NaiveDate,
    pub schedule_key: String,
    pub delivery_day: Weekday,
}

/// Return at most one upcoming delivery: the chronologically soonest future
/// delivery day whose (schedule_key, delivery_date) has no finalized order.
///
/// Returning a single candidate enforces serial forecast generation across
/// cycles: Forecast(A) -> Order(A) -> Forecast(B) -> Order(B) -> Retrain.
pub fn next_unordered_delivery(
    cycles: &[OrderCycle],
    today: NaiveDate,
    ordered: &HashSet<(String, NaiveDate)>,
) -> Option<NextDelivery> {
    let mut candidates: Vec<NextDelivery> = Vec::new();

    for cycle in cycles {
        let schedule_key = cycle.schedule_key().to_string();
        for offset in 1..=DELIVERY_SCAN_DAYS {
            let check_date = today + Duration::days(offset);
            if Weekday::from_date(check_date) != cycle.delivery_day {
                continue;
            }
            if ordered.contains(&(schedule_key.clone(), check_date)) {
                // Already finalized; look at next week's occurrence.
                continue;
            }
            candidates.push(NextDelivery {
                delivery_date: check_date,
                schedule_key: schedule_key.clone(),
                delivery_day: cycle.delivery_day,
            });
            break;
        }
    }

    candidates.sort_by(|a, b| {
        a.delivery_date
            .cmp(&b.delivery_date)
            .then_with(|| a.schedule_key.cmp(&b.schedule_key))
    });
    candidates.into_iter().next()
}

/// Days from one delivery weekday to the route's next delivery weekday.
/// Single-delivery routes wrap a full week.
pub fn days_until_next_delivery(cycles: &[OrderCycle], current: Weekday) -> i64 {
    let mut delivery_days: Vec<u8> = cycles.iter().map(|c| c.delivery_day.number()).collect();
    delivery_days.sort();
    delivery_days.dedup();
    if delivery_days.len() <= 1 {
        return 7;
    }
    for &day in &delivery_days {
        if day > current.number() {
            return (day - current.number()) as i64;
        }
    }
    (7 - current.number() + delivery_days[0]) as i64
}

/// Median gap in days between consecutive distinct delivery dates. Used as
/// the training-row `days_until_next_delivery` default (4 when history is
/// too short).
pub fn median_delivery_gap(mut delivery_dates: Vec<NaiveDate>) -> i64 {
    delivery_dates.sort();
    delivery_dates.dedup();
    if delivery_dates.len() < 2 {
        return 4;
    }
    let mut gaps: Vec<i64> = delivery_dates
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).num_days().max(1))
        .collect();
    gaps.sort();
    let mid = gaps.len() / 2;
    if gaps.len() % 2 == 1 {
        gaps[mid]
    } else {
        ((gaps[mid - 1] + gaps[mid]) as f64 / 2.0).round() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_cycle_route() -> Vec<OrderCycle> {
        vec![
            OrderCycle::new(1, 3, 4).unwrap(), // monday order -> thursday delivery
            OrderCycle::new(2, 5, 1).unwrap(), // tuesday order -> monday delivery
        ]
    }

    #[test]
    fn schedule_key_matches_delivery_day() {
        let cycles = two_cycle_route();
        // Thursday 2025-01-30 delivers the monday-ordered cycle.
        let key = schedule_key_for_delivery(
            "989262",
            &cycles,
            NaiveDate::from_ymd_opt(2025, 1, 30).unwrap(),
        )
        .unwrap();
        assert_eq!(key, "monday");
    }

    #[test]
    fn schedule_key_falls_back_to_load_day() {
        // Same-day delivery store: only the load day matches Friday.
        let cycles = vec![OrderCycle::new(2, 5, 1).unwrap()];
        let key = schedule_key_for_delivery(
            "989262",
            &cycles,
            NaiveDate::from_ymd_opt(2025, 1, 31).unwrap(), // a Friday
        )
        .unwrap();
        assert_eq!(key, "tuesday");
    }

    #[test]
    fn unmatched_delivery_day_errors() {
        let cycles = two_cycle_route();
        let err = schedule_key_for_delivery(
            "989262",
            &cycles,
            NaiveDate::from_ymd_opt(2025, 2, 1).unwrap(), // a Saturday
        )
        .unwrap_err();
        assert!(matches!(err, ScheduleError::NoMatchingCycle { .. }));
    }

    #[test]
    fn next_delivery_returns_single_soonest() {
        let cycles = two_cycle_route();
        // Tuesday 2025-01-28: Thursday Jan 30 (monday schedule) beats
        // Monday Feb 3 (tuesday schedule).
        let today = NaiveDate::from_ymd_opt(2025, 1, 28).unwrap();
        let next = next_unordered_delivery(&cycles, today, &HashSet::new()).unwrap();
        assert_eq!(
            next.delivery_date,
            NaiveDate::from_ymd_opt(2025, 1, 30).unwrap()
        );
        assert_eq!(next.schedule_key, "monday");
    }

    #[test]
    fn next_delivery_skips_finalized_and_advances_a_week() {
        let cycles = two_cycle_route();
        let today = NaiveDate::from_ymd_opt(2025, 1, 28).unwrap();
        let mut ordered = HashSet::new();
        ordered.insert((
            "monday".to_string(),
            NaiveDate::from_ymd_opt(2025, 1, 30).unwrap(),
        ));
        let next = next_unordered_delivery(&cycles, today, &ordered).unwrap();
        // Thursday already ordered; the soonest unordered is Monday Feb 3.
        assert_eq!(
            next.delivery_date,
            NaiveDate::from_ymd_opt(2025, 2, 3).unwrap()
        );
        assert_eq!(next.schedule_key, "tuesday");
    }

    #[test]
    fn serial_chain_after_thursday_finalizes() {
        let cycles = two_cycle_route();
        // Friday after the Thursday order was finalized: Monday is next.
        let friday = NaiveDate::from_ymd_opt(2025, 1, 31).unwrap();
        let mut ordered = HashSet::new();
        ordered.insert((
            "monday".to_string(),
            NaiveDate::from_ymd_opt(2025, 1, 30).unwrap(),
        ));
        let next = next_unordered_delivery(&cycles, friday, &ordered).unwrap();
        assert_eq!(next.schedule_key, "tuesday");
        assert_eq!(
            next.delivery_date,
            NaiveDate::from_ymd_opt(2025, 2, 3).unwrap()
        );
    }

    #[test]
    fn shape_flags_inverted_and_ambiguous_cycles() {
        let cycles = vec![
            OrderCycle::new(5, 6, 2).unwrap(), // friday order -> tuesday delivery
            OrderCycle::new(1, 2, 3).unwrap(),
            OrderCycle::new(1, 4, 5).unwrap(), // same order day, second delivery
        ];
        let shape = summarize_shape(&cycles, "friday");
        assert!(!shape.is_valid);
        assert_eq!(shape.invalid_cycles, 1);
        assert!(shape.same_order_to_multi_delivery);

        let monday_shape = summarize_shape(&cycles, "monday");
        assert!(monday_shape.is_valid);
    }

    #[test]
    fn median_gap() {
        let dates = vec![
            NaiveDate::from_ymd_opt(2025, 1, 2).unwrap(),
            NaiveDate::from_ymd_opt(2025, 1, 6).unwrap(),
            NaiveDate::from_ymd_opt(2025, 1, 9).unwrap(),
            NaiveDate::from_ymd_opt(2025, 1, 13).unwrap(),
        ];
        assert_eq!(median_delivery_gap(dates), 4);
        assert_eq!(median_delivery_gap(vec![]), 4);
    }
}
