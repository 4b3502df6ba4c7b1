use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Day of week in cycle arithmetic, 1 = Monday .. 7 = Sunday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Weekday(pub u8);

impl Weekday {
    pub const MONDAY: Weekday = Weekday(1);
    pub const SUNDAY: Weekday = Weekday(7);

    pub fn new(day: u8) -> Option<Self> {
        (1..=7).contains(&day).then_some(Self(day))
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self(date.weekday().number_from_monday() as u8)
    }

    pub fn number(self) -> u8 {
        self.0
    }

    /// Lowercase weekday name used as the schedule key namespace.
    pub fn key(self) -> &'static str {
        match self.0 {
            1 => "monday",
            2 => "tuesday",
            3 => "wednesday",
            4 => "thursday",
            5 => "friday",
            6 => "saturday",
            _ => "sunday",
        }
    }
}

/// One routing of goods from order to shelf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCycle {
    pub order_day: Weekday,
    pub load_day: Weekday,
    pub delivery_day: Weekday,
}

impl OrderCycle {
    pub fn new(order_day: u8, load_day: u8, delivery_day: u8) -> Option<Self> {
        Some(Self {
            order_day: Weekday::new(order_day)?,
            load_day: Weekday::new(load_day)?,
            delivery_day: Weekday::new(delivery_day)?,
        })
    }

    /// Canonical schedule key: derived from the order day.
    pub fn schedule_key(&self) -> &'static str {
        self.order_day.key()
    }

    /// Valid when delivery does not precede order within the cycle week.
    pub fn is_valid(&self) -> bool {
        self.delivery_day.number() >= self.order_day.number()
    }
}

/// Route identity and active cycles. Routes are created on first finalized
/// order and never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub route_number: String,
    pub user_id: Option<String>,
    pub cycles: Vec<OrderCycle>,
    pub timezone: Option<String>,
}

impl Route {
    /// Route numbers are numeric strings, 1-10 digits.
    pub fn is_valid_route_number(raw: &str) -> bool {
        !raw.is_empty() && raw.len() <= 10 && raw.bytes().all(|b| b.is_ascii_digit())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Draft,
    Finalized,
    Deleted,
}

impl OrderStatus {
    /// Status transitions are monotonic; `finalized -> draft` is disallowed.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        match (self, next) {
            (OrderStatus::Draft, _) => true,
            (OrderStatus::Finalized, OrderStatus::Draft) => false,
            (OrderStatus::Finalized, _) => true,
            (OrderStatus::Deleted, OrderStatus::Deleted) => true,
            (OrderStatus::Deleted, _) => false,
        }
    }
}

/// A single ordered line within a store order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItem {
    pub sap: String,
    pub units: u32,
    pub cases: Option<f64>,
    #[serde(default)]
    pub promo_active: bool,
    #[serde(default)]
    pub user_adjusted: bool,
    pub forecasted_units: Option<f64>,
    pub forecasted_cases: Option<f64>,
}

impl LineItem {
    /// `user_adjusted` must hold exactly when the final units differ from the
    /// forecast that seeded the draft.
    pub fn adjustment_flag_consistent(&self) -> bool {
        match self.forecasted_units {
            Some(forecasted) => {
                self.user_adjusted == ((forecasted - self.units as f64).abs() > f64::EPSILON)
            }
            None => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreOrder {
    pub store_id: String,
    pub store_name: String,
    pub items: Vec<LineItem>,
    pub entered_at: Option<DateTime<Utc>>,
}

/// A finalized or draft order for one delivery of one schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub route_number: String,
    pub schedule_key: String,
    pub delivery_date: NaiveDate,
    pub order_date: Option<NaiveDate>,
    pub status: OrderStatus,
    pub is_holiday_week: bool,
    pub stores: Vec<StoreOrder>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Order {
    /// Total units per (store_id, sap), dropping zero-quantity lines.
    pub fn line_units(&self) -> BTreeMap<(String, String), u32> {
        let mut out = BTreeMap::new();
        for store in &self.stores {
            if store.store_id.is_empty() {
                continue;
            }
            for item in &store.items {
                if item.sap.is_empty() || item.units == 0 {
                    continue;
                }
                *out.entry((store.store_id.clone(), item.sap.clone()))
                    .or_insert(0) += item.units;
            }
        }
        out
    }
}

/// User correction/feedback row tied to a forecast line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Correction {
    pub forecast_id: String,
    pub order_id: String,
    pub route_number: String,
    pub schedule_key: String,
    pub delivery_date: NaiveDate,
    pub store_id: String,
    pub sap: String,
    pub predicted_units: f64,
    pub final_units: f64,
    #[serde(default)]
    pub was_removed: bool,
    #[serde(default)]
    pub promo_active: bool,
    #[serde(default)]
    pub is_holiday_week: bool,
    pub submitted_at: DateTime<Utc>,
}

impl Correction {
    pub fn delta(&self) -> f64 {
        self.final_units - self.predicted_units
    }

    pub fn ratio(&self) -> f64 {
        if self.predicted_units == 0.0 {
            0.0
        } else {
            self.final_units / self.predicted_units
        }
    }
}

/// Correction history aggregated by (store, sap, schedule) with a temporal
/// cutoff, as consumed by the feature builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectionAggregate {
    pub store_id: String,
    pub sap: String,
    pub schedule_key: String,
    pub samples: u32,
    pub avg_delta: f64,
    pub avg_ratio: f64,
    pub ratio_stddev: f64,
    pub removal_rate: f64,
    pub promo_rate: f64,
}

/// Blended demand share of a store for one SAP within a schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreItemShare {
    pub store_id: String,
    pub sap: String,
    pub schedule_key: String,
    pub blended_share: f64,
    pub recent_share: f64,
    pub base_share: f64,
    pub trend: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitPattern {
    SingleStore,
    Skewed,
    EvenSplit,
    Varies,
}

/// Cached allocation behavior of one SAP across a route's stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationRow {
    pub sap: String,
    pub split_pattern: SplitPattern,
    pub primary_store_id: Option<String>,
    pub store_count: u32,
}
