//! Builder patterns for test data.

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use routespark::domain::{
    Correction, ExpiryFloor, LineItem, Order, OrderCycle, OrderStatus, StoreOrder,
};

pub const ROUTE: &str = "989262";

pub fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 2, 1, 10, 0, 0).unwrap()
}

pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap()
}

/// Builder for finalized orders with a single store by default.
pub struct OrderBuilder {
    order_id: String,
    route_number: String,
    schedule_key: String,
    delivery_date: NaiveDate,
    order_date: Option<NaiveDate>,
    status: OrderStatus,
    is_holiday_week: bool,
    stores: Vec<StoreOrder>,
}

impl OrderBuilder {
    pub fn new(order_id: impl Into<String>, delivery_date: NaiveDate) -> Self {
        Self {
            order_id: order_id.into(),
            route_number: ROUTE.to_string(),
            schedule_key: "monday".to_string(),
            delivery_date,
            order_date: Some(delivery_date - Duration::days(3)),
            status: OrderStatus::Finalized,
            is_holiday_week: false,
            stores: Vec::new(),
        }
    }

    pub fn route(mut self, route: impl Into<String>) -> Self {
        self.route_number = route.into();
        self
    }

    pub fn schedule(mut self, schedule_key: impl Into<String>) -> Self {
        self.schedule_key = schedule_key.into();
        self
    }

    pub fn order_date(mut self, order_date: NaiveDate) -> Self {
        self.order_date = Some(order_date);
        self
    }

    pub fn holiday_week(mut self) -> Self {
        self.is_holiday_week = true;
        self
    }

    pub fn line(mut self, store_id: &str, sap: &str, units: u32) -> Self {
        let item = LineItem {
            sap: sap.to_string(),
            units,
            cases: None,
            promo_active: false,
            user_adjusted: false,
            forecasted_units: None,
            forecasted_cases: None,
        };
        if let Some(store) = self.stores.iter_mut().find(|s| s.store_id == store_id) {
            store.items.push(item);
        } else {
            self.stores.push(StoreOrder {
                store_id: store_id.to_string(),
                store_name: format!("Store {store_id}"),
                items: vec![item],
                entered_at: None,
            });
        }
        self
    }

    pub fn build(self) -> Order {
        Order {
            order_id: self.order_id,
            route_number: self.route_number,
            schedule_key: self.schedule_key,
            delivery_date: self.delivery_date,
            order_date: self.order_date,
            status: self.status,
            is_holiday_week: self.is_holiday_week,
            stores: self.stores,
            created_at: Some(fixed_now()),
            updated_at: Some(fixed_now()),
        }
    }
}

/// A weekly run of same-schedule orders with slightly varying quantities.
pub fn weekly_orders(
    count: usize,
    start: NaiveDate,
    schedule: &str,
    store_id: &str,
    sap: &str,
    base_units: u32,
) -> Vec<Order> {
    (0..count)
        .map(|i| {
            let delivery = start + Duration::weeks(i as i64);
            OrderBuilder::new(format!("o_{schedule}_{i}"), delivery)
                .schedule(schedule)
                .line(store_id, sap, base_units + (i % 3) as u32)
                .build()
        })
        .collect()
}

pub struct CorrectionBuilder {
    correction: Correction,
}

impl CorrectionBuilder {
    pub fn new(order_id: &str, delivery_date: NaiveDate) -> Self {
        Self {
            correction: Correction {
                forecast_id: format!("fc_{order_id}"),
                order_id: order_id.to_string(),
                route_number: ROUTE.to_string(),
                schedule_key: "monday".to_string(),
                delivery_date,
                store_id: "s1".to_string(),
                sap: "31032".to_string(),
                predicted_units: 10.0,
                final_units: 12.0,
                was_removed: false,
                promo_active: false,
                is_holiday_week: false,
                submitted_at: fixed_now() - Duration::days(30),
            },
        }
    }

    pub fn schedule(mut self, schedule_key: &str) -> Self {
        self.correction.schedule_key = schedule_key.to_string();
        self
    }

    pub fn line(mut self, store_id: &str, sap: &str) -> Self {
        self.correction.store_id = store_id.to_string();
        self.correction.sap = sap.to_string();
        self
    }

    pub fn units(mut self, predicted: f64, actual: f64) -> Self {
        self.correction.predicted_units = predicted;
        self.correction.final_units = actual;
        self
    }

    pub fn submitted_at(mut self, at: DateTime<Utc>) -> Self {
        self.correction.submitted_at = at;
        self
    }

    pub fn build(self) -> Correction {
        self.correction
    }
}

pub fn two_cycle_route() -> Vec<OrderCycle> {
    vec![
        OrderCycle::new(1, 3, 4).unwrap(), // monday order -> thursday delivery
        OrderCycle::new(2, 5, 1).unwrap(), // tuesday order -> monday delivery
    ]
}

pub fn expiry_floor(store_id: &str, sap: &str, expiry: NaiveDate, min_units: u32) -> ExpiryFloor {
    ExpiryFloor {
        store_id: store_id.to_string(),
        sap: sap.to_string(),
        expiry_date: expiry,
        min_units_required: min_units,
    }
}
