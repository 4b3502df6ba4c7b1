//! Order-cycle arithmetic and calendar features.

mod calendar;
mod cycles;

pub use calendar::{
    covers_first_weekend, covers_weekend, days_until_first_weekend, is_first_weekend_of_month,
    is_holiday_week, is_last_weekend_of_month,
};
pub use cycles::{
    days_until_next_delivery, median_delivery_gap, next_unordered_delivery,
    schedule_key_for_delivery, summarize_shape, NextDelivery, ScheduleError, ScheduleShape,
    DELIVERY_SCAN_DAYS,
};
