//! Calendar flags consumed by the feature builder.

use chrono::{Datelike, Duration, NaiveDate, Weekday as ChronoWeekday};

fn first_saturday_of_month(year: i32, month: u32) -> NaiveDate {
    let mut day = NaiveDate::from_ymd_opt(year, month, 1).expect("valid month start");
    while day.weekday() != ChronoWeekday::Sat {
        day += Duration::days(1);
    }
    day
}

fn last_saturday_of_month(year: i32, month: u32) -> NaiveDate {
    let next_month = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .expect("valid month start");
    let mut day = next_month - Duration::days(1);
    while day.weekday() != ChronoWeekday::Sat {
        day -= Duration::days(1);
    }
    day
}

/// True when `date` lands on the first Saturday of its month or the Sunday
/// that follows it.
pub fn is_first_weekend_of_month(date: NaiveDate) -> bool {
    let saturday = first_saturday_of_month(date.year(), date.month());
    date == saturday || date == saturday + Duration::days(1)
}

/// True when `date` lands on the last Saturday of its month or the Sunday
/// that follows it (which may spill into the next month).
pub fn is_last_weekend_of_month(date: NaiveDate) -> bool {
    let saturday = last_saturday_of_month(date.year(), date.month());
    if date == saturday || date == saturday + Duration::days(1) {
        return true;
    }
    // Sunday belonging to the previous month's last weekend.
    if date.weekday() == ChronoWeekday::Sun {
        let prev = date - Duration::days(1);
        return prev.month() != date.month()
            && prev == last_saturday_of_month(prev.year(), prev.month());
    }
    false
}

/// Days from `date` to the next first-Saturday-of-a-month (0 when `date`
/// itself is one).
pub fn days_until_first_weekend(date: NaiveDate) -> i64 {
    let this_month = first_saturday_of_month(date.year(), date.month());
    if date <= this_month {
        return (this_month - date).num_days();
    }
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    (first_saturday_of_month(year, month) - date).num_days()
}

/// Whether the delivery window `[date, date + window_days)` includes the
/// first weekend of a month.
pub fn covers_first_weekend(date: NaiveDate, window_days: i64) -> bool {
    let until = days_until_first_weekend(date);
    until < window_days.max(1)
}

/// Whether the delivery window includes any Saturday or Sunday.
pub fn covers_weekend(date: NaiveDate, window_days: i64) -> bool {
    (0..window_days.max(1)).any(|offset| {
        let day = date + Duration::days(offset);
        matches!(day.weekday(), ChronoWeekday::Sat | ChronoWeekday::Sun)
    })
}

fn nth_weekday_of_month(year: i32, month: u32, weekday: ChronoWeekday, n: u32) -> NaiveDate {
    let mut day = NaiveDate::from_ymd_opt(year, month, 1).expect("valid month start");
    let mut count = 0;
    loop {
        if day.weekday() == weekday {
            count += 1;
            if count == n {
                return day;
            }
        }
        day += Duration::days(1);
    }
}

fn last_weekday_of_month(year: i32, month: u32, weekday: ChronoWeekday) -> NaiveDate {
    let next_month = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .expect("valid month start");
    let mut day = next_month - Duration::days(1);
    while day.weekday() != weekday {
        day -= Duration::days(1);
    }
    day
}

fn holidays_for_year(year: i32) -> Vec<NaiveDate> {
    vec![
        NaiveDate::from_ymd_opt(year, 1, 1).expect("new year"),
        last_weekday_of_month(year, 5, ChronoWeekday::Mon), // Memorial Day
        NaiveDate::from_ymd_opt(year, 7, 4).expect("independence day"),
        nth_weekday_of_month(year, 9, ChronoWeekday::Mon, 1), // Labor Day
        nth_weekday_of_month(year, 11, ChronoWeekday::Thu, 4), // Thanksgiving
        NaiveDate::from_ymd_opt(year, 12, 25).expect("christmas"),
    ]
}

/// Whether the Monday-anchored week containing `date` includes a demand
/// holiday. Holiday weeks are excluded from training minimums.
pub fn is_holiday_week(date: NaiveDate) -> bool {
    let monday = date - Duration::days(date.weekday().num_days_from_monday() as i64);
    let sunday = monday + Duration::days(6);
    holidays_for_year(monday.year())
        .into_iter()
        .chain(holidays_for_year(sunday.year()))
        .any(|holiday| holiday >= monday && holiday <= sunday)
}
