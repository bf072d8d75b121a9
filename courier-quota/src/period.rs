//! UTC period boundaries for usage counters.

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc};

use courier_core::Subscription;

pub fn day_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(NaiveTime::MIN).and_utc()
}

pub fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let today = now.date_naive();
    NaiveDate::from_ymd_opt(today.year(), today.month(), 1)
        .unwrap_or(today)
        .and_time(NaiveTime::MIN)
        .and_utc()
}

/// Zeroes whichever counters belong to an earlier period than `now` and moves
/// their reset markers to the start of the current period. Returns true when
/// anything changed.
pub fn apply_resets(subscription: &mut Subscription, now: DateTime<Utc>) -> bool {
    let mut changed = false;

    if subscription.last_reset_daily < day_start(now) {
        subscription.daily_used = 0;
        subscription.last_reset_daily = day_start(now);
        changed = true;
    }
    if subscription.last_reset_monthly < month_start(now) {
        subscription.monthly_used = 0;
        subscription.last_reset_monthly = month_start(now);
        changed = true;
    }

    changed
}
