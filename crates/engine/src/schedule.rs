//! Wake-time resolution for `delay` and `wait_until` steps.
//!
//! Delays are relative to the current pass; `wait_until` rules resolve to
//! an absolute instant in the subscriber's (or funnel's) timezone. A rule
//! that would yield a past instant always rolls forward to the next future
//! occurrence.

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Unit for `delay` step values and retry intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayUnit {
    Minutes,
    Hours,
    Days,
    Weeks,
}

/// Convert a (value, unit) delay into seconds.
pub fn delay_seconds(value: u32, unit: DelayUnit) -> i64 {
    let value = i64::from(value);
    match unit {
        DelayUnit::Minutes => value * 60,
        DelayUnit::Hours => value * 3600,
        DelayUnit::Days => value * 86_400,
        DelayUnit::Weeks => value * 604_800,
    }
}

/// Absolute-time rule for a `wait_until` step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum WaitRule {
    /// Wake at a fixed instant. Past instants resolve to now.
    SpecificDate { at: DateTime<Utc> },
    /// Wake at the next occurrence of `weekday` at `time` in `timezone`.
    /// Evaluated after that time on the matching weekday, this rolls to
    /// the following week.
    DayOfWeek {
        weekday: Weekday,
        time: NaiveTime,
        timezone: Tz,
    },
    /// Wake inside the next business-hours window (Mon-Fri, open..close
    /// in `timezone`). Already inside a window resolves to now.
    BusinessHours {
        open: NaiveTime,
        close: NaiveTime,
        timezone: Tz,
    },
}

impl WaitRule {
    /// Resolve this rule to an absolute wake instant, always >= `now`.
    pub fn resolve(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            WaitRule::SpecificDate { at } => (*at).max(now),
            WaitRule::DayOfWeek {
                weekday,
                time,
                timezone,
            } => next_weekday_at(now, *weekday, *time, *timezone),
            WaitRule::BusinessHours {
                open,
                close,
                timezone,
            } => next_business_window(now, *open, *close, *timezone),
        }
    }
}

fn next_weekday_at(now: DateTime<Utc>, weekday: Weekday, time: NaiveTime, tz: Tz) -> DateTime<Utc> {
    let local_now = now.with_timezone(&tz);
    let days_ahead = (weekday.num_days_from_monday() as i64
        - local_now.weekday().num_days_from_monday() as i64)
        .rem_euclid(7);
    // Same weekday but the time already passed: next week, not today.
    let days_ahead = if days_ahead == 0 && local_now.time() >= time {
        7
    } else {
        days_ahead
    };
    let target_date = local_now.date_naive() + Duration::days(days_ahead);
    localize(tz, target_date.and_time(time)).with_timezone(&Utc)
}

fn next_business_window(
    now: DateTime<Utc>,
    open: NaiveTime,
    close: NaiveTime,
    tz: Tz,
) -> DateTime<Utc> {
    let local_now = now.with_timezone(&tz);
    if is_business_day(local_now.weekday()) && local_now.time() >= open && local_now.time() < close
    {
        return now;
    }
    // Scan forward; 8 days always contains a weekday.
    for offset in 0..8 {
        let date = local_now.date_naive() + Duration::days(offset);
        if !is_business_day(date.weekday()) {
            continue;
        }
        if offset == 0 && local_now.time() >= open {
            continue;
        }
        return localize(tz, date.and_time(open)).with_timezone(&Utc);
    }
    // Unreachable given the scan above; fall back to now.
    now
}

fn is_business_day(weekday: Weekday) -> bool {
    !matches!(weekday, Weekday::Sat | Weekday::Sun)
}

/// Map a naive local time into the timezone, tolerating DST gaps and folds.
fn localize(tz: Tz, naive: chrono::NaiveDateTime) -> DateTime<Tz> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt,
        LocalResult::Ambiguous(earliest, _) => earliest,
        // Skipped by a DST gap: shift one hour past the gap.
        LocalResult::None => match tz.from_local_datetime(&(naive + Duration::hours(1))) {
            LocalResult::Single(dt) => dt,
            LocalResult::Ambiguous(earliest, _) => earliest,
            LocalResult::None => tz.from_utc_datetime(&naive),
        },
    }
}
