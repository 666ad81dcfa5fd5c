//! `next_run` computation rules by frequency (§4.6).

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frequency {
    Once { at: DateTime<Utc> },
    Interval { seconds: i64 },
    Hourly { minute: u32 },
    Daily { hour: u32, minute: u32 },
    Weekly { day_of_week: Weekday, hour: u32, minute: u32 },
    Monthly { day_of_month: u32, hour: u32, minute: u32 },
    Cron { expr: String },
}

impl Frequency {
    /// Computes the next instant strictly greater than `after`, or `None` for
    /// a `Once` schedule (the caller disables it once fired).
    pub fn next_run_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Frequency::Once { at } => {
                if *at > after {
                    Some(*at)
                } else {
                    None
                }
            }
            Frequency::Interval { seconds } => Some(after + Duration::seconds(*seconds)),
            Frequency::Hourly { minute } => {
                let mut candidate = after
                    .date_naive()
                    .and_hms_opt(after.hour(), *minute, 0)
                    .map(|n| Utc.from_utc_datetime(&n))
                    .unwrap_or(after);
                if candidate <= after {
                    candidate += Duration::hours(1);
                }
                Some(candidate)
            }
            Frequency::Daily { hour, minute } => {
                let mut candidate = after
                    .date_naive()
                    .and_hms_opt(*hour, *minute, 0)
                    .map(|n| Utc.from_utc_datetime(&n))
                    .unwrap_or(after);
                if candidate <= after {
                    candidate += Duration::days(1);
                }
                Some(candidate)
            }
            Frequency::Weekly { day_of_week, hour, minute } => {
                let mut candidate = after
                    .date_naive()
                    .and_hms_opt(*hour, *minute, 0)
                    .map(|n| Utc.from_utc_datetime(&n))
                    .unwrap_or(after);
                while candidate <= after || candidate.weekday() != *day_of_week {
                    candidate += Duration::days(1);
                }
                Some(candidate)
            }
            Frequency::Monthly { day_of_month, hour, minute } => {
                Some(next_monthly(after, *day_of_month, *hour, *minute))
            }
            Frequency::Cron { expr } => {
                let schedule: cron::Schedule = expr.parse().ok()?;
                schedule.after(&after).next()
            }
        }
    }
}

/// Monthly firing; if the target month lacks `day_of_month`, uses the last
/// day of that month instead (§4.6).
fn next_monthly(after: DateTime<Utc>, day_of_month: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    let mut year = after.year();
    let mut month = after.month();

    loop {
        let day = clamp_day_to_month(year, month, day_of_month);
        if let Some(naive) = NaiveDate::from_ymd_opt(year, month, day).and_then(|d| d.and_hms_opt(hour, minute, 0)) {
            let candidate = Utc.from_utc_datetime(&naive);
            if candidate > after {
                return candidate;
            }
        }
        if month == 12 {
            year += 1;
            month = 1;
        } else {
            month += 1;
        }
    }
}

fn clamp_day_to_month(year: i32, month: u32, day_of_month: u32) -> u32 {
    let last_day = last_day_of_month(year, month);
    day_of_month.min(last_day)
}

fn last_day_of_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .unwrap()
        .pred_opt()
        .unwrap()
        .day()
}
