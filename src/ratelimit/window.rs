//! Admission windows and calendar-aligned bucket derivation.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::store::Expiry;

/// A named admission window.
///
/// `Minute`, `Hour` and `Day` are the rolling admission limits. `Monthly` is
/// the hard quota: it is evaluated before the others and resets on the first
/// instant of the next calendar month rather than after a fixed duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Window {
    /// Per-minute admission limit
    Minute,
    /// Per-hour admission limit
    Hour,
    /// Per-day admission limit
    Day,
    /// Calendar-month quota
    Monthly,
}

impl Window {
    /// The rolling windows in evaluation order.
    pub const ROLLING: [Window; 3] = [Window::Minute, Window::Hour, Window::Day];

    /// The wire name of the window, as used in headers and response bodies.
    pub fn name(&self) -> &'static str {
        match self {
            Window::Minute => "minute",
            Window::Hour => "hour",
            Window::Day => "day",
            Window::Monthly => "monthly",
        }
    }

    /// Nominal length of a rolling window.
    ///
    /// Months have no fixed length; `Monthly` reports 31 days, the longest a
    /// month bucket can live.
    pub fn duration(&self) -> Duration {
        match self {
            Window::Minute => Duration::from_secs(60),
            Window::Hour => Duration::from_secs(3600),
            Window::Day => Duration::from_secs(86400),
            Window::Monthly => Duration::from_secs(31 * 86400),
        }
    }

    /// The label of the bucket `now` falls into.
    ///
    /// Labels are part of the persisted key layout and must not change:
    /// `YYYY-MM-DD-HH-MM`, `YYYY-MM-DD-HH`, `YYYY-MM-DD` and `YYYY-MM`.
    pub fn bucket_label(&self, now: DateTime<Utc>) -> String {
        let pattern = match self {
            Window::Minute => "%Y-%m-%d-%H-%M",
            Window::Hour => "%Y-%m-%d-%H",
            Window::Day => "%Y-%m-%d",
            Window::Monthly => "%Y-%m",
        };
        now.format(pattern).to_string()
    }

    /// First instant of the bucket `now` falls into.
    pub fn bucket_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Window::Monthly => month_start(now.year(), now.month()),
            rolling => {
                let step = rolling.duration().as_secs() as i64;
                let secs = now.timestamp();
                at_timestamp(secs - secs.rem_euclid(step))
            }
        }
    }

    /// The instant the bucket `now` falls into stops admitting counts,
    /// i.e. the first instant of the next bucket.
    pub fn reset_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Window::Monthly => {
                let (year, month) = if now.month() == 12 {
                    (now.year() + 1, 1)
                } else {
                    (now.year(), now.month() + 1)
                };
                month_start(year, month)
            }
            rolling => {
                let step = rolling.duration().as_secs() as i64;
                at_timestamp(self.bucket_start(now).timestamp() + step)
            }
        }
    }

    /// Expiry to attach to a counter for the bucket `now` falls into.
    ///
    /// Rolling counters live for a full window duration from their last
    /// increment, which always outlasts the bucket. The monthly counter dies
    /// exactly at the month boundary.
    pub fn expiry(&self, now: DateTime<Utc>) -> Expiry {
        match self {
            Window::Monthly => Expiry::At(self.reset_at(now)),
            rolling => Expiry::After(rolling.duration()),
        }
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn at_timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn month_start(year: i32, month: u32) -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
