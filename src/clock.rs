//! Wall-clock access and facility time-zone helpers.
//!
//! The facility runs on a fixed UTC-6 offset with no daylight saving, so a
//! `FixedOffset` is enough. Everything that needs "now" takes a [`Clock`] so
//! cooldown and rollback logic can be exercised with a [`ManualClock`].

use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, NaiveDateTime, NaiveTime, Offset};
use chrono::{TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Facility offset from UTC, in seconds (UTC-6).
pub const FACILITY_UTC_OFFSET_SECS: i32 = -6 * 3600;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

/// The real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(start.timestamp_millis()),
        }
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        self.millis
            .store(instant.timestamp_millis(), Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.millis
            .fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        millis_to_utc(self.millis.load(Ordering::SeqCst))
    }
}

pub fn facility_offset() -> FixedOffset {
    FixedOffset::east_opt(FACILITY_UTC_OFFSET_SECS).unwrap_or_else(|| Utc.fix())
}

pub fn millis_to_utc(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_default()
}

/// Interpret a zone-less date-time as facility wall-clock time.
pub fn facility_local_to_utc(naive: NaiveDateTime) -> DateTime<Utc> {
    let shifted = naive - ChronoDuration::seconds(i64::from(facility_offset().local_minus_utc()));
    Utc.from_utc_datetime(&shifted)
}

/// Start and end (exclusive) of the facility calendar day containing `now`.
pub fn facility_day_bounds(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let local_date = now.with_timezone(&facility_offset()).date_naive();
    let start = facility_local_to_utc(local_date.and_time(NaiveTime::MIN));
    (start, start + ChronoDuration::days(1))
}

/// Parse an `HH:MM:SS` (optionally fractional, or `HH:MM`) time of day.
pub fn parse_time_of_day(raw: &str) -> Option<NaiveTime> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    // `timetz` columns carry a trailing offset; the facility offset is implied.
    let end = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == ':' || c == '.'))
        .unwrap_or(trimmed.len());
    let clock_part = &trimmed[..end];
    NaiveTime::parse_from_str(clock_part, "%H:%M:%S%.f")
        .or_else(|_| NaiveTime::parse_from_str(clock_part, "%H:%M"))
        .ok()
}

/// Most recent instant not after `now` whose facility wall-clock time is
/// `time_of_day`.
///
/// Only a time of day is recorded upstream, so a value later than the
/// current facility time is assumed to belong to yesterday. This cannot tell
/// apart two activations more than a day apart.
pub fn latest_instant_for_time_of_day(time_of_day: NaiveTime, now: DateTime<Utc>) -> DateTime<Utc> {
    let today = now.with_timezone(&facility_offset()).date_naive();
    let candidate = facility_local_to_utc(today.and_time(time_of_day));
    if candidate > now {
        candidate - ChronoDuration::hours(24)
    } else {
        candidate
    }
}
