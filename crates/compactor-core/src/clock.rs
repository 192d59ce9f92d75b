//! Wall-clock access and ISO-8601 duration rendering.
//!
//! The orchestrator and registry read time only through [`Clock`], so the
//! batching gate and the GC rate limit can be driven by [`ManualClock`] in
//! tests.

use std::sync::Mutex;

use chrono::{DateTime, Duration, TimeZone, Utc};

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *now += by;
    }

    /// Jump to an absolute instant.
    pub fn set(&self, to: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *now = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// The "never happened" instant (Unix epoch).
#[must_use]
pub fn epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(0, 0).single().unwrap_or_default()
}

/// Elapsed time between two instants, clamped at zero.
#[must_use]
pub fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    let d = now.signed_duration_since(since);
    if d < Duration::zero() { Duration::zero() } else { d }
}

/// Convert a millisecond setting into a [`Duration`].
#[must_use]
pub fn millis(ms: u64) -> Duration {
    Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}

const SECS_PER_MINUTE: i64 = 60;
const SECS_PER_HOUR: i64 = 60 * SECS_PER_MINUTE;
const SECS_PER_DAY: i64 = 24 * SECS_PER_HOUR;
const SECS_PER_MONTH: i64 = 30 * SECS_PER_DAY;
const SECS_PER_YEAR: i64 = 12 * SECS_PER_MONTH;

/// Render a duration as ISO-8601 (`PT5M3S`, `P1DT2H`, `PT0S`).
///
/// Months are 30 days and years 12 months; sub-second precision is dropped.
/// Negative durations render as `PT0S`.
#[must_use]
pub fn format_duration(d: Duration) -> String {
    let mut secs = d.num_seconds().max(0);

    let years = secs / SECS_PER_YEAR;
    secs %= SECS_PER_YEAR;
    let months = secs / SECS_PER_MONTH;
    secs %= SECS_PER_MONTH;
    let days = secs / SECS_PER_DAY;
    secs %= SECS_PER_DAY;
    let hours = secs / SECS_PER_HOUR;
    secs %= SECS_PER_HOUR;
    let minutes = secs / SECS_PER_MINUTE;
    secs %= SECS_PER_MINUTE;

    let mut out = String::from("P");
    for (value, unit) in [(years, 'Y'), (months, 'M'), (days, 'D')] {
        if value > 0 {
            out.push_str(&format!("{value}{unit}"));
        }
    }

    let mut time = String::new();
    for (value, unit) in [(hours, 'H'), (minutes, 'M'), (secs, 'S')] {
        if value > 0 {
            time.push_str(&format!("{value}{unit}"));
        }
    }

    if !time.is_empty() {
        out.push('T');
        out.push_str(&time);
    } else if out.len() == 1 {
        out.push_str("T0S");
    }
    out
}
