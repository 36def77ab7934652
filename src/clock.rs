//! Wall-clock time in the configured timezone.
//!
//! Send log and queue timestamps are stored as `YYYY-MM-DD HH:MM:SS` text in
//! this timezone, so lexical comparison in SQL is chronological.

use chrono::{FixedOffset, Local, NaiveDateTime, NaiveTime, Offset, TimeZone as _, Utc};
use std::str::FromStr;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Zone used for stored timestamps.
///
/// `Local` follows the host zone, including daylight saving changes. Stored
/// text carries no offset, so when clocks fall back the repeated hour's
/// timestamps sort together with the first pass, and the sliding hourly
/// window can count up to two hours of sends. A fixed offset never repeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timezone {
    Local,
    Fixed(FixedOffset),
}

impl FromStr for Timezone {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("local") {
            return Ok(Timezone::Local);
        }
        if s.eq_ignore_ascii_case("utc") || s == "Z" {
            return Ok(Timezone::Fixed(Utc.fix()));
        }
        // "+03:00" / "-05:30"
        let (sign, rest) = match s.as_bytes().first() {
            Some(b'+') => (1, &s[1..]),
            Some(b'-') => (-1, &s[1..]),
            _ => anyhow::bail!("expected \"local\", \"UTC\" or an offset like \"+03:00\""),
        };
        let (hours, minutes) = rest
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("offset must be written as ±HH:MM"))?;
        let hours: i32 = hours.parse()?;
        let minutes: i32 = minutes.parse()?;
        if hours > 23 || minutes > 59 {
            anyhow::bail!("offset out of range");
        }
        let offset = FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
            .ok_or_else(|| anyhow::anyhow!("offset out of range"))?;
        Ok(Timezone::Fixed(offset))
    }
}

impl Timezone {
    /// True when timestamps in this zone can never repeat.
    pub fn is_monotonic(&self) -> bool {
        matches!(self, Timezone::Fixed(_))
    }
}

pub trait Clock: Send + Sync {
    /// Current wall-clock time in the configured timezone.
    fn now(&self) -> NaiveDateTime;
}

pub struct SystemClock {
    timezone: Timezone,
}

impl SystemClock {
    pub fn new(timezone: Timezone) -> Self {
        Self { timezone }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        match self.timezone {
            Timezone::Local => Local::now().naive_local(),
            Timezone::Fixed(offset) => offset.from_utc_datetime(&Utc::now().naive_utc()).naive_local(),
        }
    }
}

/// A clock frozen at a given instant.
pub struct FixedClock(pub NaiveDateTime);

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        self.0
    }
}

pub fn start_of_day(now: NaiveDateTime) -> NaiveDateTime {
    now.date().and_time(NaiveTime::MIN)
}

pub fn format_timestamp(ts: NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}
