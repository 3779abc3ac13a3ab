//! Period and time parsing lens
//!
//! Archives are published per calendar month, identified as `YYYY-MM`. This
//! module owns that [`Period`] type, the month-range expansion operators use
//! to plan backfills, the `HH:MM` time-of-day window used by aggregation
//! filters, and free-form timestamp parsing for query bounds.
//!
//! # Example
//!
//! ```rust,ignore
//! use hexstat::lens::time::{TimeLens, Period};
//!
//! let lens = TimeLens::new();
//! let from = lens.parse_time_string("2024-01-01")?;
//! let periods = lens.expand_periods("2023-11".parse()?, "2024-02".parse()?)?;
//! assert_eq!(periods.len(), 4);
//! ```

use anyhow::anyhow;
use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Upper bound on a single period expansion (fifty years of months)
pub const MAX_EXPANDED_PERIODS: usize = 600;

// =============================================================================
// Types
// =============================================================================

/// A calendar month, the unit in which archives are published
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Period {
    year: i32,
    month: u32,
}

impl Period {
    pub fn new(year: i32, month: u32) -> anyhow::Result<Self> {
        if !(1..=12).contains(&month) {
            return Err(anyhow!("Month must be between 1 and 12, got {}", month));
        }
        if !(1000..=9999).contains(&year) {
            return Err(anyhow!("Year must have four digits, got {}", year));
        }
        Ok(Self { year, month })
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    /// Parse the leading `YYYY-MM` of a longer string
    ///
    /// Accepts `2024-01`, `2024-01-15` and `2024-01-15T10:00:00Z`, but not
    /// `2024-1` or `2024-013`.
    pub fn parse_prefix(s: &str) -> Option<Self> {
        let s = s.trim();
        let head = s.get(..7)?;
        if let Some(next) = s[7..].chars().next() {
            if next.is_ascii_digit() {
                return None;
            }
        }
        head.parse().ok()
    }

    /// First instant of the month in UTC
    pub fn month_start(&self) -> DateTime<Utc> {
        // year and month are validated on construction, day 1 always exists
        Utc.with_ymd_and_hms(self.year, self.month, 1, 0, 0, 0)
            .single()
            .unwrap_or_default()
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// The month containing a timestamp
    pub fn containing(ts: &DateTime<Utc>) -> Self {
        Self {
            year: ts.year(),
            month: ts.month(),
        }
    }
}

impl FromStr for Period {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let bytes = s.as_bytes();
        if bytes.len() != 7
            || bytes[4] != b'-'
            || !bytes[..4].iter().all(u8::is_ascii_digit)
            || !bytes[5..].iter().all(u8::is_ascii_digit)
        {
            return Err(anyhow!("Period must be formatted as YYYY-MM, got '{}'", s));
        }
        let year: i32 = s[..4].parse()?;
        let month: u32 = s[5..].parse()?;
        Self::new(year, month)
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl Serialize for Period {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Period {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A wall-clock time in minutes after midnight
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeOfDay(u16);

impl TimeOfDay {
    pub const START_OF_DAY: TimeOfDay = TimeOfDay(0);
    pub const END_OF_DAY: TimeOfDay = TimeOfDay(23 * 60 + 59);

    pub fn minutes(&self) -> u16 {
        self.0
    }

    pub fn of(ts: &DateTime<Utc>) -> Self {
        Self((ts.hour() * 60 + ts.minute()) as u16)
    }

    /// Whether `t` falls in `[start, end]`, wrapping past midnight when `start > end`
    pub fn within(t: TimeOfDay, start: TimeOfDay, end: TimeOfDay) -> bool {
        if start <= end {
            start <= t && t <= end
        } else {
            t >= start || t <= end
        }
    }
}

impl FromStr for TimeOfDay {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let time = NaiveTime::parse_from_str(s.trim(), "%H:%M")
            .map_err(|_| anyhow!("Time of day must be formatted as HH:MM, got '{}'", s))?;
        Ok(Self((time.hour() * 60 + time.minute()) as u16))
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

impl Serialize for TimeOfDay {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TimeOfDay {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Lens
// =============================================================================

/// Time parsing lens
pub struct TimeLens;

impl TimeLens {
    /// Create a new time lens
    pub fn new() -> Self {
        Self
    }

    /// Parse a single time string into a `DateTime<Utc>`
    ///
    /// Accepts:
    /// - Unix timestamps (e.g., "1697043600")
    /// - RFC3339 strings (e.g., "2023-10-11T00:00:00Z")
    /// - Human-readable dates (e.g., "October 11, 2023")
    pub fn parse_time_string(&self, time_string: &str) -> anyhow::Result<DateTime<Utc>> {
        let ts = match dateparser::parse_with(
            time_string,
            &Utc,
            NaiveTime::from_hms_opt(0, 0, 0).ok_or_else(|| anyhow!("Failed to create time"))?,
        ) {
            Ok(ts) => ts,
            Err(_) => {
                return Err(anyhow!(
                    "Input time must be either Unix timestamp or time string compliant with RFC3339"
                ))
            }
        };

        Ok(ts)
    }

    /// Parse an optional pair of query bounds, rejecting inverted ranges
    ///
    /// A date-only upper bound such as `2024-01-31` covers the whole day.
    pub fn parse_range(
        &self,
        from: Option<&str>,
        to: Option<&str>,
    ) -> anyhow::Result<(Option<DateTime<Utc>>, Option<DateTime<Utc>>)> {
        let from = from.map(|s| self.parse_time_string(s)).transpose()?;
        let to = to.map(|s| self.parse_upper_bound(s)).transpose()?;
        if let (Some(f), Some(t)) = (&from, &to) {
            if f > t {
                return Err(anyhow!("Start time {} is after end time {}", f, t));
            }
        }
        Ok((from, to))
    }

    fn parse_upper_bound(&self, time_string: &str) -> anyhow::Result<DateTime<Utc>> {
        match NaiveDate::parse_from_str(time_string.trim(), "%Y-%m-%d") {
            Ok(date) => date
                .and_hms_opt(23, 59, 59)
                .map(|naive| naive.and_utc())
                .ok_or_else(|| anyhow!("Failed to build end of day for {}", time_string)),
            Err(_) => self.parse_time_string(time_string),
        }
    }

    /// Every month from `from` to `to`, both inclusive
    pub fn expand_periods(&self, from: Period, to: Period) -> anyhow::Result<Vec<Period>> {
        expand_periods(from, to)
    }
}

impl Default for TimeLens {
    fn default() -> Self {
        Self::new()
    }
}

/// Every month from `from` to `to`, both inclusive
pub fn expand_periods(from: Period, to: Period) -> anyhow::Result<Vec<Period>> {
    if from > to {
        return Err(anyhow!("Period range is inverted: {} is after {}", from, to));
    }

    let mut periods = vec![from];
    let mut current = from;
    while current < to {
        current = current.next();
        periods.push(current);
        if periods.len() > MAX_EXPANDED_PERIODS {
            return Err(anyhow!(
                "Period range {}..{} spans more than {} months",
                from,
                to,
                MAX_EXPANDED_PERIODS
            ));
        }
    }
    Ok(periods)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_to_time() {
        let lens = TimeLens::new();

        let result = lens.parse_time_string("1697043600");
        assert_eq!(result.unwrap(), Utc.timestamp_opt(1697043600, 0).unwrap());

        let result = lens.parse_time_string("2023-10-11T00:00:00Z");
        assert_eq!(result.unwrap(), Utc.timestamp_opt(1696982400, 0).unwrap());

        assert!(lens.parse_time_string("not-a-date").is_err());
        assert!(lens.parse_time_string("").is_err());

        let result = lens.parse_time_string("October 11, 2023");
        assert_eq!(
            result.unwrap(),
            Utc.with_ymd_and_hms(2023, 10, 11, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_parse_range() {
        let lens = TimeLens::new();
        let (from, to) = lens
            .parse_range(Some("2024-01-01"), Some("2024-02-01"))
            .unwrap();
        assert!(from.unwrap() < to.unwrap());

        assert!(lens
            .parse_range(Some("2024-02-01"), Some("2024-01-01"))
            .is_err());
        assert_eq!(lens.parse_range(None, None).unwrap(), (None, None));
    }

    #[test]
    fn test_date_only_upper_bound_covers_day() {
        let lens = TimeLens::new();
        let (from, to) = lens
            .parse_range(Some("2024-01-31"), Some("2024-01-31"))
            .unwrap();
        assert_eq!(from, Some(Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap()));
        assert_eq!(to, Some(Utc.with_ymd_and_hms(2024, 1, 31, 23, 59, 59).unwrap()));

        let (_, to) = lens
            .parse_range(None, Some("2024-01-31T12:00:00Z"))
            .unwrap();
        assert_eq!(to, Some(Utc.with_ymd_and_hms(2024, 1, 31, 12, 0, 0).unwrap()));
    }

    #[test]
    fn test_period_parse_and_display() {
        let p: Period = "2024-01".parse().unwrap();
        assert_eq!(p.year(), 2024);
        assert_eq!(p.month(), 1);
        assert_eq!(p.to_string(), "2024-01");
        assert_eq!(
            p.month_start(),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        );

        for bad in ["2024-13", "2024-00", "2024-1", "24-01", "2024/01", "2024-01-01", ""] {
            assert!(bad.parse::<Period>().is_err(), "{} should be rejected", bad);
        }
    }

    #[test]
    fn test_period_parse_prefix() {
        assert_eq!(
            Period::parse_prefix("2024-01-15T10:00:00Z"),
            Some(Period::new(2024, 1).unwrap())
        );
        assert_eq!(
            Period::parse_prefix(" 2023-12 "),
            Some(Period::new(2023, 12).unwrap())
        );
        assert_eq!(Period::parse_prefix("2024-013"), None);
        assert_eq!(Period::parse_prefix("January"), None);
        assert_eq!(Period::parse_prefix("2024"), None);
    }

    #[test]
    fn test_period_next_wraps_year() {
        let p = Period::new(2023, 12).unwrap();
        assert_eq!(p.next(), Period::new(2024, 1).unwrap());
    }

    #[test]
    fn test_expand_periods() {
        let periods = expand_periods(
            Period::new(2023, 11).unwrap(),
            Period::new(2024, 2).unwrap(),
        )
        .unwrap();
        let names: Vec<String> = periods.iter().map(Period::to_string).collect();
        assert_eq!(names, vec!["2023-11", "2023-12", "2024-01", "2024-02"]);

        let single = Period::new(2024, 5).unwrap();
        assert_eq!(expand_periods(single, single).unwrap(), vec![single]);

        assert!(expand_periods(single, Period::new(2024, 1).unwrap()).is_err());
        assert!(expand_periods(
            Period::new(1900, 1).unwrap(),
            Period::new(2024, 1).unwrap()
        )
        .is_err());
    }

    #[test]
    fn test_period_serde() {
        let p = Period::new(2024, 3).unwrap();
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, "\"2024-03\"");
        let back: Period = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
        assert!(serde_json::from_str::<Period>("\"2024-3\"").is_err());
    }

    #[test]
    fn test_time_of_day_window() {
        let start: TimeOfDay = "22:00".parse().unwrap();
        let end: TimeOfDay = "02:30".parse().unwrap();
        let late: TimeOfDay = "23:15".parse().unwrap();
        let early: TimeOfDay = "01:00".parse().unwrap();
        let noon: TimeOfDay = "12:00".parse().unwrap();

        assert!(TimeOfDay::within(late, start, end));
        assert!(TimeOfDay::within(early, start, end));
        assert!(!TimeOfDay::within(noon, start, end));

        let morning: TimeOfDay = "08:00".parse().unwrap();
        let evening: TimeOfDay = "18:00".parse().unwrap();
        assert!(TimeOfDay::within(noon, morning, evening));
        assert!(!TimeOfDay::within(late, morning, evening));
        assert!(TimeOfDay::within(morning, morning, evening));

        assert!("25:00".parse::<TimeOfDay>().is_err());
        assert_eq!(end.to_string(), "02:30");
        assert_eq!(TimeOfDay::END_OF_DAY.to_string(), "23:59");
        assert_eq!(serde_json::to_string(&end).unwrap(), "\"02:30\"");
    }
}
