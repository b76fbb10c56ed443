//! Bucket windows: aligned time periods of `[n, unit]` and timestamp-key parsing.

use crate::error::StoreError;
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

const SECS_PER_MINUTE: i64 = 60;
const SECS_PER_HOUR: i64 = 3_600;
const SECS_PER_DAY: i64 = 86_400;
const SECS_PER_WEEK: i64 = 7 * SECS_PER_DAY;
/// 1970-01-05T00:00:00Z, the first Monday after the Unix epoch.
const FIRST_MONDAY_SECS: i64 = 4 * SECS_PER_DAY;

/// Calendar unit of a bucket size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    #[serde(alias = "second")]
    Seconds,
    #[serde(alias = "minute")]
    Minutes,
    #[serde(alias = "hour")]
    Hours,
    #[serde(alias = "day")]
    Days,
    #[serde(alias = "week")]
    Weeks,
    #[serde(alias = "month")]
    Months,
    #[serde(alias = "year")]
    Years,
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimeUnit::Seconds => "seconds",
            TimeUnit::Minutes => "minutes",
            TimeUnit::Hours => "hours",
            TimeUnit::Days => "days",
            TimeUnit::Weeks => "weeks",
            TimeUnit::Months => "months",
            TimeUnit::Years => "years",
        };
        f.write_str(s)
    }
}

/// Length of one value bucket, serialized as `[n, "unit"]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BucketSize(pub u32, pub TimeUnit);

impl Default for BucketSize {
    fn default() -> Self {
        BucketSize(1, TimeUnit::Months)
    }
}

impl fmt::Display for BucketSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.0, self.1)
    }
}

/// Inclusive time range of one bucket window.
///
/// `end` is the last representable instant before the following window starts, so a bucket
/// fits the window iff `bucket_start >= start && bucket_end <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    /// True if `[start, end]` lies entirely inside this window.
    pub fn encloses(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        start >= self.start && end <= self.end
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.encloses(at, at)
    }
}

impl BucketSize {
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.0 == 0 {
            return Err(StoreError::Validation(format!(
                "bucket size {} must span at least one {}",
                self, self.1
            )));
        }
        Ok(())
    }

    /// Computes the aligned window of this size that contains `at`.
    ///
    /// Fixed-length units are aligned to multiples of `n` since the Unix epoch, weeks to
    /// Mondays, months and years to the calendar.
    pub fn window_containing(&self, at: DateTime<Utc>) -> Result<Window, StoreError> {
        self.validate()?;
        let n = i64::from(self.0);
        let (start, next) = match self.1 {
            TimeUnit::Seconds => fixed_span(at, n, 1, 0)?,
            TimeUnit::Minutes => fixed_span(at, n, SECS_PER_MINUTE, 0)?,
            TimeUnit::Hours => fixed_span(at, n, SECS_PER_HOUR, 0)?,
            TimeUnit::Days => fixed_span(at, n, SECS_PER_DAY, 0)?,
            TimeUnit::Weeks => fixed_span(at, n, SECS_PER_WEEK, FIRST_MONDAY_SECS)?,
            TimeUnit::Months => {
                let idx = i64::from(at.year()) * 12 + i64::from(at.month0());
                let first = idx.div_euclid(n) * n;
                (month_start(first)?, month_start(first + n)?)
            }
            TimeUnit::Years => {
                let first = i64::from(at.year()).div_euclid(n) * n;
                (month_start(first * 12)?, month_start((first + n) * 12)?)
            }
        };
        Ok(Window {
            start,
            end: next - chrono::Duration::nanoseconds(1),
        })
    }
}

fn fixed_span(
    at: DateTime<Utc>,
    n: i64,
    unit_secs: i64,
    origin: i64,
) -> Result<(DateTime<Utc>, DateTime<Utc>), StoreError> {
    let span = n
        .checked_mul(unit_secs)
        .ok_or_else(|| StoreError::Validation(format!("bucket span of {} units overflows", n)))?;
    let start = (at.timestamp() - origin).div_euclid(span) * span + origin;
    Ok((from_secs(start)?, from_secs(start + span)?))
}

fn from_secs(secs: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .ok_or_else(|| StoreError::Validation(format!("timestamp {} out of range", secs)))
}

/// First instant of the month with absolute index `year * 12 + month0`.
fn month_start(idx: i64) -> Result<DateTime<Utc>, StoreError> {
    let year = i32::try_from(idx.div_euclid(12))
        .map_err(|_| StoreError::Validation(format!("month index {} out of range", idx)))?;
    let month = idx.rem_euclid(12) as u32 + 1;
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .ok_or_else(|| StoreError::Validation(format!("month {}-{} out of range", year, month)))
}

/// Parses a sample timestamp key.
///
/// Accepts RFC 3339, naive date-times (read as UTC, `T` or space separated, optional
/// fractional seconds) and bare `YYYY-MM-DD` dates.
pub fn parse_key(key: &str) -> Result<DateTime<Utc>, StoreError> {
    let key = key.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(key) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(key, fmt) {
            return Ok(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(key, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(naive.and_utc());
        }
    }
    Err(StoreError::Validation(format!(
        "unsupported timestamp key {:?}",
        key
    )))
}

/// Orders two keys by the instant they denote, falling back to string order for keys that
/// do not parse (or denote the same instant).
pub fn compare_keys(a: &str, b: &str) -> Ordering {
    match (parse_key(a), parse_key(b)) {
        (Ok(ta), Ok(tb)) => ta.cmp(&tb).then_with(|| a.cmp(b)),
        _ => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        parse_key(s).unwrap()
    }

    #[test]
    fn test_parse_key_formats() {
        assert_eq!(at("2022-01-05"), at("2022-01-05T00:00:00Z"));
        assert_eq!(at("2022-01-05 10:30:00"), at("2022-01-05T10:30:00Z"));
        assert_eq!(at("2022-01-05T12:30:00+02:00"), at("2022-01-05T10:30:00Z"));
        assert_eq!(
            at("2022-01-05T10:30:00.250").timestamp_subsec_millis(),
            250
        );
        assert!(matches!(parse_key("yesterday"), Err(StoreError::Validation(_))));
    }

    #[test]
    fn test_month_window() {
        let w = BucketSize(1, TimeUnit::Months)
            .window_containing(at("2022-01-05"))
            .unwrap();
        assert_eq!(w.start, at("2022-01-01"));
        assert!(w.contains(at("2022-01-31T23:59:59.999")));
        assert!(!w.contains(at("2022-02-01")));
    }

    #[test]
    fn test_multi_month_window_crosses_year() {
        let w = BucketSize(3, TimeUnit::Months)
            .window_containing(at("2021-11-15"))
            .unwrap();
        assert_eq!(w.start, at("2021-10-01"));
        assert!(w.contains(at("2021-12-31T23:00:00")));
        assert!(!w.contains(at("2022-01-01")));
    }

    #[test]
    fn test_week_window_starts_monday() {
        // 2022-01-05 was a Wednesday.
        let w = BucketSize(1, TimeUnit::Weeks)
            .window_containing(at("2022-01-05T08:00:00"))
            .unwrap();
        assert_eq!(w.start, at("2022-01-03"));
        assert!(w.contains(at("2022-01-09T23:59:59")));
        assert!(!w.contains(at("2022-01-10")));
    }

    #[test]
    fn test_fixed_windows() {
        let w = BucketSize(6, TimeUnit::Hours)
            .window_containing(at("2022-01-05T13:10:00Z"))
            .unwrap();
        assert_eq!(w.start, at("2022-01-05T12:00:00Z"));

        let w = BucketSize(1, TimeUnit::Days)
            .window_containing(at("1969-12-31T23:00:00Z"))
            .unwrap();
        assert_eq!(w.start, at("1969-12-31"));

        let w = BucketSize(10, TimeUnit::Years)
            .window_containing(at("2022-06-01"))
            .unwrap();
        assert_eq!(w.start, at("2020-01-01"));
        assert!(w.contains(at("2029-12-31T23:59:59")));
    }

    #[test]
    fn test_zero_bucket_size_rejected() {
        let err = BucketSize(0, TimeUnit::Days)
            .window_containing(at("2022-01-05"))
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[test]
    fn test_bucket_size_serde() {
        let b: BucketSize = serde_json::from_str(r#"[2, "month"]"#).unwrap();
        assert_eq!(b, BucketSize(2, TimeUnit::Months));
        assert_eq!(serde_json::to_string(&b).unwrap(), r#"[2,"months"]"#);
        assert!(serde_json::from_str::<BucketSize>(r#"[1, "fortnights"]"#).is_err());
    }

    #[test]
    fn test_compare_keys_by_instant() {
        assert_eq!(compare_keys("2022-01-05", "2022-01-05T00:00:01Z"), Ordering::Less);
        assert_eq!(compare_keys("2022-01-10", "2022-01-09T23:00:00"), Ordering::Greater);
    }
}
