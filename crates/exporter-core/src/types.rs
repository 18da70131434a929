//! Shared type definitions used across usage-exporter crates.

use chrono::{DateTime, Datelike, Duration, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Timestamp type used throughout the exporter.
pub type Timestamp = DateTime<Utc>;

/// Get the current UTC timestamp.
pub fn now() -> Timestamp {
    Utc::now()
}

/// Format an instant as ISO-8601 with millisecond precision and a `Z` suffix.
pub fn format_instant(ts: &Timestamp) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Midnight UTC of `date`, formatted like [`format_instant`].
pub fn start_of_day_instant(date: NaiveDate) -> String {
    format_instant(&date.and_time(chrono::NaiveTime::MIN).and_utc())
}

/// Parse an RFC 3339 / ISO-8601 instant into UTC.
pub fn parse_instant(value: &str) -> Option<Timestamp> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Parse a `YYYY-MM-DD` calendar date.
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()
}

/// Aggregation period reported to the partner API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AggregationPeriod {
    /// One record per app/model/day
    #[default]
    Daily,
    /// One record per app/model/ISO week (Monday start)
    Weekly,
    /// One record per app/model/calendar month
    Monthly,
}

impl AggregationPeriod {
    /// First day of the period containing `date`.
    pub fn period_start(&self, date: NaiveDate) -> NaiveDate {
        match self {
            Self::Daily => date,
            Self::Weekly => {
                date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
            }
            Self::Monthly => date.with_day(1).unwrap_or(date),
        }
    }
}

impl std::fmt::Display for AggregationPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Daily => write!(f, "daily"),
            Self::Weekly => write!(f, "weekly"),
            Self::Monthly => write!(f, "monthly"),
        }
    }
}

impl std::str::FromStr for AggregationPeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "daily" | "day" => Ok(Self::Daily),
            "weekly" | "week" => Ok(Self::Weekly),
            "monthly" | "month" => Ok(Self::Monthly),
            other => Err(format!(
                "unknown aggregation period '{other}' (expected daily, weekly or monthly)"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    #[test]
    fn test_start_of_day_instant() {
        assert_eq!(
            start_of_day_instant(date("2025-12-01")),
            "2025-12-01T00:00:00.000Z"
        );
    }

    #[test]
    fn test_parse_instant_roundtrip() {
        let ts = parse_instant("2025-12-05T10:11:12.345Z").unwrap();
        assert_eq!(format_instant(&ts), "2025-12-05T10:11:12.345Z");
        assert!(parse_instant("yesterday").is_none());
    }

    #[test]
    fn test_period_start() {
        // 2025-12-03 is a Wednesday
        let d = date("2025-12-03");
        assert_eq!(AggregationPeriod::Daily.period_start(d), d);
        assert_eq!(AggregationPeriod::Weekly.period_start(d), date("2025-12-01"));
        assert_eq!(AggregationPeriod::Monthly.period_start(d), date("2025-12-01"));
        assert_eq!(
            AggregationPeriod::Weekly.period_start(date("2025-12-07")),
            date("2025-12-01")
        );
    }

    #[test]
    fn test_period_parse_and_display() {
        assert_eq!("Weekly".parse::<AggregationPeriod>(), Ok(AggregationPeriod::Weekly));
        assert_eq!(AggregationPeriod::Monthly.to_string(), "monthly");
        assert!("hourly".parse::<AggregationPeriod>().is_err());
        assert_eq!(
            serde_json::to_string(&AggregationPeriod::Daily).unwrap(),
            "\"daily\""
        );
    }
}
