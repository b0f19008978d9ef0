//! Time window and rollup selection from query parameters.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::HashMap;
use thiserror::Error;

pub const DEFAULT_STATS_PERIOD: &str = "24h";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DateRangeError {
    #[error("Invalid {param} value: {value}")]
    InvalidTimestamp { param: &'static str, value: String },

    #[error("start and end are both required")]
    MissingBound,

    #[error("Invalid statsPeriod: {0}")]
    InvalidPeriod(String),

    #[error("Invalid rollup: {0}")]
    InvalidRollup(String),

    #[error("start must be before end")]
    InvertedRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Bucket width in seconds
    pub rollup: i64,
}

/// Parse `"90s"`, `"30m"`, `"24h"`, `"14d"` or `"2w"`.
pub fn parse_stats_period(value: &str) -> Option<Duration> {
    let value = value.trim();
    let unit_at = value.find(|c: char| !c.is_ascii_digit())?;
    let (amount, unit) = value.split_at(unit_at);
    let amount: i64 = amount.parse().ok()?;

    match unit {
        "s" => Duration::try_seconds(amount),
        "m" => Duration::try_minutes(amount),
        "h" => Duration::try_hours(amount),
        "d" => Duration::try_days(amount),
        "w" => Duration::try_weeks(amount),
        _ => None,
    }
}

/// Resolutions the aggregation service answers for.
pub fn parse_rollup(value: &str) -> Result<i64, DateRangeError> {
    match value.trim() {
        "1h" | "1hr" | "3600" => Ok(3600),
        "1d" | "1day" | "86400" => Ok(86400),
        other => Err(DateRangeError::InvalidRollup(other.to_string())),
    }
}

fn parse_timestamp(param: &'static str, value: &str) -> Result<DateTime<Utc>, DateRangeError> {
    let invalid = || DateRangeError::InvalidTimestamp {
        param,
        value: value.to_string(),
    };

    if let Ok(seconds) = value.parse::<f64>() {
        // f64 parsing also accepts NaN, inf and out-of-range exponents
        if !seconds.is_finite() {
            return Err(invalid());
        }
        return Utc
            .timestamp_opt(seconds.trunc() as i64, 0)
            .single()
            .ok_or_else(invalid);
    }
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| invalid())
}

/// Resolve `start`/`end`/`statsPeriod`/`rollup` against `now`.
///
/// `statsPeriod` wins over explicit bounds; with neither, the window is
/// the last 24 hours. With `round_range` the window is widened to whole
/// rollup buckets.
pub fn date_range_at(
    params: &HashMap<String, String>,
    default_rollup: &str,
    round_range: bool,
    now: DateTime<Utc>,
) -> Result<DateRange, DateRangeError> {
    let rollup = parse_rollup(
        params
            .get("rollup")
            .map(String::as_str)
            .unwrap_or(default_rollup),
    )?;

    let start = params.get("start").filter(|v| !v.is_empty());
    let end = params.get("end").filter(|v| !v.is_empty());
    let period = params.get("statsPeriod").filter(|v| !v.is_empty());

    let (start, end) = match (period, start, end) {
        (Some(period), _, _) => {
            let start = parse_stats_period(period)
                .and_then(|span| now.checked_sub_signed(span))
                .ok_or_else(|| DateRangeError::InvalidPeriod(period.clone()))?;
            (start, now)
        }
        (None, Some(start), Some(end)) => {
            (parse_timestamp("start", start)?, parse_timestamp("end", end)?)
        }
        (None, None, None) => {
            let start = parse_stats_period(DEFAULT_STATS_PERIOD)
                .and_then(|span| now.checked_sub_signed(span))
                .ok_or_else(|| DateRangeError::InvalidPeriod(DEFAULT_STATS_PERIOD.into()))?;
            (start, now)
        }
        _ => return Err(DateRangeError::MissingBound),
    };

    if start >= end {
        return Err(DateRangeError::InvertedRange);
    }

    let (start, end) = if round_range {
        round_to_rollup(start, end, rollup)?
    } else {
        (start, end)
    };

    Ok(DateRange { start, end, rollup })
}

pub fn get_date_range_rollup_from_params(
    params: &HashMap<String, String>,
    default_rollup: &str,
    round_range: bool,
) -> Result<DateRange, DateRangeError> {
    date_range_at(params, default_rollup, round_range, Utc::now())
}

fn round_to_rollup(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    rollup: i64,
) -> Result<(DateTime<Utc>, DateTime<Utc>), DateRangeError> {
    let floor = start.timestamp().div_euclid(rollup) * rollup;
    let ceil = (end.timestamp() + rollup - 1).div_euclid(rollup) * rollup;
    let to_time = |secs: i64| {
        Utc.timestamp_opt(secs, 0)
            .single()
            .ok_or(DateRangeError::InvertedRange)
    };
    Ok((to_time(floor)?, to_time(ceil)?))
}
