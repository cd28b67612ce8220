use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use crate::error::SeriesError;
use crate::services::series::types::TimeRange;

const MAX_RELATIVE_AMOUNT: i64 = 100_000;

/// Time range as sent by widgets: either a relative window ending now (`"24h"`)
/// or explicit RFC3339 bounds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, utoipa::ToSchema)]
#[serde(untagged)]
pub enum TimeRangeSpec {
    Relative(String),
    Explicit { start: String, end: String },
}

pub fn resolve_time_range(
    spec: &TimeRangeSpec,
    now: DateTime<Utc>,
    max_window: Duration,
) -> Result<TimeRange, SeriesError> {
    let range = match spec {
        TimeRangeSpec::Relative(raw) => {
            let window = parse_relative_window(raw)?;
            TimeRange {
                start: now - window,
                end: now,
            }
        }
        TimeRangeSpec::Explicit { start, end } => {
            let start = parse_ts(start)?;
            let end = parse_ts(end)?;
            if end <= start {
                return Err(SeriesError::validation("timeRange end must be after start"));
            }
            TimeRange { start, end }
        }
    };

    if range.end - range.start > max_window {
        return Err(SeriesError::validation(format!(
            "timeRange too large (max {} hours)",
            max_window.num_hours()
        )));
    }
    Ok(range)
}

fn parse_relative_window(raw: &str) -> Result<Duration, SeriesError> {
    let trimmed = raw.trim();
    let invalid = || {
        SeriesError::validation(format!(
            "Invalid relative timeRange \"{trimmed}\" (expected e.g. 15m, 24h, 7d, 2w)"
        ))
    };

    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(invalid)?;
    let (amount, unit) = trimmed.split_at(split);
    let amount: i64 = amount.parse().map_err(|_| invalid())?;
    if amount <= 0 || amount > MAX_RELATIVE_AMOUNT {
        return Err(invalid());
    }

    match unit {
        "m" => Ok(Duration::minutes(amount)),
        "h" => Ok(Duration::hours(amount)),
        "d" => Ok(Duration::days(amount)),
        "w" => Ok(Duration::weeks(amount)),
        _ => Err(invalid()),
    }
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, SeriesError> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| SeriesError::validation(format!("Invalid timestamp \"{}\"", raw.trim())))
}
