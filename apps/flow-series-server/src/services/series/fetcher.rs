use std::cmp::Ordering;

use super::store::ReadingStore;
use super::types::{Reading, ReadingQuery};
use crate::error::SeriesError;

fn reading_order(a: &Reading, b: &Reading) -> Ordering {
    a.timestamp
        .cmp(&b.timestamp)
        .then_with(|| a.serial_number.cmp(&b.serial_number))
}

/// Orders by `(timestamp, serial_number)` and applies the global row limit.
pub fn order_and_limit(mut readings: Vec<Reading>, limit: usize) -> Vec<Reading> {
    readings.sort_by(reading_order);
    readings.truncate(limit);
    readings
}

/// Fetches the raw readings feeding one variable. Field maps are returned untouched.
pub async fn fetch(
    store: &dyn ReadingStore,
    query: &ReadingQuery,
) -> Result<Vec<Reading>, SeriesError> {
    if query.devices.is_empty_set() || query.required_fields.is_empty() || query.limit == 0 {
        return Ok(Vec::new());
    }

    let mut readings = store.fetch_readings(query).await?;
    readings.retain(|reading| reading.has_any_field(&query.required_fields));
    Ok(order_and_limit(readings, query.limit))
}
