use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::error::StoreError;
use crate::services::series::formulas::FormulaRegistry;
use crate::services::series::store::{
    field_values_from_json, has_numeric_field, DeviceDirectory, ReadingStore,
};
use crate::services::series::types::{
    Device, DeviceFilter, HierarchyNode, Reading, ReadingQuery,
};
use crate::services::series::{QueryLimits, SeriesEngine};
use crate::state::AppState;

/// `2026-01-01T00:00:00Z` plus `offset` minutes.
pub fn minute(offset: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0)
        .single()
        .expect("base timestamp")
        + ChronoDuration::minutes(offset)
}

pub fn device(id: &str, company_id: &str, device_type_id: &str, serial: &str) -> Device {
    Device {
        id: id.to_string(),
        company_id: company_id.to_string(),
        device_type_id: device_type_id.to_string(),
        serial_number: serial.to_string(),
    }
}

pub fn reading(device_id: &str, minute_offset: i64, fields: &[(&str, f64)]) -> Reading {
    Reading {
        device_id: device_id.to_string(),
        timestamp: minute(minute_offset),
        serial_number: format!("SN-{device_id}"),
        fields: fields
            .iter()
            .map(|(name, value)| (name.to_string(), *value))
            .collect(),
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryDirectory {
    nodes: HashMap<String, Vec<HierarchyNode>>,
}

impl MemoryDirectory {
    pub fn insert(&mut self, company_id: &str, nodes: Vec<HierarchyNode>) {
        self.nodes.entry(company_id.to_string()).or_default().extend(nodes);
    }
}

impl DeviceDirectory for MemoryDirectory {
    fn hierarchy_nodes<'a>(
        &'a self,
        company_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<HierarchyNode>, StoreError>> {
        let nodes = self.nodes.get(company_id).cloned().unwrap_or_default();
        async move { Ok(nodes) }.boxed()
    }
}

/// Applies the same filtering, ordering and limiting contract as the Postgres store.
/// Field maps are kept as JSON so null and non-numeric entries behave as they do in jsonb.
#[derive(Debug, Clone, Default)]
pub struct MemoryReadingStore {
    devices: HashMap<String, Device>,
    readings: Vec<(Reading, JsonValue)>,
}

impl MemoryReadingStore {
    pub fn add_device(&mut self, device: Device) {
        self.devices.insert(device.id.clone(), device);
    }

    /// Known devices stamp their serial number onto the reading.
    pub fn add_reading(&mut self, reading: Reading) {
        let raw: serde_json::Map<String, JsonValue> = reading
            .fields
            .iter()
            .map(|(name, value)| (name.clone(), JsonValue::from(*value)))
            .collect();
        self.push_row(reading, JsonValue::Object(raw));
    }

    /// Stores a reading whose field map is arbitrary JSON, e.g. `{"GFR": null}`.
    pub fn add_raw_reading(&mut self, device_id: &str, minute_offset: i64, raw: JsonValue) {
        let mut row = reading(device_id, minute_offset, &[]);
        row.fields = field_values_from_json(&raw);
        self.push_row(row, raw);
    }

    fn push_row(&mut self, mut reading: Reading, raw: JsonValue) {
        if let Some(device) = self.devices.get(&reading.device_id) {
            reading.serial_number = device.serial_number.clone();
        }
        self.readings.push((reading, raw));
    }

    fn matching(&self, query: &ReadingQuery) -> Vec<Reading> {
        let mut rows: Vec<Reading> = self
            .readings
            .iter()
            .filter(|(reading, raw)| {
                let Some(device) = self.devices.get(&reading.device_id) else {
                    return false;
                };
                let in_filter = match &query.devices {
                    DeviceFilter::All => true,
                    DeviceFilter::Only(ids) => ids.contains(&reading.device_id),
                };
                device.company_id == query.company_id
                    && device.device_type_id == query.device_type_id
                    && in_filter
                    && reading.timestamp >= query.range.start
                    && reading.timestamp <= query.range.end
                    && has_numeric_field(raw, &query.required_fields)
            })
            .map(|(reading, _)| reading.clone())
            .collect();
        rows.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.serial_number.cmp(&b.serial_number))
        });
        rows.truncate(query.limit);
        rows
    }
}

impl ReadingStore for MemoryReadingStore {
    fn fetch_readings<'a>(
        &'a self,
        query: &'a ReadingQuery,
    ) -> BoxFuture<'a, Result<Vec<Reading>, StoreError>> {
        let rows = self.matching(query);
        async move { Ok(rows) }.boxed()
    }
}

/// Fails any query whose presence filter touches one of `failing_fields`.
#[derive(Debug, Clone, Default)]
pub struct FailingReadingStore {
    inner: MemoryReadingStore,
    failing_fields: Vec<String>,
}

impl FailingReadingStore {
    pub fn for_fields(fields: &[&str]) -> Self {
        Self::wrapping(MemoryReadingStore::default(), fields)
    }

    pub fn wrapping(inner: MemoryReadingStore, fields: &[&str]) -> Self {
        Self {
            inner,
            failing_fields: fields.iter().map(|f| f.to_string()).collect(),
        }
    }
}

impl ReadingStore for FailingReadingStore {
    fn fetch_readings<'a>(
        &'a self,
        query: &'a ReadingQuery,
    ) -> BoxFuture<'a, Result<Vec<Reading>, StoreError>> {
        let fails = query
            .required_fields
            .iter()
            .any(|field| self.failing_fields.contains(field));
        if fails {
            return async {
                Err::<Vec<Reading>, _>(StoreError::Unavailable("connection reset".to_string()))
            }
            .boxed();
        }
        self.inner.fetch_readings(query)
    }
}

#[derive(Debug, Clone)]
pub struct SlowReadingStore {
    delay: Duration,
}

impl SlowReadingStore {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl ReadingStore for SlowReadingStore {
    fn fetch_readings<'a>(
        &'a self,
        _query: &'a ReadingQuery,
    ) -> BoxFuture<'a, Result<Vec<Reading>, StoreError>> {
        let delay = self.delay;
        async move {
            tokio::time::sleep(delay).await;
            Ok(Vec::new())
        }
        .boxed()
    }
}

pub fn test_config() -> ServerConfig {
    ServerConfig {
        database_url: "postgresql://postgres@localhost/postgres".to_string(),
        formulas_path: None,
        raw_fields: None,
        max_limit: 100_000,
        max_variables: 32,
        max_window_hours: 24 * 365,
        request_timeout_ms: 5_000,
    }
}

pub fn test_state(directory: MemoryDirectory, readings: MemoryReadingStore) -> AppState {
    let config = test_config();
    let series = SeriesEngine::new(
        Arc::new(FormulaRegistry::builtin()),
        Arc::new(directory),
        Arc::new(readings),
        QueryLimits {
            timeout: Duration::from_millis(config.request_timeout_ms),
            ..QueryLimits::default()
        },
    );
    AppState {
        config,
        series: Arc::new(series),
        shutdown: CancellationToken::new(),
    }
}
