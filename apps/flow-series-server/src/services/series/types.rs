use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::{HashMap, HashSet};

use crate::time::TimeRangeSpec;

/// Numeric field values of a single reading. A field that the device did not report
/// (or reported as null) is simply missing from the map.
pub type FieldValues = HashMap<String, f64>;

#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub id: String,
    pub company_id: String,
    pub device_type_id: String,
    pub serial_number: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub serial_number: String,
    pub fields: FieldValues,
}

impl Reading {
    pub fn has_any_field(&self, names: &[String]) -> bool {
        names.iter().any(|name| self.fields.contains_key(name))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HierarchyNode {
    pub id: String,
    pub parent_id: Option<String>,
    pub member_device_ids: Vec<String>,
}

/// Inclusive `[start, end]` window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceFilter {
    /// No hierarchy restriction: every device of the company/device type.
    All,
    Only(HashSet<String>),
}

impl DeviceFilter {
    pub fn is_empty_set(&self) -> bool {
        matches!(self, DeviceFilter::Only(ids) if ids.is_empty())
    }
}

/// Company and device type supplied by the authenticated upstream layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestScope {
    pub company_id: String,
    pub device_type_id: String,
}

#[derive(Debug, Clone)]
pub struct ReadingQuery {
    pub company_id: String,
    pub device_type_id: String,
    pub devices: DeviceFilter,
    pub required_fields: Vec<String>,
    pub range: TimeRange,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VariableRequest {
    pub variable_name: String,
    pub variable_tag: String,
    #[serde(default)]
    pub unit: String,
}

#[derive(Debug, Clone, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SeriesRequest {
    #[serde(default)]
    pub widget_id: String,
    pub variables: Vec<VariableRequest>,
    #[serde(default)]
    pub hierarchy_id: Option<String>,
    pub time_range: TimeRangeSpec,
    /// Signed so that zero/negative values reach validation instead of failing decoding.
    pub limit: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResultPoint {
    pub timestamp: DateTime<Utc>,
    pub serial_number: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SeriesResult {
    pub data: Vec<ResultPoint>,
    pub unit: String,
    pub property_name: String,
    /// Set when this variable's fetch failed; `data` is then empty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Keyed series results that serialize as a JSON object in request order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeriesData(pub Vec<(String, SeriesResult)>);

impl SeriesData {
    pub fn get(&self, name: &str) -> Option<&SeriesResult> {
        self.0
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, result)| result)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(key, _)| key.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for SeriesData {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, value) in &self.0 {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SeriesResponse {
    #[schema(value_type = Object)]
    pub series_data: SeriesData,
}
