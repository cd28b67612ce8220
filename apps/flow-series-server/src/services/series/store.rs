//! Collaborator seams: the device/hierarchy directory and the reading store.
//!
//! The Postgres adapters expect:
//! - `devices(id, company_id, device_type_id, serial_number)`
//! - `device_readings(device_id, ts, serial_number, fields jsonb)`
//! - `hierarchy_nodes(id, company_id, parent_id)`
//! - `hierarchy_devices(hierarchy_id, device_id)`

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value as JsonValue;
use sqlx::types::Json as SqlJson;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};

use super::types::{DeviceFilter, FieldValues, HierarchyNode, Reading, ReadingQuery};
use crate::error::StoreError;

pub trait DeviceDirectory: Send + Sync {
    /// Every hierarchy node owned by the company.
    fn hierarchy_nodes<'a>(
        &'a self,
        company_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<HierarchyNode>, StoreError>>;
}

pub trait ReadingStore: Send + Sync {
    /// Readings matching the query, ordered by `(timestamp, serial_number)` and limited
    /// globally after ordering.
    fn fetch_readings<'a>(
        &'a self,
        query: &'a ReadingQuery,
    ) -> BoxFuture<'a, Result<Vec<Reading>, StoreError>>;
}

/// Decodes a JSONB field map; null and non-numeric values count as absent.
pub fn field_values_from_json(value: &JsonValue) -> FieldValues {
    let Some(obj) = value.as_object() else {
        return FieldValues::new();
    };
    obj.iter()
        .filter_map(|(name, value)| {
            value
                .as_f64()
                .filter(|v| v.is_finite())
                .map(|v| (name.clone(), v))
        })
        .collect()
}

/// Whether any of `names` holds a JSON number; the in-process twin of the SQL presence
/// predicate used by [`PgReadingStore`].
pub fn has_numeric_field(value: &JsonValue, names: &[String]) -> bool {
    names
        .iter()
        .any(|name| value.get(name).is_some_and(JsonValue::is_number))
}

#[derive(Debug, Clone)]
pub struct PgDeviceDirectory {
    pool: PgPool,
}

impl PgDeviceDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, Clone, FromRow)]
struct HierarchyRow {
    id: String,
    parent_id: Option<String>,
    device_ids: Vec<String>,
}

impl DeviceDirectory for PgDeviceDirectory {
    fn hierarchy_nodes<'a>(
        &'a self,
        company_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<HierarchyNode>, StoreError>> {
        async move {
            let rows: Vec<HierarchyRow> = sqlx::query_as(
                r#"
                SELECT
                    h.id,
                    h.parent_id,
                    COALESCE(
                        array_agg(m.device_id) FILTER (WHERE m.device_id IS NOT NULL),
                        '{}'::text[]
                    ) AS device_ids
                FROM hierarchy_nodes h
                LEFT JOIN hierarchy_devices m ON m.hierarchy_id = h.id
                WHERE h.company_id = $1
                GROUP BY h.id, h.parent_id
                "#,
            )
            .bind(company_id)
            .fetch_all(&self.pool)
            .await?;

            Ok(rows
                .into_iter()
                .map(|row| HierarchyNode {
                    id: row.id,
                    parent_id: row.parent_id,
                    member_device_ids: row.device_ids,
                })
                .collect())
        }
        .boxed()
    }
}

#[derive(Debug, Clone)]
pub struct PgReadingStore {
    pool: PgPool,
}

impl PgReadingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, Clone, FromRow)]
struct ReadingRow {
    device_id: String,
    ts: DateTime<Utc>,
    serial_number: String,
    fields: SqlJson<JsonValue>,
}

impl ReadingStore for PgReadingStore {
    fn fetch_readings<'a>(
        &'a self,
        query: &'a ReadingQuery,
    ) -> BoxFuture<'a, Result<Vec<Reading>, StoreError>> {
        async move {
            let limit = i64::try_from(query.limit).unwrap_or(i64::MAX);

            let mut qb = QueryBuilder::<Postgres>::new(
                r#"
                SELECT r.device_id, r.ts, r.serial_number, r.fields
                FROM device_readings r
                JOIN devices d ON d.id = r.device_id
                WHERE d.company_id = "#,
            );
            qb.push_bind(&query.company_id);
            qb.push(" AND d.device_type_id = ");
            qb.push_bind(&query.device_type_id);
            qb.push(" AND r.ts >= ");
            qb.push_bind(query.range.start);
            qb.push(" AND r.ts <= ");
            qb.push_bind(query.range.end);
            // Only numeric JSON values count as present.
            qb.push(" AND EXISTS (SELECT 1 FROM unnest(");
            qb.push_bind(&query.required_fields);
            qb.push("::text[]) AS f(name) WHERE jsonb_typeof(r.fields -> f.name) = 'number')");
            if let DeviceFilter::Only(ids) = &query.devices {
                let mut ids: Vec<String> = ids.iter().cloned().collect();
                ids.sort_unstable();
                qb.push(" AND r.device_id = ANY(");
                qb.push_bind(ids);
                qb.push(")");
            }
            qb.push(r#" ORDER BY r.ts ASC, r.serial_number COLLATE "C" ASC LIMIT "#);
            qb.push_bind(limit);

            let rows: Vec<ReadingRow> = qb.build_query_as().fetch_all(&self.pool).await?;

            Ok(rows
                .into_iter()
                .map(|row| Reading {
                    device_id: row.device_id,
                    timestamp: row.ts,
                    serial_number: row.serial_number,
                    fields: field_values_from_json(&row.fields.0),
                })
                .collect())
        }
        .boxed()
    }
}
