//! Source extraction
//!
//! Streams rows out of the source relational database through a server-side
//! cursor, decoding each row into JSON dynamically by column type. Postgres
//! and MySQL sources are supported; the scan predicate is shaped by the job's
//! action at plan time, so the streaming loop itself is action-agnostic.

use anyhow::{Context, Result};
use bigdecimal::ToPrimitive;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::{Map, Value};
use sqlx::mysql::{MySqlPoolOptions, MySqlRow};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Column, MySqlPool, PgPool, Row, TypeInfo};
use thiserror::Error;

use crate::dataset::Dataset;
use crate::job::{SyncAction, SyncRequest};

/// Identifier quoting differs per source dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceDialect {
    Postgres,
    MySql,
}

impl SourceDialect {
    fn quote(&self, identifier: &str) -> String {
        match self {
            SourceDialect::Postgres => format!("\"{identifier}\""),
            SourceDialect::MySql => format!("`{identifier}`"),
        }
    }
}

/// A scan plan could not be built from the job and dataset.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScanPlanError {
    #[error("dataset {0} has no column mapping to select")]
    NoColumns(String),

    #[error("dataset {0} has no partition column; {1} needs one")]
    NoPartitionColumn(String, SyncAction),
}

/// One SELECT the pipeline will stream, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanQuery {
    pub sql: String,
    pub description: String,
}

/// Build the ordered scan list for a job. Pure: the caller supplies `today`
/// so window predicates are deterministic under test.
pub fn build_scan_queries(
    dataset: &Dataset,
    request: &SyncRequest,
    window_days: u32,
    today: NaiveDate,
    dialect: SourceDialect,
) -> Result<Vec<ScanQuery>, ScanPlanError> {
    if dataset.columns.is_empty() {
        return Err(ScanPlanError::NoColumns(dataset.id.clone()));
    }

    let select_list = dataset
        .columns
        .iter()
        .map(|c| dialect.quote(&c.source_column))
        .collect::<Vec<_>>()
        .join(", ");
    let base = format!("SELECT {select_list} FROM {}", dataset.source_table);

    let pk = dialect.quote(
        request
            .pk_column
            .as_deref()
            .unwrap_or(&dataset.primary_key_column),
    );

    let queries = match request.action {
        SyncAction::InitialSync | SyncAction::FullRefresh => vec![ScanQuery {
            sql: base,
            description: "full scan".to_string(),
        }],
        SyncAction::IncrementalSync | SyncAction::ManualSync => {
            let column = partition_column(dataset, request.action)?;
            let start = today - chrono::Days::new(u64::from(window_days));
            vec![ScanQuery {
                sql: format!("{base} WHERE {column} >= '{start}'"),
                description: format!("window scan since {start}"),
            }]
        }
        SyncAction::PartialRefresh => {
            let column = partition_column(dataset, request.action)?;
            let days = request.days.unwrap_or(window_days);
            let start = today - chrono::Days::new(u64::from(days));
            vec![ScanQuery {
                sql: format!("{base} WHERE {column} >= '{start}'"),
                description: format!("partial refresh since {start}"),
            }]
        }
        SyncAction::MissingSync => request
            .ranges
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|range| ScanQuery {
                sql: format!(
                    "{base} WHERE {pk} BETWEEN {start} AND {end} ORDER BY {pk}",
                    start = range.start,
                    end = range.end
                ),
                description: format!("backfill range {}..={}", range.start, range.end),
            })
            .collect(),
        SyncAction::NewRecordsSync => {
            let after_id = request.after_id.unwrap_or(0);
            let mut sql = format!("{base} WHERE {pk} > {after_id} ORDER BY {pk} ASC");
            if let Some(limit) = request.limit {
                sql.push_str(&format!(" LIMIT {limit}"));
            }
            vec![ScanQuery {
                sql,
                description: format!("tail scan after {after_id}"),
            }]
        }
    };

    Ok(queries)
}

fn partition_column(
    dataset: &Dataset,
    action: SyncAction,
) -> Result<String, ScanPlanError> {
    dataset
        .partition_column
        .as_deref()
        .map(str::to_string)
        .ok_or_else(|| ScanPlanError::NoPartitionColumn(dataset.id.clone(), action))
}

/// A connected source database.
pub enum SourcePool {
    Postgres(PgPool),
    MySql(MySqlPool),
}

impl SourcePool {
    /// Connect by URL scheme. Pools stay small: the pipeline runs one
    /// streaming cursor at a time.
    pub async fn connect(url: &str) -> Result<Self> {
        if url.starts_with("mysql://") {
            let pool = MySqlPoolOptions::new()
                .max_connections(2)
                .connect(url)
                .await
                .context("Failed to connect to MySQL source")?;
            Ok(SourcePool::MySql(pool))
        } else if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            let pool = PgPoolOptions::new()
                .max_connections(2)
                .connect(url)
                .await
                .context("Failed to connect to Postgres source")?;
            Ok(SourcePool::Postgres(pool))
        } else {
            anyhow::bail!("Unsupported source URL scheme: {url}");
        }
    }

    pub fn dialect(&self) -> SourceDialect {
        match self {
            SourcePool::Postgres(_) => SourceDialect::Postgres,
            SourcePool::MySql(_) => SourceDialect::MySql,
        }
    }

    /// Open a server-side streaming read. Rows arrive in cursor order as JSON
    /// objects keyed by source column name.
    pub fn stream<'a>(&'a self, sql: &'a str) -> BoxStream<'a, Result<Map<String, Value>>> {
        match self {
            SourcePool::Postgres(pool) => sqlx::query(sql)
                .fetch(pool)
                .map(|item| {
                    item.context("Source cursor read failed")
                        .and_then(|row| decode_pg_row(&row))
                })
                .boxed(),
            SourcePool::MySql(pool) => sqlx::query(sql)
                .fetch(pool)
                .map(|item| {
                    item.context("Source cursor read failed")
                        .and_then(|row| decode_mysql_row(&row))
                })
                .boxed(),
        }
    }

    pub async fn close(&self) {
        match self {
            SourcePool::Postgres(pool) => pool.close().await,
            SourcePool::MySql(pool) => pool.close().await,
        }
    }
}

const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn decode_pg_row(row: &PgRow) -> Result<Map<String, Value>> {
    let mut out = Map::with_capacity(row.columns().len());

    for (i, column) in row.columns().iter().enumerate() {
        let value = match column.type_info().name() {
            "INT2" => row.try_get::<Option<i16>, _>(i)?.map(Value::from),
            "INT4" => row.try_get::<Option<i32>, _>(i)?.map(Value::from),
            "INT8" => row.try_get::<Option<i64>, _>(i)?.map(Value::from),
            "FLOAT4" => row
                .try_get::<Option<f32>, _>(i)?
                .map(|v| Value::from(f64::from(v))),
            "FLOAT8" => row.try_get::<Option<f64>, _>(i)?.map(Value::from),
            "NUMERIC" => row
                .try_get::<Option<bigdecimal::BigDecimal>, _>(i)?
                .and_then(|d| d.to_f64())
                .map(Value::from),
            "BOOL" => row.try_get::<Option<bool>, _>(i)?.map(Value::from),
            "UUID" => row
                .try_get::<Option<uuid::Uuid>, _>(i)?
                .map(|u| Value::from(u.to_string())),
            "DATE" => row
                .try_get::<Option<NaiveDate>, _>(i)?
                .map(|d| Value::from(d.format("%Y-%m-%d").to_string())),
            "TIMESTAMP" => row
                .try_get::<Option<NaiveDateTime>, _>(i)?
                .map(|t| Value::from(t.format(DATETIME_FORMAT).to_string())),
            "TIMESTAMPTZ" => row
                .try_get::<Option<DateTime<Utc>>, _>(i)?
                .map(|t| Value::from(t.format(DATETIME_FORMAT).to_string())),
            "JSON" | "JSONB" => row.try_get::<Option<Value>, _>(i)?,
            _ => row.try_get::<Option<String>, _>(i).unwrap_or(None).map(Value::from),
        };

        out.insert(column.name().to_string(), value.unwrap_or(Value::Null));
    }

    Ok(out)
}

fn decode_mysql_row(row: &MySqlRow) -> Result<Map<String, Value>> {
    let mut out = Map::with_capacity(row.columns().len());

    for (i, column) in row.columns().iter().enumerate() {
        let value = match column.type_info().name() {
            "TINYINT" | "BOOLEAN" => row.try_get::<Option<i8>, _>(i)?.map(Value::from),
            "SMALLINT" => row.try_get::<Option<i16>, _>(i)?.map(Value::from),
            "MEDIUMINT" | "INT" => row.try_get::<Option<i32>, _>(i)?.map(Value::from),
            "BIGINT" => row.try_get::<Option<i64>, _>(i)?.map(Value::from),
            "TINYINT UNSIGNED" => row.try_get::<Option<u8>, _>(i)?.map(Value::from),
            "SMALLINT UNSIGNED" => row.try_get::<Option<u16>, _>(i)?.map(Value::from),
            "MEDIUMINT UNSIGNED" | "INT UNSIGNED" => {
                row.try_get::<Option<u32>, _>(i)?.map(Value::from)
            }
            "BIGINT UNSIGNED" => row.try_get::<Option<u64>, _>(i)?.map(Value::from),
            "FLOAT" => row
                .try_get::<Option<f32>, _>(i)?
                .map(|v| Value::from(f64::from(v))),
            "DOUBLE" => row.try_get::<Option<f64>, _>(i)?.map(Value::from),
            "DECIMAL" => row
                .try_get::<Option<bigdecimal::BigDecimal>, _>(i)?
                .and_then(|d| d.to_f64())
                .map(Value::from),
            "DATE" => row
                .try_get::<Option<NaiveDate>, _>(i)?
                .map(|d| Value::from(d.format("%Y-%m-%d").to_string())),
            "DATETIME" => row
                .try_get::<Option<NaiveDateTime>, _>(i)?
                .map(|t| Value::from(t.format(DATETIME_FORMAT).to_string())),
            "TIMESTAMP" => row
                .try_get::<Option<DateTime<Utc>>, _>(i)?
                .map(|t| Value::from(t.format(DATETIME_FORMAT).to_string())),
            "JSON" => row.try_get::<Option<Value>, _>(i)?,
            _ => row.try_get::<Option<String>, _>(i).unwrap_or(None).map(Value::from),
        };

        out.insert(column.name().to_string(), value.unwrap_or(Value::Null));
    }

    Ok(out)
}
