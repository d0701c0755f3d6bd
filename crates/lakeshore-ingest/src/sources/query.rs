//! Chunked relational query reader
//!
//! Reads one date-suffixed table per run, e.g.
//! `customer_complaints.web_form_request_2025_11_23`, streaming rows from the
//! server and cutting them into chunks.

use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use futures::{future, stream::BoxStream, StreamExt, TryStreamExt};
use lakeshore_common::dates::table_suffix;
use lakeshore_common::types::{Batch, Column, DataType, Schema, Value};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Column as _, Row, TypeInfo};
use tracing::info;

use super::{BatchStream, FailurePolicy, RawBatch, Source, SourceUnit, DEFAULT_CHUNK_ROWS};
use crate::error::Result;
use crate::ledger::Ledger;
use crate::warehouse::sql::quote_ident;

/// A database able to stream a query's rows in batches
pub trait RelationalSource: Send + Sync {
    fn query_chunks<'a>(&'a self, sql: &'a str, chunk_rows: usize) -> BoxStream<'a, anyhow::Result<Batch>>;
}

pub struct QuerySource {
    db: Arc<dyn RelationalSource>,
    schema: String,
    table_prefix: String,
    chunk_rows: usize,
}

impl QuerySource {
    pub fn new(db: Arc<dyn RelationalSource>, schema: impl Into<String>, table_prefix: impl Into<String>) -> Self {
        Self {
            db,
            schema: schema.into(),
            table_prefix: table_prefix.into(),
            chunk_rows: DEFAULT_CHUNK_ROWS,
        }
    }

    pub fn with_chunk_rows(mut self, chunk_rows: usize) -> Self {
        self.chunk_rows = chunk_rows.max(1);
        self
    }

    /// Relation holding the rows of `run_date`
    pub fn relation(&self, run_date: NaiveDate) -> String {
        format!("{}.{}_{}", self.schema, self.table_prefix, table_suffix(run_date))
    }

    fn select_for(&self, run_date: NaiveDate) -> String {
        format!(
            "SELECT * FROM {}.{}",
            quote_ident(&self.schema),
            quote_ident(&format!("{}_{}", self.table_prefix, table_suffix(run_date)))
        )
    }
}

#[async_trait]
impl Source for QuerySource {
    fn kind(&self) -> &'static str {
        "query"
    }

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::Abort
    }

    async fn discover(&self, run_date: NaiveDate, _ledger: &Ledger) -> Result<Vec<SourceUnit>> {
        let relation = self.relation(run_date);
        info!(relation = %relation, "Querying run-date table");
        Ok(vec![SourceUnit {
            label: relation,
            locator: self.select_for(run_date),
            object: None,
        }])
    }

    fn open<'a>(&'a self, unit: &'a SourceUnit) -> BatchStream<'a> {
        self.db
            .query_chunks(&unit.locator, self.chunk_rows)
            .map_ok(RawBatch::new)
            .boxed()
    }
}

/// PostgreSQL adapter
#[derive(Clone)]
pub struct PgSource {
    pool: PgPool,
}

impl PgSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl RelationalSource for PgSource {
    fn query_chunks<'a>(&'a self, sql: &'a str, chunk_rows: usize) -> BoxStream<'a, anyhow::Result<Batch>> {
        sqlx::query(sql)
            .fetch(&self.pool)
            .map_err(anyhow::Error::from)
            .try_chunks(chunk_rows.max(1))
            .map_err(|e| e.1)
            .and_then(|rows| future::ready(rows_to_batch(&rows)))
            .boxed()
    }
}

fn column_type(pg_type: &str) -> DataType {
    match pg_type {
        "BOOL" => DataType::Boolean,
        "INT2" | "INT4" | "INT8" => DataType::Int64,
        "FLOAT4" | "FLOAT8" | "NUMERIC" => DataType::Float64,
        "DATE" => DataType::Date,
        "TIMESTAMP" | "TIMESTAMPTZ" => DataType::Timestamp,
        _ => DataType::Utf8,
    }
}

fn cell(row: &PgRow, index: usize, pg_type: &str) -> anyhow::Result<Value> {
    let value = match pg_type {
        "BOOL" => row.try_get::<Option<bool>, _>(index)?.map(Value::Boolean),
        "INT2" => row.try_get::<Option<i16>, _>(index)?.map(|v| Value::Int64(v as i64)),
        "INT4" => row.try_get::<Option<i32>, _>(index)?.map(|v| Value::Int64(v as i64)),
        "INT8" => row.try_get::<Option<i64>, _>(index)?.map(Value::Int64),
        "FLOAT4" => row.try_get::<Option<f32>, _>(index)?.map(|v| Value::Float64(v as f64)),
        "FLOAT8" => row.try_get::<Option<f64>, _>(index)?.map(Value::Float64),
        "NUMERIC" => row
            .try_get::<Option<sqlx::types::BigDecimal>, _>(index)?
            .and_then(|v| v.to_string().parse::<f64>().ok())
            .map(Value::Float64),
        "DATE" => row.try_get::<Option<NaiveDate>, _>(index)?.map(Value::Date),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(index)?
            .map(|ts| Value::Timestamp(ts.and_utc())),
        "TIMESTAMPTZ" => row.try_get::<Option<DateTime<Utc>>, _>(index)?.map(Value::Timestamp),
        "UUID" => row
            .try_get::<Option<sqlx::types::Uuid>, _>(index)?
            .map(|v| Value::Utf8(v.to_string())),
        "JSON" | "JSONB" => row
            .try_get::<Option<serde_json::Value>, _>(index)?
            .map(|v| Value::Utf8(v.to_string())),
        _ => row.try_get::<Option<String>, _>(index)?.map(Value::Utf8),
    };
    Ok(value.unwrap_or(Value::Null))
}

/// Convert one chunk of rows; all rows share the first row's columns
pub fn rows_to_batch(rows: &[PgRow]) -> anyhow::Result<Batch> {
    let Some(first) = rows.first() else {
        return Ok(Batch::default());
    };

    let types: Vec<String> = first
        .columns()
        .iter()
        .map(|c| c.type_info().name().to_string())
        .collect();
    let schema = Schema::new(
        first
            .columns()
            .iter()
            .zip(&types)
            .map(|(c, t)| Column::new(c.name(), column_type(t)))
            .collect(),
    );

    let mut values = Vec::with_capacity(rows.len());
    for row in rows {
        if row.len() != types.len() {
            bail!("row has {} columns, expected {}", row.len(), types.len());
        }
        let converted = types
            .iter()
            .enumerate()
            .map(|(i, t)| cell(row, i, t).with_context(|| format!("Failed to decode column {}", i)))
            .collect::<anyhow::Result<Vec<_>>>()?;
        values.push(converted);
    }

    Batch::try_new(schema, values).context("Query rows do not match their column types")
}
