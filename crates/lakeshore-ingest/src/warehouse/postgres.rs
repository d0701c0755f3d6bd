use anyhow::{Context, Result};
use async_trait::async_trait;
use lakeshore_common::types::{Batch, Column, DataType, Schema, Value};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::query_builder::Separated;
use sqlx::{Connection, Postgres, QueryBuilder};
use tracing::{debug, info, instrument};

use super::sql::{self, quote_ident, LOAD_HISTORY_TABLE};
use super::{LoadOutcome, StagedFile, Warehouse, WarehouseSession};

/// Bind parameters allowed in one PostgreSQL statement
const MAX_BIND_PARAMS: usize = 65_535;

/// PostgreSQL 15+ warehouse (the upsert uses `MERGE`)
#[derive(Clone)]
pub struct PostgresWarehouse {
    pool: PgPool,
}

impl PostgresWarehouse {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .context("Failed to connect to warehouse")?;
        info!("Connected to PostgreSQL warehouse");
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Warehouse for PostgresWarehouse {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn session(&self) -> Result<Box<dyn WarehouseSession>> {
        let mut conn = self.pool.acquire().await.context("Failed to acquire connection")?;
        sqlx::query(&sql::create_load_history())
            .execute(&mut *conn)
            .await
            .context("Failed to prepare load history")?;
        Ok(Box::new(PgSession { conn }))
    }
}

/// One pooled connection; temporary tables live as long as it does
struct PgSession {
    conn: PoolConnection<Postgres>,
}

impl PgSession {
    async fn exec(&mut self, statement: &str) -> Result<u64> {
        debug!(sql = statement, "Executing");
        let result = sqlx::query(statement)
            .execute(&mut *self.conn)
            .await
            .with_context(|| format!("Statement failed: {}", statement))?;
        Ok(result.rows_affected())
    }
}

fn bind_value(b: &mut Separated<'_, '_, Postgres, &'static str>, value: &Value, data_type: DataType) {
    match value {
        Value::Boolean(v) => b.push_bind(*v),
        Value::Int64(v) => b.push_bind(*v),
        Value::Float64(v) => b.push_bind(*v),
        Value::Utf8(v) => b.push_bind(v.clone()),
        Value::Date(v) => b.push_bind(*v),
        Value::Timestamp(v) => b.push_bind(*v),
        Value::Null => match data_type {
            DataType::Boolean => b.push_bind(None::<bool>),
            DataType::Int64 => b.push_bind(None::<i64>),
            DataType::Float64 => b.push_bind(None::<f64>),
            DataType::Utf8 => b.push_bind(None::<String>),
            DataType::Date => b.push_bind(None::<chrono::NaiveDate>),
            DataType::Timestamp => b.push_bind(None::<chrono::DateTime<chrono::Utc>>),
        },
    };
}

#[async_trait]
impl WarehouseSession for PgSession {
    async fn create_temp_table(&mut self, name: &str, schema: &Schema) -> Result<()> {
        self.exec(&sql::drop_temp_table(name)).await?;
        self.exec(&sql::create_temp_table(name, schema)).await?;
        sqlx::query(&format!("DELETE FROM {} WHERE table_name = $1", quote_ident(LOAD_HISTORY_TABLE)))
            .bind(name)
            .execute(&mut *self.conn)
            .await
            .context("Failed to reset load history")?;
        Ok(())
    }

    async fn rename_column(&mut self, table: &str, from: &str, to: &str) -> Result<()> {
        self.exec(&sql::rename_column(table, from, to)).await.map(|_| ())
    }

    async fn describe(&mut self, table: &str) -> Result<Option<Schema>> {
        let relation = quote_ident(table);
        let exists: Option<String> = sqlx::query_scalar(sql::REGCLASS_QUERY)
            .bind(&relation)
            .fetch_one(&mut *self.conn)
            .await
            .context("Failed to look up table")?;
        if exists.is_none() {
            return Ok(None);
        }

        let columns: Vec<(String, String)> = sqlx::query_as(sql::DESCRIBE_QUERY)
            .bind(&relation)
            .fetch_all(&mut *self.conn)
            .await
            .context("Failed to describe table")?;
        Ok(Some(Schema::new(
            columns
                .into_iter()
                .map(|(name, pg_type)| Column::new(name, sql::data_type_of(&pg_type)))
                .collect(),
        )))
    }

    async fn create_table_like(&mut self, target: &str, template: &str) -> Result<()> {
        self.exec(&sql::create_table_like(target, template)).await.map(|_| ())
    }

    async fn add_column(&mut self, table: &str, column: &Column) -> Result<()> {
        self.exec(&sql::add_column(table, column)).await.map(|_| ())
    }

    async fn truncate(&mut self, table: &str) -> Result<()> {
        self.exec(&sql::truncate(table)).await?;
        sqlx::query(&format!("DELETE FROM {} WHERE table_name = $1", quote_ident(LOAD_HISTORY_TABLE)))
            .bind(table)
            .execute(&mut *self.conn)
            .await
            .context("Failed to reset load history")?;
        Ok(())
    }

    #[instrument(skip(self, rows), fields(key = %file.key))]
    async fn load(&mut self, table: &str, file: &StagedFile, rows: &Batch) -> Result<LoadOutcome> {
        let schema = self
            .describe(table)
            .await?
            .with_context(|| format!("table {} does not exist", table))?;
        let conformed = rows.conform_to(&schema);

        let mut tx = self.conn.begin().await.context("Failed to begin load")?;

        let claimed = sqlx::query(&format!(
            "INSERT INTO {} (table_name, token, file_key) VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
            quote_ident(LOAD_HISTORY_TABLE)
        ))
        .bind(table)
        .bind(&file.token)
        .bind(&file.key)
        .execute(&mut *tx)
        .await
        .context("Failed to record load")?
        .rows_affected();
        if claimed == 0 {
            debug!("File already loaded; skipping");
            return Ok(LoadOutcome::Skipped);
        }

        let columns = schema.columns();
        if !columns.is_empty() && !conformed.is_empty() {
            let header = format!(
                "INSERT INTO {} ({}) ",
                quote_ident(table),
                columns.iter().map(|c| quote_ident(&c.name)).collect::<Vec<_>>().join(", ")
            );
            let rows_per_statement = (MAX_BIND_PARAMS / columns.len()).max(1);
            for chunk in conformed.rows().chunks(rows_per_statement) {
                let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(&header);
                builder.push_values(chunk, |mut b, row| {
                    for (value, column) in row.iter().zip(columns) {
                        bind_value(&mut b, value, column.data_type);
                    }
                });
                builder
                    .build()
                    .execute(&mut *tx)
                    .await
                    .context("Failed to insert staged rows")?;
            }
        }

        tx.commit().await.context("Failed to commit load")?;
        Ok(LoadOutcome::Loaded(conformed.num_rows() as u64))
    }

    async fn count(&mut self, table: &str) -> Result<u64> {
        let n: i64 = sqlx::query_scalar(&sql::count(table))
            .fetch_one(&mut *self.conn)
            .await
            .with_context(|| format!("Failed to count {}", table))?;
        Ok(n as u64)
    }

    async fn deduplicate(&mut self, source: &str, dest: &str, keys: &[String], order_by: Option<&str>) -> Result<()> {
        let columns = self
            .describe(source)
            .await?
            .with_context(|| format!("table {} does not exist", source))?
            .names();
        self.exec(&sql::drop_temp_table(dest)).await?;
        self.exec(&sql::deduplicate(source, dest, &columns, keys, order_by)).await?;
        Ok(())
    }

    async fn merge(&mut self, target: &str, source: &str, keys: &[String], columns: &[String]) -> Result<u64> {
        self.exec(&sql::merge(target, source, keys, columns)).await
    }
}
