//! Warehouse adapters
//!
//! The merge engine drives a [`WarehouseSession`]: ephemeral tables live
//! only as long as the session, so one merge uses exactly one session.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use lakeshore_common::types::{Batch, Column, Schema};
use serde::{Deserialize, Serialize};

mod memory;
mod postgres;
pub mod sql;

pub use memory::MemoryWarehouse;
pub use postgres::PostgresWarehouse;

pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// A staged file as presented to the loader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub key: String,
    /// Content token; a table never loads the same token twice
    pub token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded(u64),
    /// Already loaded into this table
    Skipped,
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    fn name(&self) -> &'static str;

    async fn session(&self) -> Result<Box<dyn WarehouseSession>>;
}

#[async_trait]
pub trait WarehouseSession: Send {
    /// Create (or replace) a table visible only to this session
    async fn create_temp_table(&mut self, name: &str, schema: &Schema) -> Result<()>;

    async fn rename_column(&mut self, table: &str, from: &str, to: &str) -> Result<()>;

    /// Columns of `table`, `None` when it does not exist
    async fn describe(&mut self, table: &str) -> Result<Option<Schema>>;

    /// Create a permanent table with the columns of `template`
    async fn create_table_like(&mut self, target: &str, template: &str) -> Result<()>;

    async fn add_column(&mut self, table: &str, column: &Column) -> Result<()>;

    /// Remove all rows and forget which files were loaded
    async fn truncate(&mut self, table: &str) -> Result<()>;

    /// Bulk-load one staged file's rows unless its token was already loaded
    async fn load(&mut self, table: &str, file: &StagedFile, rows: &Batch) -> Result<LoadOutcome>;

    async fn count(&mut self, table: &str) -> Result<u64>;

    /// Session table `dest` with one row per key: the row with the greatest
    /// `order_by` value, or the last loaded row when `order_by` is `None`
    async fn deduplicate(&mut self, source: &str, dest: &str, keys: &[String], order_by: Option<&str>) -> Result<()>;

    /// Upsert `source` into `target` in one statement; returns rows affected
    async fn merge(&mut self, target: &str, source: &str, keys: &[String], columns: &[String]) -> Result<u64>;
}

/// Which warehouse to merge into
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum WarehouseConfig {
    Postgres {
        url: String,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
    },
    /// In-process tables, discarded at exit; for dry runs
    Memory,
}

fn default_max_connections() -> u32 {
    DEFAULT_MAX_CONNECTIONS
}

pub async fn connect(config: &WarehouseConfig) -> Result<Arc<dyn Warehouse>> {
    match config {
        WarehouseConfig::Postgres { url, max_connections } => {
            Ok(Arc::new(PostgresWarehouse::connect(url, *max_connections).await?))
        },
        WarehouseConfig::Memory => Ok(Arc::new(MemoryWarehouse::new())),
    }
}
