//! Source readers
//!
//! A [`Source`] turns one configured input into work units and each unit
//! into a lazy stream of raw batches. Streams are consumed one chunk at a
//! time by the coordinator, which writes each chunk before pulling the next.

use async_trait::async_trait;
use chrono::NaiveDate;
use futures::stream::BoxStream;
use lakeshore_common::types::Batch;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ledger::{Ledger, SourceObjectRecord};

pub mod listing;
pub mod query;
pub mod snapshot;

pub use listing::{FileFormat, ListingSource, Partitioning};
pub use query::{PgSource, QuerySource, RelationalSource};
pub use snapshot::{GoogleSheetsClient, SheetClient, SnapshotSource};

pub const DEFAULT_CHUNK_ROWS: usize = 50_000;

/// What happens when one unit of a multi-unit source cannot be read
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Log, leave the unit out of the ledger commit, continue
    #[default]
    Skip,
    /// Fail the whole table
    Abort,
}

/// One independently readable piece of a source
#[derive(Debug, Clone, PartialEq)]
pub struct SourceUnit {
    /// Used in logs and reports
    pub label: String,
    /// Adapter-specific address: an object key, a query, a sheet range
    pub locator: String,
    /// Ledger record, for ledger-tracked sources
    pub object: Option<SourceObjectRecord>,
}

/// A chunk as read, before normalization
#[derive(Debug, Clone, PartialEq)]
pub struct RawBatch {
    pub batch: Batch,
    /// Partition to stage into instead of the run date
    pub partition_date: Option<NaiveDate>,
}

impl RawBatch {
    pub fn new(batch: Batch) -> Self {
        Self {
            batch,
            partition_date: None,
        }
    }

    pub fn with_partition(batch: Batch, partition_date: NaiveDate) -> Self {
        Self {
            batch,
            partition_date: Some(partition_date),
        }
    }
}

pub type BatchStream<'a> = BoxStream<'a, anyhow::Result<RawBatch>>;

#[async_trait]
pub trait Source: Send + Sync {
    /// Short name of the reader kind, e.g. `listing`
    fn kind(&self) -> &'static str;

    fn failure_policy(&self) -> FailurePolicy;

    /// Whether rows land in partitions other than the run date, so the
    /// writer must not clobber partitions staged by earlier runs
    fn probes_partitions(&self) -> bool {
        false
    }

    /// Units to read for `run_date`. Ledger-tracked sources drop units the
    /// ledger already holds.
    async fn discover(&self, run_date: NaiveDate, ledger: &Ledger) -> Result<Vec<SourceUnit>>;

    /// Stream the unit's rows in bounded chunks
    fn open<'a>(&'a self, unit: &'a SourceUnit) -> BatchStream<'a>;
}
