//! Date-partitioned staging writer
//!
//! Staged files live at
//! `{root}/{table}/ingestion_date=YYYY-MM-DD/part-{uuid}.snappy.parquet`.
//! A write puts exactly one new part file and, for the overwrite modes,
//! removes the files it supersedes only after that put succeeded. A crash
//! therefore leaves either the old files, or the old files plus the new one.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use chrono::NaiveDate;
use lakeshore_common::types::{Batch, DataType, Value};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::codec::{self, PARQUET_CONTENT_TYPE};
use crate::error::{PipelineError, Result};
use crate::normalize::INGESTION_DATE;
use crate::storage::ObjectStore;

pub const DEFAULT_STAGING_ROOT: &str = "staging";
pub const PART_SUFFIX: &str = ".snappy.parquet";

/// How a write treats files already in the destination
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Replace only the partition being written
    #[default]
    OverwritePartition,
    /// Add a part file next to existing ones
    Append,
    /// Replace every partition of the table
    OverwriteAll,
}

impl WriteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteMode::OverwritePartition => "overwrite_partition",
            WriteMode::Append => "append",
            WriteMode::OverwriteAll => "overwrite_all",
        }
    }
}

/// Writes normalized batches into the staging area of one store
#[derive(Clone)]
pub struct PartitionedWriter {
    store: Arc<dyn ObjectStore>,
    root: String,
}

impl PartitionedWriter {
    pub fn new(store: Arc<dyn ObjectStore>, root: impl Into<String>) -> Self {
        let root: String = root.into();
        Self {
            store,
            root: root.trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn table_prefix(&self, table: &str) -> String {
        format!("{}/{}/", self.root, table)
    }

    pub fn partition_prefix(&self, table: &str, date: NaiveDate) -> String {
        format!("{}{}={}/", self.table_prefix(table), INGESTION_DATE, date.format("%Y-%m-%d"))
    }

    /// Keys of the part files currently in a partition
    pub async fn partition_files(&self, table: &str, date: NaiveDate) -> Result<Vec<String>> {
        let prefix = self.partition_prefix(table, date);
        let objects = self
            .store
            .list(&prefix)
            .await
            .map_err(|e| write_failure(table, date, e))?;
        Ok(objects
            .into_iter()
            .map(|o| o.key)
            .filter(|k| k.ends_with(".parquet"))
            .collect())
    }

    /// `Append` when the partition already holds files, otherwise
    /// `OverwritePartition`
    pub async fn probe_mode(&self, table: &str, date: NaiveDate) -> Result<WriteMode> {
        let existing = self.partition_files(table, date).await?;
        Ok(if existing.is_empty() {
            WriteMode::OverwritePartition
        } else {
            WriteMode::Append
        })
    }

    /// Write `batch` as one part file and return its row count.
    ///
    /// `partition_date` overrides both the partition and the batch's
    /// `ingestion_date` column; without it the partition comes from that
    /// column.
    #[instrument(skip(self, batch), fields(rows = batch.num_rows()))]
    pub async fn write(
        &self,
        batch: &Batch,
        table: &str,
        mode: WriteMode,
        partition_date: Option<NaiveDate>,
    ) -> Result<usize> {
        if batch.is_empty() {
            warn!(table, "Empty batch; nothing written");
            return Ok(0);
        }

        let (date, batch) = match partition_date.or_else(|| partition_of(batch)) {
            Some(date) => (
                date,
                batch
                    .clone()
                    .with_constant(INGESTION_DATE, DataType::Date, Value::Date(date)),
            ),
            None => {
                return Err(PipelineError::WriteFailure {
                    table: table.to_string(),
                    partition: "unknown".to_string(),
                    source: anyhow!("batch has no {} value and no partition date was given", INGESTION_DATE),
                });
            },
        };

        let body = codec::encode(&batch).map_err(|e| write_failure(table, date, e))?;
        let key = format!(
            "{}part-{}{}",
            self.partition_prefix(table, date),
            uuid::Uuid::new_v4().simple(),
            PART_SUFFIX
        );

        self.store
            .put(&key, body, Some(PARQUET_CONTENT_TYPE))
            .await
            .with_context(|| format!("Failed to stage {}", key))
            .map_err(|e| write_failure(table, date, e))?;

        let superseded_prefix = match mode {
            WriteMode::Append => None,
            WriteMode::OverwritePartition => Some(self.partition_prefix(table, date)),
            WriteMode::OverwriteAll => Some(self.table_prefix(table)),
        };
        if let Some(prefix) = superseded_prefix {
            let existing = self
                .store
                .list(&prefix)
                .await
                .map_err(|e| write_failure(table, date, e))?;
            for old in existing.into_iter().filter(|o| o.key != key) {
                debug!(key = %old.key, "Removing superseded staged file");
                self.store
                    .delete(&old.key)
                    .await
                    .map_err(|e| write_failure(table, date, e))?;
            }
        }

        info!(
            table,
            partition = %date,
            mode = mode.as_str(),
            rows = batch.num_rows(),
            key = %key,
            "Staged batch"
        );
        Ok(batch.num_rows())
    }
}

fn partition_of(batch: &Batch) -> Option<NaiveDate> {
    let idx = batch.schema().index_of(INGESTION_DATE)?;
    batch.column_values(idx).find_map(|v| match v {
        Value::Date(d) => Some(*d),
        _ => None,
    })
}

fn write_failure(table: &str, date: NaiveDate, source: anyhow::Error) -> PipelineError {
    PipelineError::WriteFailure {
        table: table.to_string(),
        partition: format!("{}={}", INGESTION_DATE, date),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::{normalize, IngestionStamp};
    use crate::storage::LocalStore;
    use lakeshore_common::types::{Column, Schema};

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 11, d).unwrap()
    }

    fn rows(n: i64, run: NaiveDate) -> Batch {
        let schema = Schema::new(vec![Column::new("id", DataType::Int64)]);
        let raw = Batch::try_new(schema, (0..n).map(|i| vec![Value::Int64(i)]).collect()).unwrap();
        normalize(&raw, &IngestionStamp::now("test", run))
    }

    fn writer() -> (tempfile::TempDir, PartitionedWriter) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalStore::new(dir.path()).unwrap());
        (dir, PartitionedWriter::new(store, DEFAULT_STAGING_ROOT))
    }

    #[test]
    fn test_partition_layout() {
        let (_dir, writer) = writer();
        assert_eq!(
            writer.partition_prefix("agents", date(20)),
            "staging/agents/ingestion_date=2025-11-20/"
        );
    }

    #[tokio::test]
    async fn test_empty_batch_writes_nothing() {
        let (_dir, writer) = writer();
        let written = writer
            .write(&rows(0, date(20)), "agents", WriteMode::OverwritePartition, None)
            .await
            .unwrap();
        assert_eq!(written, 0);
        assert!(writer.partition_files("agents", date(20)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_overwrite_partition_replaces_only_that_partition() {
        let (_dir, writer) = writer();
        writer.write(&rows(3, date(20)), "t", WriteMode::OverwritePartition, None).await.unwrap();
        writer.write(&rows(2, date(21)), "t", WriteMode::OverwritePartition, None).await.unwrap();
        writer.write(&rows(5, date(20)), "t", WriteMode::OverwritePartition, None).await.unwrap();

        assert_eq!(writer.partition_files("t", date(20)).await.unwrap().len(), 1);
        assert_eq!(writer.partition_files("t", date(21)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_append_and_probe() {
        let (_dir, writer) = writer();
        assert_eq!(writer.probe_mode("t", date(20)).await.unwrap(), WriteMode::OverwritePartition);

        writer.write(&rows(1, date(20)), "t", WriteMode::Append, None).await.unwrap();
        writer.write(&rows(1, date(20)), "t", WriteMode::Append, None).await.unwrap();

        assert_eq!(writer.partition_files("t", date(20)).await.unwrap().len(), 2);
        assert_eq!(writer.probe_mode("t", date(20)).await.unwrap(), WriteMode::Append);
    }

    #[tokio::test]
    async fn test_overwrite_all_clears_other_partitions() {
        let (_dir, writer) = writer();
        writer.write(&rows(1, date(19)), "t", WriteMode::Append, None).await.unwrap();
        writer.write(&rows(1, date(20)), "t", WriteMode::OverwriteAll, None).await.unwrap();

        assert!(writer.partition_files("t", date(19)).await.unwrap().is_empty());
        assert_eq!(writer.partition_files("t", date(20)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_partition_date_override_rewrites_column() {
        let (_dir, writer) = writer();
        writer
            .write(&rows(2, date(20)), "social", WriteMode::Append, Some(date(3)))
            .await
            .unwrap();

        let files = writer.partition_files("social", date(3)).await.unwrap();
        assert_eq!(files.len(), 1);
        let data = writer.store.get(&files[0]).await.unwrap().unwrap();
        let staged = codec::decode(data).unwrap();
        let idx = staged.schema().index_of(INGESTION_DATE).unwrap();
        assert!(staged.column_values(idx).all(|v| *v == Value::Date(date(3))));
    }
}
