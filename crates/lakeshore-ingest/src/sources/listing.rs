//! Ledger-tracked object listing reader
//!
//! Lists objects under a prefix, keeps the ones the ledger has not seen and
//! streams each of them. CSV objects are read incrementally in chunks of
//! `chunk_rows` rows; JSON documents are parsed whole and re-chunked.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::NaiveDate;
use csv_async::{AsyncReader, AsyncReaderBuilder, StringRecord};
use futures::{stream, StreamExt, TryStreamExt};
use lakeshore_common::types::Batch;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use super::{BatchStream, FailurePolicy, RawBatch, Source, SourceUnit, DEFAULT_CHUNK_ROWS};
use crate::error::{PipelineError, Result};
use crate::ledger::{Ledger, SourceObjectRecord};
use crate::storage::{ObjectReader, ObjectStore};

/// Trailing `_YYYY-MM-DD.json` in an object name
const KEY_DATE_PATTERN: &str = r"_(\d{4}-\d{2}-\d{2})\.[A-Za-z]+$";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    Csv,
    Json,
}

/// Which partition an object's rows are staged into
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partitioning {
    #[default]
    RunDate,
    /// The event date embedded in the object name
    KeyDate,
}

pub struct ListingSource {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    suffix: String,
    format: FileFormat,
    chunk_rows: usize,
    partitioning: Partitioning,
    failure_policy: FailurePolicy,
}

impl ListingSource {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        prefix: impl Into<String>,
        suffix: impl Into<String>,
        format: FileFormat,
    ) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            suffix: suffix.into(),
            format,
            chunk_rows: DEFAULT_CHUNK_ROWS,
            partitioning: Partitioning::RunDate,
            failure_policy: FailurePolicy::Skip,
        }
    }

    pub fn with_chunk_rows(mut self, chunk_rows: usize) -> Self {
        self.chunk_rows = chunk_rows.max(1);
        self
    }

    pub fn with_partitioning(mut self, partitioning: Partitioning) -> Self {
        self.partitioning = partitioning;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    async fn open_object(&self, key: &str) -> anyhow::Result<BatchStream<'static>> {
        let partition = match self.partitioning {
            Partitioning::RunDate => None,
            Partitioning::KeyDate => Some(key_date(key)?),
        };
        let tag = move |batch: Batch| RawBatch {
            batch,
            partition_date: partition,
        };

        match self.format {
            FileFormat::Csv => {
                let reader = self.store.open(key).await?;
                Ok(csv_chunks(reader, self.chunk_rows).map_ok(tag).boxed())
            },
            FileFormat::Json => {
                let data = self
                    .store
                    .get(key)
                    .await?
                    .ok_or_else(|| anyhow!("object disappeared before it could be read"))?;
                let batches = json_chunks(&data, self.chunk_rows)?;
                Ok(stream::iter(batches.into_iter().map(move |b| Ok::<_, anyhow::Error>(tag(b)))).boxed())
            },
        }
    }
}

#[async_trait]
impl Source for ListingSource {
    fn kind(&self) -> &'static str {
        "listing"
    }

    fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    fn probes_partitions(&self) -> bool {
        self.partitioning == Partitioning::KeyDate
    }

    #[instrument(skip(self, ledger), fields(prefix = %self.prefix))]
    async fn discover(&self, _run_date: NaiveDate, ledger: &Ledger) -> Result<Vec<SourceUnit>> {
        let listed = self
            .store
            .list(&self.prefix)
            .await
            .map_err(|source| PipelineError::SourceRead {
                object: format!("{}/{}", self.store.location(), self.prefix),
                source,
            })?;

        let candidates: Vec<SourceObjectRecord> = listed
            .into_iter()
            .filter(|o| o.key.ends_with(&self.suffix))
            .map(SourceObjectRecord::from)
            .collect();
        debug!("Found {} candidate objects", candidates.len());

        let fresh = ledger.list_new(candidates).await?;
        info!(new = fresh.len(), "Discovered new source objects");

        Ok(fresh
            .into_iter()
            .map(|obj| SourceUnit {
                label: obj.key.clone(),
                locator: obj.key.clone(),
                object: Some(obj),
            })
            .collect())
    }

    fn open<'a>(&'a self, unit: &'a SourceUnit) -> BatchStream<'a> {
        stream::once(self.open_object(&unit.locator))
            .try_flatten()
            .boxed()
    }
}

/// Event date from a name such as `media_complaint_2025-11-20.json`
pub fn key_date(key: &str) -> anyhow::Result<NaiveDate> {
    let pattern = Regex::new(KEY_DATE_PATTERN).context("Invalid key date pattern")?;
    let raw = pattern
        .captures(key)
        .and_then(|c| c.get(1))
        .ok_or_else(|| anyhow!("no _YYYY-MM-DD date in object name {}", key))?;
    NaiveDate::parse_from_str(raw.as_str(), "%Y-%m-%d")
        .with_context(|| format!("invalid date in object name {}", key))
}

struct CsvChunker {
    reader: AsyncReader<ObjectReader>,
    headers: Option<Vec<String>>,
    chunk_rows: usize,
}

impl CsvChunker {
    async fn next_chunk(&mut self) -> anyhow::Result<Option<Batch>> {
        let headers = match &self.headers {
            Some(headers) => headers.clone(),
            None => {
                let headers: Vec<String> = self
                    .reader
                    .headers()
                    .await
                    .context("Failed to read CSV header")?
                    .iter()
                    .map(str::to_string)
                    .collect();
                self.headers = Some(headers.clone());
                headers
            },
        };

        let mut rows = Vec::new();
        let mut record = StringRecord::new();
        while rows.len() < self.chunk_rows
            && self
                .reader
                .read_record(&mut record)
                .await
                .context("Failed to read CSV record")?
        {
            rows.push(record.iter().map(str::to_string).collect::<Vec<_>>());
        }

        if rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(Batch::from_text_rows(&headers, &rows)))
    }
}

/// Stream a CSV body in batches of at most `chunk_rows` rows. Types are
/// inferred per chunk.
pub fn csv_chunks(reader: ObjectReader, chunk_rows: usize) -> futures::stream::BoxStream<'static, anyhow::Result<Batch>> {
    let chunker = CsvChunker {
        reader: AsyncReaderBuilder::new().flexible(true).create_reader(reader),
        headers: None,
        chunk_rows: chunk_rows.max(1),
    };

    stream::try_unfold(chunker, |mut chunker| async move {
        Ok::<_, anyhow::Error>(chunker.next_chunk().await?.map(|batch| (batch, chunker)))
    })
    .boxed()
}

/// Parse a JSON document holding one object or an array of objects and
/// split it into batches of `chunk_rows`
pub fn json_chunks(data: &[u8], chunk_rows: usize) -> anyhow::Result<Vec<Batch>> {
    let doc: serde_json::Value = serde_json::from_slice(data).context("Invalid JSON document")?;
    let objects = match doc {
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                serde_json::Value::Object(map) => Ok(map),
                other => Err(anyhow!("expected an object, found {}", other)),
            })
            .collect::<anyhow::Result<Vec<_>>>()?,
        serde_json::Value::Object(map) => vec![map],
        other => return Err(anyhow!("expected an object or array, found {}", other)),
    };

    Ok(objects
        .chunks(chunk_rows.max(1))
        .map(Batch::from_json_objects)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::DEFAULT_LEDGER_KEY;
    use crate::storage::LocalStore;
    use lakeshore_common::types::{DataType, Value};

    fn csv(rows: usize) -> Vec<u8> {
        let mut body = String::from("Customer ID,Name,Balance\n");
        for i in 0..rows {
            body.push_str(&format!("{},name{},{}.5\n", i, i, i));
        }
        body.into_bytes()
    }

    #[tokio::test]
    async fn test_csv_chunks_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();
        store.put("c.csv", csv(25), None).await.unwrap();

        let reader = store.open("c.csv").await.unwrap();
        let chunks: Vec<Batch> = csv_chunks(reader, 10).try_collect().await.unwrap();
        let sizes: Vec<usize> = chunks.iter().map(Batch::num_rows).collect();
        assert_eq!(sizes, vec![10, 10, 5]);
        assert_eq!(chunks[0].schema().names(), vec!["Customer ID", "Name", "Balance"]);
        assert_eq!(chunks[0].schema().columns()[2].data_type, DataType::Float64);
    }

    #[tokio::test]
    async fn test_header_only_csv_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();
        store.put("c.csv", csv(0), None).await.unwrap();

        let reader = store.open("c.csv").await.unwrap();
        let chunks: Vec<Batch> = csv_chunks(reader, 10).try_collect().await.unwrap();
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_json_document_shapes() {
        let array = br#"[{"id": 1, "user": {"name": "a"}}, {"id": 2}]"#;
        let batches = json_chunks(array, 1).unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].schema().names(), vec!["id", "user.name"]);

        let single = br#"{"id": 7}"#;
        let batches = json_chunks(single, 100).unwrap();
        assert_eq!(batches[0].rows()[0][0], Value::Int64(7));

        assert!(json_chunks(b"[1, 2]", 10).is_err());
        assert!(json_chunks(b"{broken", 10).is_err());
    }

    #[test]
    fn test_key_date() {
        assert_eq!(
            key_date("social_medias/media_complaint_2025-11-20.json").unwrap(),
            NaiveDate::from_ymd_opt(2025, 11, 20).unwrap()
        );
        assert!(key_date("social_medias/media_complaint.json").is_err());
        assert!(key_date("social_medias/x_2025-13-40.json").is_err());
    }

    #[tokio::test]
    async fn test_discover_filters_suffix_and_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalStore::new(dir.path()).unwrap());
        store.put("calls/a.csv", csv(1), None).await.unwrap();
        store.put("calls/b.csv", csv(1), None).await.unwrap();
        store.put("calls/notes.txt", b"x".to_vec(), None).await.unwrap();

        let ledger = Ledger::new(store.clone(), DEFAULT_LEDGER_KEY);
        let run = NaiveDate::from_ymd_opt(2025, 11, 20).unwrap();
        ledger
            .commit(
                &[SourceObjectRecord {
                    key: "calls/a.csv".into(),
                    last_modified: None,
                    size_bytes: 1,
                }],
                run,
            )
            .await
            .unwrap();

        let source = ListingSource::new(store, "calls/", ".csv", FileFormat::Csv);
        let units = source.discover(run, &ledger).await.unwrap();
        let labels: Vec<_> = units.iter().map(|u| u.label.as_str()).collect();
        assert_eq!(labels, vec!["calls/b.csv"]);
        assert!(units[0].object.is_some());
    }

    #[tokio::test]
    async fn test_open_key_date_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalStore::new(dir.path()).unwrap());
        store
            .put("social/post_2025-11-03.json", br#"[{"id": 1}]"#.to_vec(), None)
            .await
            .unwrap();

        let source = ListingSource::new(store, "social/", ".json", FileFormat::Json)
            .with_partitioning(Partitioning::KeyDate);
        let unit = SourceUnit {
            label: "social/post_2025-11-03.json".into(),
            locator: "social/post_2025-11-03.json".into(),
            object: None,
        };
        let batches: Vec<RawBatch> = source.open(&unit).try_collect().await.unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].partition_date, NaiveDate::from_ymd_opt(2025, 11, 3));
    }

    #[tokio::test]
    async fn test_open_missing_object_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalStore::new(dir.path()).unwrap());
        let source = ListingSource::new(store, "calls/", ".csv", FileFormat::Csv);
        let unit = SourceUnit {
            label: "calls/gone.csv".into(),
            locator: "calls/gone.csv".into(),
            object: None,
        };
        let result: anyhow::Result<Vec<RawBatch>> = source.open(&unit).try_collect().await;
        assert!(result.is_err());
    }
}
