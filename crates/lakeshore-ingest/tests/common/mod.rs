//! Shared fixtures for the pipeline integration tests

#![allow(dead_code)]

use std::sync::Arc;

use chrono::NaiveDate;
use lakeshore_common::types::Batch;
use lakeshore_ingest::config::PipelineConfig;
use lakeshore_ingest::coordinator::{Coordinator, MergeSpec, TablePipeline};
use lakeshore_ingest::ledger::{Ledger, DEFAULT_LEDGER_KEY};
use lakeshore_ingest::merge::MergeEngine;
use lakeshore_ingest::sources::{FileFormat, ListingSource, Source};
use lakeshore_ingest::storage::{LocalStore, ObjectStore};
use lakeshore_ingest::warehouse::MemoryWarehouse;
use lakeshore_ingest::wiring::{pipeline_for, Collaborators};
use lakeshore_ingest::writer::{PartitionedWriter, WriteMode, DEFAULT_STAGING_ROOT};
use tempfile::TempDir;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("lakeshore_ingest=debug")
        .with_test_writer()
        .try_init();
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// `id,name` CSV with one row per id, named `{prefix}{id}`
pub fn id_csv(ids: impl IntoIterator<Item = i64>, prefix: &str) -> String {
    let mut body = String::from("id,name\n");
    for id in ids {
        body.push_str(&format!("{},{}{}\n", id, prefix, id));
    }
    body
}

/// A local object store, a memory warehouse and a coordinator over both
pub struct Harness {
    _dir: TempDir,
    pub store: Arc<dyn ObjectStore>,
    pub warehouse: MemoryWarehouse,
}

impl Harness {
    pub fn new() -> Self {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(dir.path()).unwrap());
        Self {
            _dir: dir,
            store,
            warehouse: MemoryWarehouse::new(),
        }
    }

    pub async fn put(&self, key: &str, body: impl Into<Vec<u8>>) {
        self.store.put(key, body.into(), None).await.unwrap();
    }

    pub fn ledger(&self) -> Ledger {
        Ledger::new(self.store.clone(), DEFAULT_LEDGER_KEY)
    }

    pub fn writer(&self) -> PartitionedWriter {
        PartitionedWriter::new(self.store.clone(), DEFAULT_STAGING_ROOT)
    }

    pub fn merger(&self) -> MergeEngine {
        MergeEngine::new(
            self.store.clone(),
            DEFAULT_STAGING_ROOT,
            Arc::new(self.warehouse.clone()),
        )
    }

    pub fn coordinator(&self) -> Coordinator {
        Coordinator::new(self.ledger(), self.writer(), Some(self.merger()))
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            destination: self.store.clone(),
            source_store: self.store.clone(),
            warehouse: Some(Arc::new(self.warehouse.clone())),
            relational: None,
            sheets: None,
        }
    }

    /// Table `name` of a TOML config, wired the way the binary wires it
    pub fn configured(&self, toml: &str, name: &str) -> Arc<TablePipeline> {
        let config = PipelineConfig::from_toml_str(toml).unwrap();
        let table = config
            .table(name)
            .unwrap_or_else(|| panic!("table {} is not configured", name));
        Arc::new(pipeline_for(table, &self.collaborators()).unwrap())
    }

    pub fn csv_source(&self, prefix: &str) -> ListingSource {
        ListingSource::new(self.store.clone(), prefix, ".csv", FileFormat::Csv)
    }

    pub async fn ledger_keys(&self) -> Vec<String> {
        self.ledger().entries().await.unwrap().entries.into_keys().collect()
    }

    pub async fn staged_files(&self, table: &str) -> Vec<String> {
        self.store
            .list(&format!("{}/{}/", DEFAULT_STAGING_ROOT, table))
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.key)
            .collect()
    }

    pub fn target(&self, table: &str) -> Batch {
        self.warehouse
            .table(table)
            .unwrap_or_else(|| panic!("table {} was not created", table))
    }
}

pub fn pipeline(
    name: &str,
    source: impl Source + 'static,
    write_mode: WriteMode,
    keys: &[&str],
) -> Arc<TablePipeline> {
    Arc::new(TablePipeline {
        name: name.to_string(),
        source_system: format!("test_{}", name),
        source: Arc::new(source),
        write_mode,
        merge: (!keys.is_empty()).then(|| MergeSpec {
            unique_keys: keys.iter().map(|k| k.to_string()).collect(),
            column_mapping: Default::default(),
        }),
    })
}

/// `id=value` for every row, ordered by the numeric `id` column
pub fn column_by_id(batch: &Batch, column: &str) -> Vec<String> {
    let id = batch.schema().index_of("id").unwrap();
    let col = batch.schema().index_of(column).unwrap();
    let mut rows: Vec<(i64, String)> = batch
        .rows()
        .iter()
        .map(|r| {
            let n = r[id].to_text().parse::<i64>().unwrap_or(i64::MAX);
            (n, format!("{}={}", r[id].to_text(), r[col].to_text()))
        })
        .collect();
    rows.sort();
    rows.into_iter().map(|(_, text)| text).collect()
}
