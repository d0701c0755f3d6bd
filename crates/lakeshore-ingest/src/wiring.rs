//! Builds the coordinator and table pipelines from configuration

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use crate::config::{PipelineConfig, SourceConfig, TableConfig};
use crate::coordinator::{Coordinator, MergeSpec, TablePipeline};
use crate::error::PipelineError;
use crate::ledger::Ledger;
use crate::merge::MergeEngine;
use crate::sources::{GoogleSheetsClient, ListingSource, PgSource, QuerySource, RelationalSource, SheetClient, SnapshotSource, Source};
use crate::storage::{self, ObjectStore};
use crate::warehouse::{self, Warehouse};
use crate::writer::PartitionedWriter;

/// External systems a run talks to
#[derive(Clone)]
pub struct Collaborators {
    pub destination: Arc<dyn ObjectStore>,
    pub source_store: Arc<dyn ObjectStore>,
    pub warehouse: Option<Arc<dyn Warehouse>>,
    pub relational: Option<Arc<dyn RelationalSource>>,
    pub sheets: Option<Arc<dyn SheetClient>>,
}

impl Collaborators {
    /// Connect everything the configuration names
    pub async fn connect(config: &PipelineConfig) -> anyhow::Result<Self> {
        let destination = storage::connect(&config.destination)
            .await
            .context("Failed to open destination store")?;
        info!(location = %destination.location(), "Opened destination store");

        let source_store = match &config.source_store {
            Some(source) => storage::connect(source)
                .await
                .context("Failed to open source store")?,
            None => destination.clone(),
        };

        let warehouse = match &config.warehouse {
            Some(w) => Some(warehouse::connect(w).await?),
            None => None,
        };

        let relational: Option<Arc<dyn RelationalSource>> = match &config.database {
            Some(db) => {
                let pool = PgPoolOptions::new()
                    .max_connections(db.max_connections)
                    .connect(&db.url)
                    .await
                    .context("Failed to connect to source database")?;
                Some(Arc::new(PgSource::new(pool)))
            },
            None => None,
        };

        let sheets: Option<Arc<dyn SheetClient>> = config.sheets.as_ref().map(|s| {
            let mut client = GoogleSheetsClient::new(&s.base_url);
            if let Some(token) = &s.bearer_token {
                client = client.with_bearer_token(token);
            }
            if let Some(key) = &s.api_key {
                client = client.with_api_key(key);
            }
            Arc::new(client) as Arc<dyn SheetClient>
        });

        Ok(Self {
            destination,
            source_store,
            warehouse,
            relational,
            sheets,
        })
    }
}

/// A coordinator plus the pipelines it runs
pub struct Runtime {
    pub coordinator: Coordinator,
    pub pipelines: Vec<Arc<TablePipeline>>,
}

impl Runtime {
    /// Pipelines named in `tables`, or all of them when `tables` is empty
    pub fn select(&self, tables: &[String]) -> Result<Vec<Arc<TablePipeline>>, PipelineError> {
        if tables.is_empty() {
            return Ok(self.pipelines.clone());
        }
        tables
            .iter()
            .map(|name| {
                self.pipelines
                    .iter()
                    .find(|p| p.name.eq_ignore_ascii_case(name))
                    .cloned()
                    .ok_or_else(|| PipelineError::Config(format!("unknown table '{}'", name)))
            })
            .collect()
    }
}

pub fn assemble(config: &PipelineConfig, collaborators: &Collaborators) -> Result<Runtime, PipelineError> {
    let ledger = Ledger::new(collaborators.destination.clone(), &config.ledger_key);
    let writer = PartitionedWriter::new(collaborators.destination.clone(), &config.staging_root);
    let merger = collaborators
        .warehouse
        .clone()
        .map(|w| MergeEngine::new(collaborators.destination.clone(), &config.staging_root, w));

    let mut coordinator = Coordinator::new(ledger, writer, merger);
    if let Some(limit) = config.max_concurrent_tables {
        coordinator = coordinator.with_max_concurrent_tables(limit);
    }

    let pipelines = config
        .tables
        .iter()
        .map(|table| pipeline_for(table, collaborators).map(Arc::new))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Runtime {
        coordinator,
        pipelines,
    })
}

/// The pipeline for one configured table
pub fn pipeline_for(table: &TableConfig, collaborators: &Collaborators) -> Result<TablePipeline, PipelineError> {
    let missing = |what: &str| PipelineError::Config(format!("table '{}' needs {}", table.name, what));

    let source: Arc<dyn Source> = match &table.source {
        SourceConfig::Listing {
            prefix,
            suffix,
            format,
            partitioning,
            failure_policy,
            chunk_rows,
        } => Arc::new(
            ListingSource::new(collaborators.source_store.clone(), prefix, suffix, *format)
                .with_partitioning(*partitioning)
                .with_failure_policy(*failure_policy)
                .with_chunk_rows(*chunk_rows),
        ),
        SourceConfig::Query {
            schema,
            table_prefix,
            chunk_rows,
        } => {
            let db = collaborators.relational.clone().ok_or_else(|| missing("a database"))?;
            Arc::new(QuerySource::new(db, schema, table_prefix).with_chunk_rows(*chunk_rows))
        },
        SourceConfig::Snapshot { sheet_id, sheet_name } => {
            let client = collaborators.sheets.clone().ok_or_else(|| missing("a sheets client"))?;
            Arc::new(SnapshotSource::new(client, sheet_id, sheet_name))
        },
    };

    let merge = (!table.merge_keys.is_empty()).then(|| MergeSpec {
        unique_keys: table.merge_keys.clone(),
        column_mapping: table.column_mapping.clone(),
    });

    Ok(TablePipeline {
        name: table.name.clone(),
        source_system: table.source_system().to_string(),
        source,
        write_mode: table.write_mode(),
        merge,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStore;
    use crate::warehouse::MemoryWarehouse;

    fn local(dir: &tempfile::TempDir) -> Collaborators {
        let store: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(dir.path()).unwrap());
        Collaborators {
            destination: store.clone(),
            source_store: store,
            warehouse: Some(Arc::new(MemoryWarehouse::new())),
            relational: None,
            sheets: None,
        }
    }

    #[test]
    fn test_assemble_and_select() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::from_toml_str(
            r#"
[destination]
kind = "local"
root = "/unused"

[warehouse]
kind = "memory"

[[tables]]
name = "call_logs"
merge_keys = ["call_id"]
[tables.source]
kind = "listing"
prefix = "call_logs/"
suffix = ".csv"
format = "csv"

[[tables]]
name = "events"
[tables.source]
kind = "listing"
prefix = "events/"
format = "json"
partitioning = "key_date"
"#,
        )
        .unwrap();

        let runtime = assemble(&config, &local(&dir)).unwrap();
        assert_eq!(runtime.pipelines.len(), 2);
        assert!(runtime.pipelines[0].merge.is_some());
        assert!(runtime.pipelines[1].merge.is_none());
        assert!(runtime.pipelines[1].source.probes_partitions());

        let selected = runtime.select(&["EVENTS".to_string()]).unwrap();
        assert_eq!(selected[0].name, "events");
        assert!(runtime.select(&["nope".to_string()]).is_err());
    }

    #[test]
    fn test_query_table_needs_database_handle() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig::from_toml_str(
            "[destination]\nkind = \"local\"\nroot = \"/unused\"\n",
        )
        .unwrap();
        config.tables.push(TableConfig {
            name: "requests".into(),
            source_system: None,
            write_mode: None,
            merge_keys: vec![],
            column_mapping: Default::default(),
            source: SourceConfig::Query {
                schema: "s".into(),
                table_prefix: "t".into(),
                chunk_rows: 10,
            },
        });

        let err = assemble(&config, &local(&dir)).err().unwrap();
        assert!(err.to_string().contains("needs a database"));
    }
}
