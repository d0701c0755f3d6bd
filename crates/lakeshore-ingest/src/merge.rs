//! Staging-to-warehouse merge
//!
//! Loads every staged file of a table into a session table, keeps the
//! latest row per merge key and upserts the result into the target in one
//! statement. Re-running a merge over the same staging files leaves the
//! target unchanged.

use std::collections::BTreeMap;
use std::sync::Arc;

use lakeshore_common::checksum::content_token;
use lakeshore_common::types::Schema;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::codec;
use crate::error::{MergeStep, PipelineError, Result};
use crate::normalize::INGESTION_TIMESTAMP;
use crate::storage::{ObjectInfo, ObjectStore};
use crate::warehouse::{LoadOutcome, StagedFile, Warehouse, WarehouseSession};

/// Bytes fetched from the end of a staged file on the first footer read
const FOOTER_PREFETCH: usize = 64 * 1024;

/// Outcome of one merge
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeResult {
    pub table_name: String,
    /// Rows inserted or updated in the target
    pub rows_affected: u64,
    pub files_loaded: usize,
    /// Files whose content was already loaded in this merge
    pub files_skipped: usize,
    pub rows_loaded: u64,
    pub rows_deduplicated: u64,
    pub duplicates_removed: u64,
}

/// Staged-file location that matched, with its files
#[derive(Debug, Clone)]
struct StagingLocation {
    prefix: String,
    files: Vec<ObjectInfo>,
}

pub struct MergeEngine {
    store: Arc<dyn ObjectStore>,
    staging_root: String,
    warehouse: Arc<dyn Warehouse>,
}

impl MergeEngine {
    pub fn new(store: Arc<dyn ObjectStore>, staging_root: impl Into<String>, warehouse: Arc<dyn Warehouse>) -> Self {
        let root: String = staging_root.into();
        Self {
            store,
            staging_root: root.trim_end_matches('/').to_string(),
            warehouse,
        }
    }

    /// Candidate staging prefixes, in the order they are tried
    pub fn staging_candidates(&self, table: &str) -> Vec<String> {
        let mut candidates = Vec::new();
        for name in [
            format!("{}/", table),
            table.to_string(),
            format!("{}/", table.to_uppercase()),
            format!("{}/", table.to_lowercase()),
        ] {
            let prefix = format!("{}/{}", self.staging_root, name);
            if !candidates.contains(&prefix) {
                candidates.push(prefix);
            }
        }
        candidates
    }

    async fn resolve_staging(&self, table: &str) -> Result<StagingLocation> {
        let candidates = self.staging_candidates(table);
        for prefix in &candidates {
            let listed = self
                .store
                .list(prefix)
                .await
                .map_err(|e| PipelineError::merge(table, MergeStep::ResolveStaging, e))?;
            let files: Vec<ObjectInfo> = listed
                .into_iter()
                .filter(|o| o.key.ends_with(".parquet") && within_prefix(prefix, &o.key))
                .collect();
            if !files.is_empty() {
                info!(table, prefix = %prefix, files = files.len(), "Resolved staging location");
                return Ok(StagingLocation {
                    prefix: prefix.clone(),
                    files,
                });
            }
        }
        Err(PipelineError::StagingNotFound {
            table: table.to_string(),
            tried: candidates,
        })
    }

    async fn read_staged(&self, table: &str, step: MergeStep, key: &str) -> Result<Vec<u8>> {
        self.store
            .get(key)
            .await
            .map_err(|e| PipelineError::merge(table, step, e))?
            .ok_or_else(|| PipelineError::merge(table, step, anyhow::anyhow!("staged file {} disappeared", key)))
    }

    async fn read_tail(&self, table: &str, key: &str, len: usize) -> Result<Vec<u8>> {
        self.store
            .get_tail(key, len)
            .await
            .map_err(|e| PipelineError::merge(table, MergeStep::InferSchema, e))?
            .ok_or_else(|| {
                PipelineError::merge(table, MergeStep::InferSchema, anyhow::anyhow!("staged file {} disappeared", key))
            })
    }

    /// Schema of one staged file, fetching only its footer
    async fn footer_schema(&self, table: &str, key: &str) -> Result<Schema> {
        let step =
            |e: anyhow::Error| PipelineError::merge(table, MergeStep::InferSchema, e.context(format!("in {}", key)));

        let mut tail = self.read_tail(table, key, FOOTER_PREFETCH).await?;
        let needed = codec::footer_len(&tail).map_err(step)? + codec::TRAILER_LEN;
        if tail.len() < needed {
            tail = self.read_tail(table, key, needed).await?;
        }
        codec::read_schema(&tail).map_err(step)
    }

    async fn infer_schema(&self, table: &str, location: &StagingLocation) -> Result<Schema> {
        let mut schema = Schema::default();
        for file in &location.files {
            let file_schema = self.footer_schema(table, &file.key).await?;
            schema = schema.union(&file_schema);
        }
        Ok(schema)
    }

    /// Merge everything staged for `table` into the warehouse table of the
    /// same name
    #[instrument(skip(self, unique_keys, column_mapping))]
    pub async fn merge(
        &self,
        table: &str,
        unique_keys: &[String],
        column_mapping: &BTreeMap<String, String>,
    ) -> Result<MergeResult> {
        if unique_keys.is_empty() {
            return Err(PipelineError::Config(format!("table '{}' has no merge keys", table)));
        }

        let temp = format!("{}_temp", table);
        let dedup = format!("{}_temp_dedup", table);
        let mut result = MergeResult {
            table_name: table.to_string(),
            ..Default::default()
        };

        let location = self.resolve_staging(table).await?;
        let inferred = self.infer_schema(table, &location).await?;
        info!(columns = inferred.len(), "Inferred staged schema");

        let mut session = self
            .warehouse
            .session()
            .await
            .map_err(|e| PipelineError::merge(table, MergeStep::CreateTemp, e))?;
        session
            .create_temp_table(&temp, &inferred)
            .await
            .map_err(|e| PipelineError::merge(table, MergeStep::CreateTemp, e))?;

        let mut applied = BTreeMap::new();
        for (from, to) in column_mapping {
            let Some(staged) = inferred.find_ignore_case(from) else {
                warn!(from = %from, to = %to, "Column to rename is not staged; skipping");
                continue;
            };
            match session.rename_column(&temp, &staged.name, to).await {
                Ok(()) => {
                    info!(from = %from, to = %to, "Renamed column");
                    applied.insert(staged.name.clone(), to.clone());
                },
                Err(e) => warn!(from = %from, to = %to, error = %e, "Column rename failed; continuing"),
            }
        }

        let temp_schema = session
            .describe(&temp)
            .await
            .map_err(|e| PipelineError::merge(table, MergeStep::CreateTemp, e))?
            .ok_or_else(|| PipelineError::merge(table, MergeStep::CreateTemp, anyhow::anyhow!("{} vanished", temp)))?;

        self.ensure_target(session.as_mut(), table, &temp, &temp_schema).await?;

        // Load
        session
            .truncate(&temp)
            .await
            .map_err(|e| PipelineError::merge(table, MergeStep::Load, e))?;
        for file in &location.files {
            let data = self.read_staged(table, MergeStep::Load, &file.key).await?;
            let staged = StagedFile {
                key: file.key.clone(),
                token: content_token(&data),
            };
            let rows = codec::decode(data)
                .map_err(|e| PipelineError::merge(table, MergeStep::Load, e.context(format!("in {}", file.key))))?
                .rename_columns(|name| renamed(&applied, name));

            match session
                .load(&temp, &staged, &rows)
                .await
                .map_err(|e| PipelineError::merge(table, MergeStep::Load, e))?
            {
                LoadOutcome::Loaded(n) => {
                    result.files_loaded += 1;
                    result.rows_loaded += n;
                },
                LoadOutcome::Skipped => {
                    info!(key = %file.key, "Staged file already loaded; skipping");
                    result.files_skipped += 1;
                },
            }
        }
        info!(
            prefix = %location.prefix,
            files = result.files_loaded,
            skipped = result.files_skipped,
            rows = result.rows_loaded,
            "Loaded staged files"
        );

        // Keys
        let mut keys = Vec::with_capacity(unique_keys.len());
        let mut missing = Vec::new();
        for key in unique_keys {
            match temp_schema.find_ignore_case(key) {
                Some(col) => keys.push(col.name.clone()),
                None => missing.push(key.clone()),
            }
        }
        if !missing.is_empty() {
            return Err(PipelineError::MissingMergeKey {
                table: table.to_string(),
                missing,
            });
        }

        // Deduplicate
        let order_by = temp_schema.find_ignore_case(INGESTION_TIMESTAMP).map(|c| c.name.clone());
        if order_by.is_none() {
            warn!("No {} column; later-loaded rows win", INGESTION_TIMESTAMP);
        }
        session
            .deduplicate(&temp, &dedup, &keys, order_by.as_deref())
            .await
            .map_err(|e| PipelineError::merge(table, MergeStep::Deduplicate, e))?;
        let before = session
            .count(&temp)
            .await
            .map_err(|e| PipelineError::merge(table, MergeStep::Deduplicate, e))?;
        result.rows_deduplicated = session
            .count(&dedup)
            .await
            .map_err(|e| PipelineError::merge(table, MergeStep::Deduplicate, e))?;
        result.duplicates_removed = before.saturating_sub(result.rows_deduplicated);
        if result.duplicates_removed > 0 {
            warn!(removed = result.duplicates_removed, "Removed duplicate rows");
        }

        // Upsert
        result.rows_affected = session
            .merge(table, &dedup, &keys, &temp_schema.names())
            .await
            .map_err(|e| PipelineError::merge(table, MergeStep::Upsert, e))?;

        info!(
            rows_affected = result.rows_affected,
            rows = result.rows_deduplicated,
            "Merge complete"
        );
        Ok(result)
    }

    async fn ensure_target(
        &self,
        session: &mut dyn WarehouseSession,
        table: &str,
        temp: &str,
        temp_schema: &Schema,
    ) -> Result<()> {
        let step = |e: anyhow::Error| PipelineError::merge(table, MergeStep::EnsureTarget, e);

        match session.describe(table).await.map_err(step)? {
            None => {
                session.create_table_like(table, temp).await.map_err(step)?;
                info!("Created target table");
            },
            Some(existing) => {
                for column in temp_schema.columns() {
                    if existing.find_ignore_case(&column.name).is_none() {
                        session.add_column(table, column).await.map_err(step)?;
                        info!(column = %column.name, "Added column to target");
                    }
                }
            },
        }
        Ok(())
    }
}

/// Whether `key` is staged under `prefix` rather than under a longer name
/// sharing it: a bare `staging/call` must not pick up `staging/call_logs/..`
fn within_prefix(prefix: &str, key: &str) -> bool {
    if prefix.ends_with('/') {
        return true;
    }
    key.strip_prefix(prefix)
        .is_some_and(|rest| rest.starts_with('/') || rest.starts_with('.'))
}

fn renamed(mapping: &BTreeMap<String, String>, name: &str) -> String {
    mapping
        .iter()
        .find(|(from, _)| from.eq_ignore_ascii_case(name))
        .map(|(_, to)| to.clone())
        .unwrap_or_else(|| name.to_string())
}
