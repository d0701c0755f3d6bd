//! Pipeline configuration
//!
//! Loaded from a TOML file layered with `LAKESHORE__*` environment
//! variables (`LAKESHORE__WAREHOUSE__URL` overrides `[warehouse] url`).
//! A `.env` file in the working directory is read first.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::ledger::DEFAULT_LEDGER_KEY;
use crate::sources::snapshot::DEFAULT_SHEETS_URL;
use crate::sources::{FailurePolicy, FileFormat, Partitioning, DEFAULT_CHUNK_ROWS};
use crate::storage::StoreConfig;
use crate::warehouse::{WarehouseConfig, DEFAULT_MAX_CONNECTIONS};
use crate::writer::{WriteMode, DEFAULT_STAGING_ROOT};

/// Environment prefix for overrides
pub const ENV_PREFIX: &str = "LAKESHORE";

/// Environment variable naming the config file
pub const CONFIG_PATH_VAR: &str = "LAKESHORE_CONFIG";

/// Config file used when none is given
pub const DEFAULT_CONFIG_PATH: &str = "lakeshore.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// Staging directory within the destination store
    #[serde(default = "default_staging_root")]
    pub staging_root: String,

    /// Ledger document key within the destination store
    #[serde(default = "default_ledger_key")]
    pub ledger_key: String,

    /// Tables processed at once; all of them when unset
    #[serde(default)]
    pub max_concurrent_tables: Option<usize>,

    /// Store holding staging and the ledger
    pub destination: StoreConfig,

    /// Store listed by `listing` sources; the destination when unset
    #[serde(default)]
    pub source_store: Option<StoreConfig>,

    /// Database read by `query` sources
    #[serde(default)]
    pub database: Option<DatabaseConfig>,

    /// Merge target; tables are staged only when unset
    #[serde(default)]
    pub warehouse: Option<WarehouseConfig>,

    #[serde(default)]
    pub sheets: Option<SheetsConfig>,

    #[serde(default)]
    pub tables: Vec<TableConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SheetsConfig {
    #[serde(default = "default_sheets_url")]
    pub base_url: String,
    /// OAuth access token, normally supplied through the environment
    #[serde(default)]
    pub bearer_token: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableConfig {
    pub name: String,

    /// Value of the `source_system` column; the table name when unset
    #[serde(default)]
    pub source_system: Option<String>,

    /// Staging write mode; chosen from the source kind when unset
    #[serde(default)]
    pub write_mode: Option<WriteMode>,

    /// Upsert keys; the table is not merged when empty
    #[serde(default)]
    pub merge_keys: Vec<String>,

    /// Staged column name to warehouse column name
    #[serde(default)]
    pub column_mapping: BTreeMap<String, String>,

    pub source: SourceConfig,
}

impl TableConfig {
    pub fn source_system(&self) -> &str {
        self.source_system.as_deref().unwrap_or(&self.name)
    }

    /// The configured write mode, or the source kind's default. Ledger-tracked
    /// listings append, since the ledger never hands an object back and an
    /// overwrite would drop rows staged by an earlier run of the same day.
    /// Key-date listings overwrite only partitions nothing has staged yet.
    pub fn write_mode(&self) -> WriteMode {
        if let Some(mode) = self.write_mode {
            return mode;
        }
        match &self.source {
            SourceConfig::Listing {
                partitioning: Partitioning::RunDate,
                ..
            } => WriteMode::Append,
            SourceConfig::Listing {
                partitioning: Partitioning::KeyDate,
                ..
            } => WriteMode::OverwritePartition,
            SourceConfig::Query { .. } => WriteMode::OverwritePartition,
            SourceConfig::Snapshot { .. } => WriteMode::OverwriteAll,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConfig {
    /// Objects under a prefix of the source store
    Listing {
        prefix: String,
        #[serde(default)]
        suffix: String,
        format: FileFormat,
        #[serde(default)]
        partitioning: Partitioning,
        #[serde(default)]
        failure_policy: FailurePolicy,
        #[serde(default = "default_chunk_rows")]
        chunk_rows: usize,
    },
    /// `SELECT * FROM {schema}.{table_prefix}_YYYY_MM_DD`
    Query {
        schema: String,
        table_prefix: String,
        #[serde(default = "default_chunk_rows")]
        chunk_rows: usize,
    },
    /// A whole spreadsheet
    Snapshot { sheet_id: String, sheet_name: String },
}

fn default_staging_root() -> String {
    DEFAULT_STAGING_ROOT.to_string()
}

fn default_ledger_key() -> String {
    DEFAULT_LEDGER_KEY.to_string()
}

fn default_max_connections() -> u32 {
    DEFAULT_MAX_CONNECTIONS
}

fn default_sheets_url() -> String {
    DEFAULT_SHEETS_URL.to_string()
}

fn default_chunk_rows() -> usize {
    DEFAULT_CHUNK_ROWS
}

impl PipelineConfig {
    /// Load `path` with environment overrides and validate
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let path = path.as_ref();
        let config: PipelineConfig = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read config {}", path.display()))?
            .try_deserialize()
            .with_context(|| format!("Invalid config {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Parse TOML text without environment overrides
    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        let config: PipelineConfig = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()
            .context("Failed to parse config")?
            .try_deserialize()
            .context("Invalid config")?;

        config.validate()?;
        Ok(config)
    }

    pub fn table(&self, name: &str) -> Option<&TableConfig> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |msg: String| Err(PipelineError::Config(msg));

        if self.staging_root.trim_matches('/').is_empty() {
            return invalid("staging_root cannot be empty".into());
        }
        if self.ledger_key.is_empty() {
            return invalid("ledger_key cannot be empty".into());
        }
        if self.max_concurrent_tables == Some(0) {
            return invalid("max_concurrent_tables must be greater than 0".into());
        }
        if self.tables.is_empty() {
            tracing::warn!("No tables configured");
        }

        let mut names = HashSet::new();
        for table in &self.tables {
            if table.name.is_empty() {
                return invalid("table name cannot be empty".into());
            }
            if !names.insert(table.name.to_lowercase()) {
                return invalid(format!("table '{}' is configured twice", table.name));
            }
            if table.merge_keys.iter().any(|k| k.trim().is_empty()) {
                return invalid(format!("table '{}' has an empty merge key", table.name));
            }
            if table.merge_keys.is_empty() && !table.column_mapping.is_empty() {
                return invalid(format!(
                    "table '{}' has a column_mapping but no merge_keys",
                    table.name
                ));
            }
            if !table.merge_keys.is_empty() && self.warehouse.is_none() {
                return invalid(format!(
                    "table '{}' has merge_keys but no [warehouse] is configured",
                    table.name
                ));
            }

            match (&table.source, table.write_mode()) {
                (SourceConfig::Listing { partitioning, .. }, mode)
                    if mode == WriteMode::OverwriteAll
                        || (mode == WriteMode::OverwritePartition && *partitioning == Partitioning::RunDate) =>
                {
                    return invalid(format!(
                        "table '{}' reads a ledger-tracked listing and must not use write_mode = \"{}\"",
                        table.name,
                        mode.as_str()
                    ));
                },
                _ => {},
            }

            match &table.source {
                SourceConfig::Listing { chunk_rows, .. } | SourceConfig::Query { chunk_rows, .. }
                    if *chunk_rows == 0 =>
                {
                    return invalid(format!("table '{}' has chunk_rows = 0", table.name));
                },
                SourceConfig::Query { .. } if self.database.is_none() => {
                    return invalid(format!(
                        "table '{}' reads a query source but no [database] is configured",
                        table.name
                    ));
                },
                SourceConfig::Snapshot { .. } if self.sheets.is_none() => {
                    return invalid(format!(
                        "table '{}' reads a snapshot source but no [sheets] is configured",
                        table.name
                    ));
                },
                _ => {},
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::path::PathBuf;

    const SAMPLE: &str = r#"
max_concurrent_tables = 2

[destination]
kind = "local"
root = "/var/lib/lakeshore"

[source_store]
kind = "s3"
bucket = "call-center-raw"
endpoint = "http://localhost:9000"
path_style = true

[database]
url = "postgres://reader@localhost/complaints"

[warehouse]
kind = "memory"

[sheets]
bearer_token = "token"

[[tables]]
name = "call_logs"
merge_keys = ["call_id"]
write_mode = "append"

[tables.source]
kind = "listing"
prefix = "call_logs/"
suffix = ".csv"
format = "csv"

[[tables]]
name = "web_form_request"
merge_keys = ["request_id"]
source_system = "complaints_db"

[tables.column_mapping]
req_id = "request_id"

[tables.source]
kind = "query"
schema = "customer_complaints"
table_prefix = "web_form_request"
chunk_rows = 1000

[[tables]]
name = "agents"
merge_keys = ["agent_id"]
write_mode = "overwrite_all"

[tables.source]
kind = "snapshot"
sheet_id = "abc123"
sheet_name = "Agents"
"#;

    #[test]
    fn test_parses_full_config() {
        let config = PipelineConfig::from_toml_str(SAMPLE).unwrap();

        assert_eq!(config.staging_root, "staging");
        assert_eq!(config.ledger_key, DEFAULT_LEDGER_KEY);
        assert_eq!(config.max_concurrent_tables, Some(2));
        assert_eq!(
            config.destination,
            StoreConfig::Local {
                root: PathBuf::from("/var/lib/lakeshore")
            }
        );
        match config.source_store.as_ref().unwrap() {
            StoreConfig::S3(s3) => {
                assert_eq!(s3.bucket, "call-center-raw");
                assert!(s3.path_style);
                assert_eq!(s3.region, "us-east-1");
            },
            other => panic!("unexpected store {:?}", other),
        }
        assert_eq!(config.database.as_ref().unwrap().max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.sheets.as_ref().unwrap().base_url, DEFAULT_SHEETS_URL);

        let logs = config.table("call_logs").unwrap();
        assert_eq!(logs.write_mode(), WriteMode::Append);
        assert_eq!(logs.source_system(), "call_logs");
        assert_eq!(
            logs.source,
            SourceConfig::Listing {
                prefix: "call_logs/".into(),
                suffix: ".csv".into(),
                format: FileFormat::Csv,
                partitioning: Partitioning::RunDate,
                failure_policy: FailurePolicy::Skip,
                chunk_rows: DEFAULT_CHUNK_ROWS,
            }
        );

        let web = config.table("web_form_request").unwrap();
        assert_eq!(web.write_mode(), WriteMode::OverwritePartition);
        assert_eq!(web.source_system(), "complaints_db");
        assert_eq!(web.column_mapping.get("req_id").map(String::as_str), Some("request_id"));

        assert_eq!(config.table("agents").unwrap().write_mode(), WriteMode::OverwriteAll);
    }

    #[test]
    fn test_rejects_duplicate_tables() {
        let text = r#"
[destination]
kind = "local"
root = "/tmp/lake"

[[tables]]
name = "agents"
[tables.source]
kind = "listing"
prefix = "a/"
format = "csv"

[[tables]]
name = "Agents"
[tables.source]
kind = "listing"
prefix = "b/"
format = "csv"
"#;
        let err = PipelineConfig::from_toml_str(text).unwrap_err();
        assert!(format!("{:#}", err).contains("configured twice"));
    }

    #[test]
    fn test_rejects_missing_references() {
        let merge_without_warehouse = r#"
[destination]
kind = "local"
root = "/tmp/lake"

[[tables]]
name = "agents"
merge_keys = ["agent_id"]
[tables.source]
kind = "listing"
prefix = "a/"
format = "json"
"#;
        let err = PipelineConfig::from_toml_str(merge_without_warehouse).unwrap_err();
        assert!(format!("{:#}", err).contains("no [warehouse]"));

        let query_without_database = r#"
[destination]
kind = "local"
root = "/tmp/lake"

[[tables]]
name = "requests"
[tables.source]
kind = "query"
schema = "s"
table_prefix = "t"
"#;
        let err = PipelineConfig::from_toml_str(query_without_database).unwrap_err();
        assert!(format!("{:#}", err).contains("no [database]"));
    }

    #[test]
    fn test_rejects_zero_chunk_rows() {
        let text = r#"
[destination]
kind = "local"
root = "/tmp/lake"

[[tables]]
name = "logs"
[tables.source]
kind = "listing"
prefix = "logs/"
format = "csv"
chunk_rows = 0
"#;
        let err = PipelineConfig::from_toml_str(text).unwrap_err();
        assert!(format!("{:#}", err).contains("chunk_rows = 0"));
    }

    #[test]
    fn test_listing_write_mode_defaults_and_limits() {
        let base = r#"
[destination]
kind = "local"
root = "/tmp/lake"

[[tables]]
name = "logs"
[tables.source]
kind = "listing"
prefix = "logs/"
format = "csv"

[[tables]]
name = "events"
[tables.source]
kind = "listing"
prefix = "events/"
format = "json"
partitioning = "key_date"
"#;
        let config = PipelineConfig::from_toml_str(base).unwrap();
        assert_eq!(config.table("logs").unwrap().write_mode(), WriteMode::Append);
        assert_eq!(config.table("events").unwrap().write_mode(), WriteMode::OverwritePartition);

        let clobbering = base.replacen(
            "name = \"logs\"",
            "name = \"logs\"\nwrite_mode = \"overwrite_partition\"",
            1,
        );
        let err = PipelineConfig::from_toml_str(&clobbering).unwrap_err();
        assert!(format!("{:#}", err).contains("ledger-tracked listing"));
    }

    #[test]
    #[serial]
    fn test_environment_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lakeshore.toml");
        std::fs::write(
            &path,
            "staging_root = \"staging\"\n[destination]\nkind = \"local\"\nroot = \"/tmp/lake\"\n",
        )
        .unwrap();

        std::env::set_var("LAKESHORE__STAGING_ROOT", "landing");
        let config = PipelineConfig::load(&path);
        std::env::remove_var("LAKESHORE__STAGING_ROOT");

        assert_eq!(config.unwrap().staging_root, "landing");
    }
}
