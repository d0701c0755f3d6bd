//! Pipeline error types

use std::fmt;

use thiserror::Error;

/// Result alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Step of the merge procedure that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStep {
    ResolveStaging,
    InferSchema,
    CreateTemp,
    EnsureTarget,
    Load,
    Deduplicate,
    Upsert,
}

impl MergeStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStep::ResolveStaging => "resolve_staging",
            MergeStep::InferSchema => "infer_schema",
            MergeStep::CreateTemp => "create_temp",
            MergeStep::EnsureTarget => "ensure_target",
            MergeStep::Load => "load",
            MergeStep::Deduplicate => "deduplicate",
            MergeStep::Upsert => "upsert",
        }
    }
}

impl fmt::Display for MergeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the ingestion and merge pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("ledger document '{key}' is unavailable: {source:#}")]
    LedgerUnavailable {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to read source object '{object}': {source:#}")]
    SourceRead {
        object: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to write partition '{partition}' of table '{table}': {source:#}")]
    WriteFailure {
        table: String,
        partition: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("no staged files for table '{table}' (tried {})", .tried.join(", "))]
    StagingNotFound { table: String, tried: Vec<String> },

    #[error("merge keys missing from staged data of table '{table}': {}", .missing.join(", "))]
    MissingMergeKey { table: String, missing: Vec<String> },

    #[error("merge of table '{table}' failed at step {step}: {source:#}")]
    MergeExecution {
        table: String,
        step: MergeStep,
        #[source]
        source: anyhow::Error,
    },

    #[error("run cancelled while processing table '{table}'")]
    Cancelled { table: String },

    #[error("task for table '{table}' did not finish: {reason}")]
    TaskFailed { table: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    pub(crate) fn merge(table: &str, step: MergeStep, source: impl Into<anyhow::Error>) -> Self {
        PipelineError::MergeExecution {
            table: table.to_string(),
            step,
            source: source.into(),
        }
    }
}
