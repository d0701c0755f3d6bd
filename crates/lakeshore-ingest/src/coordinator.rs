//! Pipeline coordinator
//!
//! Runs every configured table through discover, read, normalize, write,
//! ledger commit and merge. Tables run concurrently; the steps of one table
//! are strictly sequential and one chunk is written before the next is
//! pulled. The ledger commit is the only progress marker, so any table can
//! be re-run from scratch after a failure.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::NaiveDate;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::error::PipelineError;
use crate::ledger::Ledger;
use crate::merge::{MergeEngine, MergeResult};
use crate::normalize::{normalize, IngestionStamp};
use crate::sources::{FailurePolicy, Source, SourceUnit};
use crate::writer::{PartitionedWriter, WriteMode};

/// Merge settings of a table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeSpec {
    pub unique_keys: Vec<String>,
    /// Staged column name to warehouse column name
    pub column_mapping: BTreeMap<String, String>,
}

/// One table: where it comes from, how it is staged, how it is merged
pub struct TablePipeline {
    pub name: String,
    /// Value of the `source_system` column
    pub source_system: String,
    pub source: Arc<dyn Source>,
    pub write_mode: WriteMode,
    /// `None` stages without merging
    pub merge: Option<MergeSpec>,
}

impl fmt::Debug for TablePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TablePipeline")
            .field("name", &self.name)
            .field("source", &self.source.kind())
            .field("write_mode", &self.write_mode)
            .field("merge", &self.merge)
            .finish()
    }
}

/// Which halves of the pipeline a run executes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    #[default]
    Full,
    StageOnly,
    /// Merge whatever is staged, even if this run staged nothing
    MergeOnly,
}

#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_date: NaiveDate,
    pub phase: RunPhase,
    pub cancel: CancellationToken,
}

impl RunContext {
    pub fn new(run_date: NaiveDate) -> Self {
        Self {
            run_date,
            phase: RunPhase::Full,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_phase(mut self, phase: RunPhase) -> Self {
        self.phase = phase;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Where a table failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Discover,
    Read,
    Write,
    Commit,
    Merge,
    /// The table's task died before reporting
    Task,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Discover => "discover",
            Stage::Read => "read",
            Stage::Write => "write",
            Stage::Commit => "commit",
            Stage::Merge => "merge",
            Stage::Task => "task",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub struct TableFailure {
    pub stage: Stage,
    pub error: PipelineError,
}

impl TableFailure {
    fn new(stage: Stage, error: PipelineError) -> Self {
        Self { stage, error }
    }

    /// `merge:<step>` for merge failures, otherwise the stage name
    pub fn stage_label(&self) -> String {
        match &self.error {
            PipelineError::MergeExecution { step, .. } => format!("{}:{}", self.stage, step),
            _ => self.stage.to_string(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.error, PipelineError::Cancelled { .. })
    }
}

impl fmt::Display for TableFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.stage_label(), self.error)
    }
}

/// A source unit left out of this run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedUnit {
    pub label: String,
    pub reason: String,
}

#[derive(Debug)]
pub struct TableReport {
    pub table: String,
    pub units_processed: usize,
    pub units_skipped: Vec<SkippedUnit>,
    pub rows_staged: usize,
    /// Ledger entries written by this run
    pub ledger_committed: usize,
    pub merge: Option<MergeResult>,
    pub failure: Option<TableFailure>,
}

impl TableReport {
    fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            units_processed: 0,
            units_skipped: Vec::new(),
            rows_staged: 0,
            ledger_committed: 0,
            merge: None,
            failure: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub run_date: NaiveDate,
    pub phase: RunPhase,
    pub tables: Vec<TableReport>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.tables.iter().all(TableReport::is_success)
    }

    pub fn table(&self, name: &str) -> Option<&TableReport> {
        self.tables.iter().find(|t| t.table == name)
    }

    pub fn failed(&self) -> impl Iterator<Item = &TableReport> {
        self.tables.iter().filter(|t| !t.is_success())
    }

    /// Per-table staged versus merged counts
    pub fn log_summary(&self) {
        for t in &self.tables {
            let merged = t.merge.as_ref().map(|m| m.rows_affected);
            match &t.failure {
                None => info!(
                    table = %t.table,
                    units = t.units_processed,
                    skipped = t.units_skipped.len(),
                    rows_staged = t.rows_staged,
                    rows_merged = ?merged,
                    "Table succeeded"
                ),
                Some(failure) => error!(
                    table = %t.table,
                    stage = %failure.stage_label(),
                    rows_staged = t.rows_staged,
                    error = %failure.error,
                    "Table failed"
                ),
            }
        }

        let failed = self.failed().count();
        info!(
            run_date = %self.run_date,
            tables = self.tables.len(),
            failed,
            "Run complete"
        );
    }
}

/// Partitions written so far by one table in this run
#[derive(Default)]
struct Written {
    partitions: HashSet<NaiveDate>,
}

impl Written {
    fn any(&self) -> bool {
        !self.partitions.is_empty()
    }
}

#[derive(Clone)]
pub struct Coordinator {
    ledger: Ledger,
    writer: PartitionedWriter,
    merger: Option<Arc<MergeEngine>>,
    ledger_gate: Arc<Mutex<()>>,
    table_locks: Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>,
    max_concurrent_tables: Option<usize>,
}

impl Coordinator {
    pub fn new(ledger: Ledger, writer: PartitionedWriter, merger: Option<MergeEngine>) -> Self {
        Self {
            ledger,
            writer,
            merger: merger.map(Arc::new),
            ledger_gate: Arc::new(Mutex::new(())),
            table_locks: Arc::new(StdMutex::new(HashMap::new())),
            max_concurrent_tables: None,
        }
    }

    pub fn with_max_concurrent_tables(mut self, limit: usize) -> Self {
        self.max_concurrent_tables = Some(limit.max(1));
        self
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn writer(&self) -> &PartitionedWriter {
        &self.writer
    }

    fn table_lock(&self, table: &str) -> Arc<Mutex<()>> {
        let mut locks = match self.table_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.entry(table.to_string()).or_default().clone()
    }

    /// Run every pipeline and report on each. One table's failure never
    /// stops the others.
    pub async fn run(&self, pipelines: Vec<Arc<TablePipeline>>, ctx: RunContext) -> RunReport {
        let limit = self
            .max_concurrent_tables
            .unwrap_or(pipelines.len())
            .max(1);
        let permits = Arc::new(Semaphore::new(limit));
        info!(
            run_date = %ctx.run_date,
            phase = ?ctx.phase,
            tables = pipelines.len(),
            concurrency = limit,
            "Starting run"
        );

        let mut handles = Vec::with_capacity(pipelines.len());
        for pipeline in pipelines {
            let this = self.clone();
            let ctx = ctx.clone();
            let permits = permits.clone();
            let name = pipeline.name.clone();
            let span = info_span!("table", table = %name);
            let handle = tokio::spawn(
                async move {
                    let _permit = permits.acquire_owned().await;
                    this.run_table(&pipeline, &ctx).await
                }
                .instrument(span),
            );
            handles.push((name, handle));
        }

        let mut tables = Vec::with_capacity(handles.len());
        for (name, handle) in handles {
            match handle.await {
                Ok(report) => tables.push(report),
                Err(e) => {
                    error!(table = %name, error = %e, "Table task died");
                    let mut report = TableReport::new(&name);
                    report.failure = Some(TableFailure::new(
                        Stage::Task,
                        PipelineError::TaskFailed {
                            table: name.clone(),
                            reason: e.to_string(),
                        },
                    ));
                    tables.push(report);
                },
            }
        }

        let report = RunReport {
            run_date: ctx.run_date,
            phase: ctx.phase,
            tables,
        };
        report.log_summary();
        report
    }

    /// Stage and merge one table under its lock
    pub async fn run_table(&self, pipeline: &TablePipeline, ctx: &RunContext) -> TableReport {
        let lock = self.table_lock(&pipeline.name);
        let _guard = lock.lock().await;

        let mut report = TableReport::new(&pipeline.name);
        if ctx.phase != RunPhase::MergeOnly {
            if let Err(failure) = self.stage_table(pipeline, ctx, &mut report).await {
                report.failure = Some(failure);
                return report;
            }
        }

        if ctx.phase == RunPhase::StageOnly {
            return report;
        }
        let Some(spec) = &pipeline.merge else {
            return report;
        };
        if ctx.phase == RunPhase::Full && report.rows_staged == 0 {
            info!(table = %pipeline.name, "Nothing staged this run; merge skipped");
            return report;
        }
        if ctx.cancel.is_cancelled() {
            report.failure = Some(cancelled(&pipeline.name, Stage::Merge));
            return report;
        }

        match self.merge_table(pipeline, spec).await {
            Ok(result) => report.merge = Some(result),
            Err(error) => report.failure = Some(TableFailure::new(Stage::Merge, error)),
        }
        report
    }

    async fn merge_table(&self, pipeline: &TablePipeline, spec: &MergeSpec) -> Result<MergeResult, PipelineError> {
        let merger = self.merger.as_ref().ok_or_else(|| {
            PipelineError::Config(format!(
                "table '{}' has merge keys but no warehouse is configured",
                pipeline.name
            ))
        })?;
        merger
            .merge(&pipeline.name, &spec.unique_keys, &spec.column_mapping)
            .await
    }

    async fn stage_table(
        &self,
        pipeline: &TablePipeline,
        ctx: &RunContext,
        report: &mut TableReport,
    ) -> Result<(), TableFailure> {
        let table = pipeline.name.as_str();
        let source = pipeline.source.as_ref();

        let units = source
            .discover(ctx.run_date, &self.ledger)
            .await
            .map_err(|e| TableFailure::new(Stage::Discover, e))?;
        if units.is_empty() {
            info!(table, source = source.kind(), "No new source units");
            return Ok(());
        }
        info!(table, source = source.kind(), units = units.len(), "Discovered source units");

        let stamp = IngestionStamp::now(&pipeline.source_system, ctx.run_date);
        let mut written = Written::default();
        let mut completed = Vec::new();

        for unit in &units {
            if ctx.cancel.is_cancelled() {
                return Err(cancelled(table, Stage::Read));
            }

            match self.stage_unit(pipeline, unit, ctx, &stamp, &mut written).await {
                Ok(rows) => {
                    report.units_processed += 1;
                    report.rows_staged += rows;
                    if let Some(object) = &unit.object {
                        completed.push(object.clone());
                    }
                },
                Err(failure)
                    if failure.stage == Stage::Read
                        && !failure.is_cancelled()
                        && source.failure_policy() == FailurePolicy::Skip =>
                {
                    warn!(table, unit = %unit.label, error = %failure.error, "Skipping unreadable source unit");
                    report.units_skipped.push(SkippedUnit {
                        label: unit.label.clone(),
                        reason: failure.error.to_string(),
                    });
                },
                Err(failure) => return Err(failure),
            }
        }

        if completed.is_empty() {
            return Ok(());
        }
        if ctx.cancel.is_cancelled() {
            return Err(cancelled(table, Stage::Commit));
        }
        let _gate = self.ledger_gate.lock().await;
        report.ledger_committed = self
            .ledger
            .commit(&completed, ctx.run_date)
            .await
            .map_err(|e| TableFailure::new(Stage::Commit, e))?;
        Ok(())
    }

    /// Stream one unit through normalize and write; returns rows staged
    async fn stage_unit(
        &self,
        pipeline: &TablePipeline,
        unit: &SourceUnit,
        ctx: &RunContext,
        stamp: &IngestionStamp,
        written: &mut Written,
    ) -> Result<usize, TableFailure> {
        let table = pipeline.name.as_str();
        let mut chunks = pipeline.source.open(unit);
        let mut rows = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(cancelled(table, Stage::Read)),
                next = chunks.next() => next,
            };
            let Some(chunk) = next else { break };
            let raw = chunk.map_err(|e| {
                TableFailure::new(
                    Stage::Read,
                    PipelineError::SourceRead {
                        object: unit.label.clone(),
                        source: e,
                    },
                )
            })?;
            if raw.batch.is_empty() {
                continue;
            }

            let partition = raw.partition_date.unwrap_or(ctx.run_date);
            let mode = self.resolve_mode(pipeline, partition, written).await?;
            let normalized = normalize(&raw.batch, stamp);
            let staged = self
                .writer
                .write(&normalized, table, mode, Some(partition))
                .await
                .map_err(|e| TableFailure::new(Stage::Write, e))?;
            written.partitions.insert(partition);
            rows += staged;
        }

        info!(table, unit = %unit.label, rows, "Staged source unit");
        Ok(rows)
    }

    /// Later chunks of this run append; destinations partitioned by event
    /// date append to partitions staged by earlier runs.
    async fn resolve_mode(
        &self,
        pipeline: &TablePipeline,
        partition: NaiveDate,
        written: &Written,
    ) -> Result<WriteMode, TableFailure> {
        let mode = match pipeline.write_mode {
            WriteMode::Append => WriteMode::Append,
            WriteMode::OverwriteAll if written.any() => WriteMode::Append,
            WriteMode::OverwriteAll => WriteMode::OverwriteAll,
            WriteMode::OverwritePartition if written.partitions.contains(&partition) => WriteMode::Append,
            WriteMode::OverwritePartition if pipeline.source.probes_partitions() => self
                .writer
                .probe_mode(&pipeline.name, partition)
                .await
                .map_err(|e| TableFailure::new(Stage::Write, e))?,
            WriteMode::OverwritePartition => WriteMode::OverwritePartition,
        };
        Ok(mode)
    }
}

fn cancelled(table: &str, stage: Stage) -> TableFailure {
    TableFailure::new(
        stage,
        PipelineError::Cancelled {
            table: table.to_string(),
        },
    )
}
