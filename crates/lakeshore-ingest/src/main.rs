//! Lakeshore - batch ingestion and warehouse merge

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use lakeshore_common::dates::parse_run_date;
use lakeshore_common::logging::{init_logging, LogConfig, LogLevel};
use lakeshore_ingest::config::{PipelineConfig, CONFIG_PATH_VAR, DEFAULT_CONFIG_PATH};
use lakeshore_ingest::coordinator::{RunContext, RunPhase, RunReport};
use lakeshore_ingest::ledger::Ledger;
use lakeshore_ingest::storage;
use lakeshore_ingest::wiring::{assemble, Collaborators};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "lakeshore")]
#[command(author, version, about = "Incremental batch ingestion into a staging lake and warehouse")]
struct Cli {
    /// Pipeline configuration file
    #[arg(short, long, global = true, env = CONFIG_PATH_VAR, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stage new source data and merge it into the warehouse
    Run {
        /// Run date, YYYY-MM-DD or YYYYMMDD (default: today, UTC)
        #[arg(short, long)]
        date: Option<String>,

        /// Only these tables (repeatable)
        #[arg(short, long = "table")]
        tables: Vec<String>,

        /// Stage without merging
        #[arg(long, conflicts_with = "merge_only")]
        stage_only: bool,

        /// Merge what is already staged
        #[arg(long)]
        merge_only: bool,

        /// Cancel unfinished tables after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Merge staged data of the given tables
    Merge {
        #[arg(short, long = "table", required = true)]
        tables: Vec<String>,
    },

    /// Inspect or edit the processed-objects ledger
    Ledger {
        #[command(subcommand)]
        action: LedgerCommand,
    },
}

#[derive(Subcommand, Debug)]
enum LedgerCommand {
    /// Print every processed object
    List,
    /// Forget objects so the next run reads them again
    Purge {
        #[arg(required = true)]
        keys: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("lakeshore".to_string())
        .filter_directives("sqlx=warn,aws_smithy_runtime=info,aws_config=warn")
        .build();

    // Environment variables take precedence
    let log_config = log_config.clone().with_env().unwrap_or(log_config);

    let _guard = init_logging(&log_config)?;

    let config = PipelineConfig::load(&cli.config)?;

    match cli.command {
        Command::Run {
            date,
            tables,
            stage_only,
            merge_only,
            timeout_secs,
        } => {
            let phase = if stage_only {
                RunPhase::StageOnly
            } else if merge_only {
                RunPhase::MergeOnly
            } else {
                RunPhase::Full
            };
            let run_date = match date {
                Some(raw) => parse_run_date(&raw)?,
                None => Utc::now().date_naive(),
            };
            let report = run(&config, run_date, phase, &tables, timeout_secs).await?;
            Ok(exit_code(&report))
        },
        Command::Merge { tables } => {
            let report = run(&config, Utc::now().date_naive(), RunPhase::MergeOnly, &tables, None).await?;
            Ok(exit_code(&report))
        },
        Command::Ledger { action } => {
            let store = storage::connect(&config.destination).await?;
            let ledger = Ledger::new(store, &config.ledger_key);
            match action {
                LedgerCommand::List => {
                    let doc = ledger.entries().await?;
                    for (key, entry) in &doc.entries {
                        println!("{}\t{}\t{}", entry.processed_date, entry.size_bytes, key);
                    }
                    info!(entries = doc.len(), "Listed ledger");
                },
                LedgerCommand::Purge { keys } => {
                    let removed = ledger.purge(&keys).await?;
                    println!("Removed {} of {} entries", removed, keys.len());
                },
            }
            Ok(ExitCode::SUCCESS)
        },
    }
}

async fn run(
    config: &PipelineConfig,
    run_date: NaiveDate,
    phase: RunPhase,
    tables: &[String],
    timeout_secs: Option<u64>,
) -> Result<RunReport> {
    let collaborators = Collaborators::connect(config).await?;
    let runtime = assemble(config, &collaborators)?;
    let pipelines = runtime.select(tables)?;

    let cancel = CancellationToken::new();
    if let Some(secs) = timeout_secs {
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            warn!(timeout_secs = secs, "Run timed out; cancelling");
            token.cancel();
        });
    }
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; cancelling");
            token.cancel();
        }
    });

    let ctx = RunContext::new(run_date)
        .with_phase(phase)
        .with_cancel(cancel);
    let report = runtime.coordinator.run(pipelines, ctx).await;
    print_report(&report);
    Ok(report)
}

fn print_report(report: &RunReport) {
    println!("Run {} ({:?})", report.run_date, report.phase);
    for t in &report.tables {
        let merged = t
            .merge
            .as_ref()
            .map(|m| m.rows_affected.to_string())
            .unwrap_or_else(|| "-".to_string());
        let status = match &t.failure {
            None => "ok".to_string(),
            Some(failure) => format!("FAILED {}", failure),
        };
        println!(
            "  {:<32} units={} skipped={} staged={} merged={} {}",
            t.table,
            t.units_processed,
            t.units_skipped.len(),
            t.rows_staged,
            merged,
            status
        );
        for skipped in &t.units_skipped {
            println!("    skipped {}: {}", skipped.label, skipped.reason);
        }
    }
}

fn exit_code(report: &RunReport) -> ExitCode {
    if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
