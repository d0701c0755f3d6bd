//! Lakeshore Ingest Library
//!
//! Incremental, idempotent batch ingestion into a staging data lake and
//! warehouse upserts from it.
//!
//! # Pipeline
//!
//! - **Sources**: object listings (CSV/JSON), date-suffixed database tables,
//!   spreadsheet snapshots
//! - **Ledger**: remembers which source objects were already staged
//! - **Writer**: Snappy Parquet parts under `staging/{table}/ingestion_date=…/`
//! - **Merge**: loads staged parts, keeps the latest row per key and upserts
//!
//! # Example
//!
//! ```no_run
//! use lakeshore_ingest::config::PipelineConfig;
//! use lakeshore_ingest::coordinator::RunContext;
//! use lakeshore_ingest::wiring::{assemble, Collaborators};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PipelineConfig::load("lakeshore.toml")?;
//!     let collaborators = Collaborators::connect(&config).await?;
//!     let runtime = assemble(&config, &collaborators)?;
//!
//!     let run_date = lakeshore_common::dates::parse_run_date("2025-11-23")?;
//!     let report = runtime
//!         .coordinator
//!         .run(runtime.pipelines.clone(), RunContext::new(run_date))
//!         .await;
//!     assert!(report.is_success());
//!     Ok(())
//! }
//! ```

#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]

pub mod codec;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod ledger;
pub mod merge;
pub mod normalize;
pub mod sources;
pub mod storage;
pub mod warehouse;
pub mod wiring;
pub mod writer;

pub use error::{PipelineError, Result};
