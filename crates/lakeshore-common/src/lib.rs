//! Lakeshore Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the Lakeshore workspace.
//!
//! - **Types**: the schema-tagged [`types::Batch`] every pipeline stage passes around
//! - **Checksums**: content tokens for staged files
//! - **Logging**: tracing subscriber bootstrap driven by `LOG_*` variables
//! - **Dates**: run-date parsing shared by the CLI and the readers
//!
//! # Example
//!
//! ```no_run
//! use lakeshore_common::types::{Batch, DataType};
//!
//! let headers = vec!["id".to_string(), "city".to_string()];
//! let rows = vec![vec!["1".to_string(), "Lagos".to_string()]];
//! let batch = Batch::from_text_rows(&headers, &rows);
//! assert_eq!(batch.schema().columns()[0].data_type, DataType::Int64);
//! ```

pub mod checksum;
pub mod dates;
pub mod error;
pub mod logging;
pub mod types;

pub use error::{LakeError, Result};
