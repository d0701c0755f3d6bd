//! Schema-tagged tabular types shared by every stage of the pipeline
//!
//! A [`Batch`] is a small, row-major table whose columns carry a declared
//! [`DataType`]. Readers produce batches, the normalizer rewrites their
//! schema, the writer encodes them to Parquet and the merge engine loads them
//! into a warehouse.

mod batch;
mod value;

pub use batch::{Batch, Column, Schema};
pub use value::{DataType, Value};
