//! Object storage
//!
//! Every persisted artifact (source files, staged Parquet parts and the
//! ledger document) lives behind [`ObjectStore`]. [`S3Store`] talks to S3 or
//! any S3-compatible service; [`LocalStore`] keeps objects under a directory
//! and backs local runs and the test suite.

use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncRead;

pub mod config;
mod local;
mod s3;

pub use config::{S3Config, StoreConfig};
pub use local::LocalStore;
pub use s3::S3Store;

/// Listing entry for one stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: i64,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Streaming body of an object
pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Human-readable location, e.g. `s3://bucket`
    fn location(&self) -> String;

    /// All objects whose key starts with `prefix`, sorted by key
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;

    /// Open an object for streaming reads
    async fn open(&self, key: &str) -> Result<ObjectReader>;

    /// Read a whole object; `None` when it does not exist
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// The last `len` bytes of an object (all of it when shorter); `None`
    /// when it does not exist
    async fn get_tail(&self, key: &str, len: usize) -> Result<Option<Vec<u8>>>;

    /// Write a whole object in one request
    async fn put(&self, key: &str, data: Vec<u8>, content_type: Option<&str>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/// Build a store from its configuration section
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn ObjectStore>> {
    match config {
        StoreConfig::S3(s3) => Ok(Arc::new(S3Store::new(s3.clone()).await?)),
        StoreConfig::Local { root } => Ok(Arc::new(LocalStore::new(root)?)),
    }
}
