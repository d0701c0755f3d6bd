use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

pub const DEFAULT_REGION: &str = "us-east-1";

/// Where a store keeps its objects
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreConfig {
    S3(S3Config),
    Local { root: PathBuf },
}

/// Connection settings for S3 or an S3-compatible service.
///
/// Credentials left empty fall back to `{prefix}S3_ACCESS_KEY` /
/// `{prefix}AWS_ACCESS_KEY_ID` and then to the default AWS provider chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct S3Config {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    pub bucket: String,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub path_style: bool,
}

fn default_region() -> String {
    DEFAULT_REGION.to_string()
}

impl S3Config {
    /// Read `{prefix}S3_*` variables, e.g. `SOURCE_S3_BUCKET` for prefix
    /// `"SOURCE_"`.
    pub fn from_env(prefix: &str) -> anyhow::Result<Self> {
        let var = |name: &str| env::var(format!("{}{}", prefix, name)).ok();
        let bucket = var("S3_BUCKET")
            .ok_or_else(|| anyhow::anyhow!("{}S3_BUCKET must be set", prefix))?;

        Ok(Self {
            endpoint: var("S3_ENDPOINT"),
            region: var("S3_REGION")
                .or_else(|| var("AWS_REGION"))
                .unwrap_or_else(default_region),
            bucket,
            access_key: var("S3_ACCESS_KEY").or_else(|| var("AWS_ACCESS_KEY_ID")),
            secret_key: var("S3_SECRET_KEY").or_else(|| var("AWS_SECRET_ACCESS_KEY")),
            path_style: var("S3_PATH_STYLE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
        })
    }

    /// Fill credentials missing from the file with `{prefix}` environment
    /// variables.
    pub fn with_env_credentials(mut self, prefix: &str) -> Self {
        let var = |name: &str| env::var(format!("{}{}", prefix, name)).ok();
        if self.access_key.is_none() {
            self.access_key = var("S3_ACCESS_KEY").or_else(|| var("AWS_ACCESS_KEY_ID"));
        }
        if self.secret_key.is_none() {
            self.secret_key = var("S3_SECRET_KEY").or_else(|| var("AWS_SECRET_ACCESS_KEY"));
        }
        self
    }

    pub fn for_minio(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            region: default_region(),
            bucket: bucket.into(),
            access_key: Some("minioadmin".to_string()),
            secret_key: Some("minioadmin".to_string()),
            path_style: true,
        }
    }

    pub fn for_aws(region: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            endpoint: None,
            region: region.into(),
            bucket: bucket.into(),
            access_key: None,
            secret_key: None,
            path_style: false,
        }
    }
}
