//! Whole-spreadsheet snapshot reader

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use futures::{stream, StreamExt};
use lakeshore_common::types::Batch;
use serde::Deserialize;
use tracing::{debug, info, instrument};

use super::{BatchStream, FailurePolicy, RawBatch, Source, SourceUnit};
use crate::ledger::Ledger;

pub const DEFAULT_SHEETS_URL: &str = "https://sheets.googleapis.com";

/// A spreadsheet service returning a whole sheet at once
#[async_trait]
pub trait SheetClient: Send + Sync {
    /// All rows of `sheet_name`; the first row is the header
    async fn read_all(&self, sheet_id: &str, sheet_name: &str) -> Result<Batch>;
}

pub struct SnapshotSource {
    client: Arc<dyn SheetClient>,
    sheet_id: String,
    sheet_name: String,
}

impl SnapshotSource {
    pub fn new(client: Arc<dyn SheetClient>, sheet_id: impl Into<String>, sheet_name: impl Into<String>) -> Self {
        Self {
            client,
            sheet_id: sheet_id.into(),
            sheet_name: sheet_name.into(),
        }
    }
}

#[async_trait]
impl Source for SnapshotSource {
    fn kind(&self) -> &'static str {
        "snapshot"
    }

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::Abort
    }

    async fn discover(&self, _run_date: NaiveDate, _ledger: &Ledger) -> crate::error::Result<Vec<SourceUnit>> {
        Ok(vec![SourceUnit {
            label: format!("sheet {}/{}", self.sheet_id, self.sheet_name),
            locator: self.sheet_name.clone(),
            object: None,
        }])
    }

    fn open<'a>(&'a self, unit: &'a SourceUnit) -> BatchStream<'a> {
        stream::once(async move {
            let batch = self.client.read_all(&self.sheet_id, &unit.locator).await?;
            info!(rows = batch.num_rows(), sheet = %unit.locator, "Read sheet snapshot");
            Ok::<_, anyhow::Error>(RawBatch::new(batch))
        })
        .boxed()
    }
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

fn cell_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Google Sheets v4 REST client. Authenticates with a bearer token (OAuth
/// access token) or an API key.
#[derive(Clone)]
pub struct GoogleSheetsClient {
    http: reqwest::Client,
    base_url: String,
    bearer_token: Option<String>,
    api_key: Option<String>,
}

impl GoogleSheetsClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bearer_token: None,
            api_key: None,
        }
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    fn values_url(&self, sheet_id: &str, sheet_name: &str) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .with_context(|| format!("Invalid Sheets base URL: {}", self.base_url))?;
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("Sheets base URL cannot take a path"))?
            .pop_if_empty()
            .extend(["v4", "spreadsheets", sheet_id, "values", sheet_name]);
        Ok(url)
    }
}

#[async_trait]
impl SheetClient for GoogleSheetsClient {
    #[instrument(skip(self))]
    async fn read_all(&self, sheet_id: &str, sheet_name: &str) -> Result<Batch> {
        let url = self.values_url(sheet_id, sheet_name)?;
        debug!("Fetching {}", url);

        let mut request = self.http.get(url);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }
        if let Some(key) = &self.api_key {
            request = request.query(&[("key", key)]);
        }

        let response = request
            .send()
            .await
            .context("Failed to reach Sheets API")?
            .error_for_status()
            .context("Sheets API returned an error")?;
        let range: ValueRange = response.json().await.context("Unexpected Sheets response")?;

        let mut rows = range.values.into_iter();
        let Some(header) = rows.next() else {
            return Ok(Batch::default());
        };
        let headers: Vec<String> = header.iter().map(cell_text).collect();
        let body: Vec<Vec<String>> = rows
            .filter(|row| row.iter().any(|v| !cell_text(v).is_empty()))
            .map(|row| row.iter().map(cell_text).collect())
            .collect();

        Ok(Batch::from_text_rows(&headers, &body))
    }
}
