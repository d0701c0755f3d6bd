//! Processed-object ledger
//!
//! A single JSON document in the destination store records every source
//! object that has been durably staged. Listing readers consult it before
//! reading and the coordinator commits to it only after all of an object's
//! chunks are written, so a crash anywhere before the commit simply causes
//! the object to be read again on the next run.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info, instrument};

use crate::error::{PipelineError, Result};
use crate::storage::{ObjectInfo, ObjectStore};

pub const DEFAULT_LEDGER_KEY: &str = "metadata/processed_source_files.json";
pub const LEDGER_VERSION: u32 = 1;

/// One discoverable input object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceObjectRecord {
    pub key: String,
    pub last_modified: Option<DateTime<Utc>>,
    pub size_bytes: i64,
}

impl From<ObjectInfo> for SourceObjectRecord {
    fn from(info: ObjectInfo) -> Self {
        Self {
            key: info.key,
            last_modified: info.last_modified,
            size_bytes: info.size,
        }
    }
}

/// What the ledger remembers about a staged object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedEntry {
    pub processed_date: NaiveDate,
    #[serde(deserialize_with = "lenient_timestamp")]
    pub processed_timestamp: DateTime<Utc>,
    #[serde(rename = "file_size", default)]
    pub size_bytes: i64,
    #[serde(default, deserialize_with = "lenient_optional_timestamp")]
    pub source_last_modified: Option<DateTime<Utc>>,
}

/// Persisted ledger, keyed by source object key
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerDocument {
    pub version: u32,
    pub entries: BTreeMap<String, ProcessedEntry>,
}

impl LedgerDocument {
    pub fn new() -> Self {
        Self {
            version: LEDGER_VERSION,
            entries: BTreeMap::new(),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Accepts the versioned envelope as well as a bare `key -> entry` map
    fn parse(bytes: &[u8]) -> serde_json::Result<Self> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Stored {
            Versioned(LedgerDocument),
            Legacy(BTreeMap<String, ProcessedEntry>),
        }

        Ok(match serde_json::from_slice::<Stored>(bytes)? {
            Stored::Versioned(doc) => doc,
            Stored::Legacy(entries) => LedgerDocument {
                version: LEDGER_VERSION,
                entries,
            },
        })
    }
}

/// Outcome of reading the ledger document
#[derive(Debug)]
pub enum LedgerState {
    Found(LedgerDocument),
    /// No document yet; every object is new
    Empty,
    Unavailable(anyhow::Error),
}

/// Handle on the ledger document at `key` within `store`
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn ObjectStore>,
    key: String,
}

impl Ledger {
    pub fn new(store: Arc<dyn ObjectStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    #[instrument(skip(self), fields(ledger = %self.key))]
    pub async fn load(&self) -> LedgerState {
        match self.store.get(&self.key).await {
            Ok(None) => LedgerState::Empty,
            Ok(Some(bytes)) => match LedgerDocument::parse(&bytes) {
                Ok(doc) => LedgerState::Found(doc),
                Err(e) => LedgerState::Unavailable(
                    anyhow::Error::new(e).context("Ledger document is not valid JSON"),
                ),
            },
            Err(e) => LedgerState::Unavailable(e),
        }
    }

    /// Current document; a missing document reads as empty
    pub async fn entries(&self) -> Result<LedgerDocument> {
        match self.load().await {
            LedgerState::Found(doc) => Ok(doc),
            LedgerState::Empty => Ok(LedgerDocument::new()),
            LedgerState::Unavailable(source) => Err(self.unavailable(source)),
        }
    }

    /// Objects whose key has never been committed
    pub async fn list_new(&self, objects: Vec<SourceObjectRecord>) -> Result<Vec<SourceObjectRecord>> {
        let doc = self.entries().await?;

        let total = objects.len();
        let fresh: Vec<_> = objects
            .into_iter()
            .filter(|obj| match doc.entries.get(&obj.key) {
                Some(entry) => {
                    info!(
                        key = %obj.key,
                        processed_date = %entry.processed_date,
                        "Skipping already processed object"
                    );
                    false
                },
                None => true,
            })
            .collect();

        info!(total, new = fresh.len(), "Filtered source objects against ledger");
        Ok(fresh)
    }

    /// Record `objects` as processed on `run_date`. Re-reads the latest
    /// document first so entries committed since the last read survive.
    #[instrument(skip(self, objects), fields(ledger = %self.key, count = objects.len()))]
    pub async fn commit(&self, objects: &[SourceObjectRecord], run_date: NaiveDate) -> Result<usize> {
        if objects.is_empty() {
            return Ok(0);
        }

        let mut doc = self.entries().await?;
        let now = Utc::now();
        for obj in objects {
            doc.entries.insert(
                obj.key.clone(),
                ProcessedEntry {
                    processed_date: run_date,
                    processed_timestamp: now,
                    size_bytes: obj.size_bytes,
                    source_last_modified: obj.last_modified,
                },
            );
        }

        self.persist(&doc).await?;
        info!(committed = objects.len(), total = doc.len(), "Ledger updated");
        Ok(objects.len())
    }

    /// Forget `keys` so the objects are read again on the next run.
    /// Returns how many entries were removed.
    #[instrument(skip(self), fields(ledger = %self.key))]
    pub async fn purge(&self, keys: &[String]) -> Result<usize> {
        let mut doc = self.entries().await?;
        let removed = keys.iter().filter(|k| doc.entries.remove(k.as_str()).is_some()).count();
        if removed > 0 {
            self.persist(&doc).await?;
        }
        info!(removed, "Purged ledger entries");
        Ok(removed)
    }

    async fn persist(&self, doc: &LedgerDocument) -> Result<()> {
        let body = serde_json::to_vec_pretty(doc)
            .context("Failed to serialize ledger")
            .map_err(|e| self.unavailable(e))?;
        self.store
            .put(&self.key, body, Some("application/json"))
            .await
            .map_err(|e| self.unavailable(e))?;
        debug!("Persisted ledger with {} entries", doc.len());
        Ok(())
    }

    fn unavailable(&self, source: anyhow::Error) -> PipelineError {
        PipelineError::LedgerUnavailable {
            key: self.key.clone(),
            source,
        }
    }
}

/// Timestamps written without an offset are taken as UTC
fn parse_lenient(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| naive.and_utc())
        })
}

fn lenient_timestamp<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_lenient(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", raw)))
}

fn lenient_optional_timestamp<'de, D>(deserializer: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.and_then(|raw| parse_lenient(&raw)))
}
