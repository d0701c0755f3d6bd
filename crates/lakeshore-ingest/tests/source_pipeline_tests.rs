//! Query and snapshot sources driven through the coordinator

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use lakeshore_common::types::Batch;
use lakeshore_ingest::coordinator::RunContext;
use lakeshore_ingest::sources::{QuerySource, RelationalSource, SheetClient, SnapshotSource};
use lakeshore_ingest::writer::WriteMode;

mod common;
use common::{column_by_id, date, pipeline, Harness};

/// Serves fixed rows in chunks and records the queries it was sent
struct FixedRows {
    rows: Vec<Vec<String>>,
    queries: Mutex<Vec<String>>,
}

impl RelationalSource for FixedRows {
    fn query_chunks<'a>(&'a self, sql: &'a str, chunk_rows: usize) -> BoxStream<'a, anyhow::Result<Batch>> {
        self.queries.lock().unwrap().push(sql.to_string());
        let headers = vec!["id".to_string(), "complaint".to_string()];
        let chunks: Vec<anyhow::Result<Batch>> = self
            .rows
            .chunks(chunk_rows)
            .map(|chunk| Ok(Batch::from_text_rows(&headers, chunk)))
            .collect();
        stream::iter(chunks).boxed()
    }
}

#[tokio::test]
async fn test_query_source_stages_run_date_table() {
    let h = Harness::new();
    let db = Arc::new(FixedRows {
        rows: (1..=7)
            .map(|i| vec![i.to_string(), format!("complaint {}", i)])
            .collect(),
        queries: Mutex::new(Vec::new()),
    });
    let source = QuerySource::new(db.clone(), "customer_complaints", "web_form_request").with_chunk_rows(3);
    let table = pipeline("web_form_request", source, WriteMode::OverwritePartition, &["id"]);

    let report = h
        .coordinator()
        .run(vec![table], RunContext::new(date(2025, 11, 23)))
        .await;
    assert!(report.is_success(), "{:?}", report);

    assert_eq!(
        db.queries.lock().unwrap().clone(),
        vec!["SELECT * FROM \"customer_complaints\".\"web_form_request_2025_11_23\""]
    );
    let t = report.table("web_form_request").unwrap();
    assert_eq!(t.rows_staged, 7);
    // Query sources are not ledger-tracked
    assert_eq!(t.ledger_committed, 0);
    assert!(h.ledger_keys().await.is_empty());
    assert_eq!(
        h.writer()
            .partition_files("web_form_request", date(2025, 11, 23))
            .await
            .unwrap()
            .len(),
        3
    );
    assert_eq!(h.target("web_form_request").num_rows(), 7);
}

/// A sheet whose contents can be swapped between runs
struct MutableSheet {
    rows: Mutex<Vec<Vec<String>>>,
}

#[async_trait]
impl SheetClient for MutableSheet {
    async fn read_all(&self, sheet_id: &str, sheet_name: &str) -> anyhow::Result<Batch> {
        assert_eq!((sheet_id, sheet_name), ("sheet-1", "Agents"));
        let headers = vec!["ID".to_string(), "Agent Name".to_string()];
        Ok(Batch::from_text_rows(&headers, &self.rows.lock().unwrap()))
    }
}

#[tokio::test]
async fn test_snapshot_source_overwrites_and_upserts() {
    let h = Harness::new();
    let coordinator = h.coordinator();
    let sheet = Arc::new(MutableSheet {
        rows: Mutex::new(vec![
            vec!["1".into(), "Ada".into()],
            vec!["2".into(), "Grace".into()],
        ]),
    });
    let table = pipeline(
        "agents",
        SnapshotSource::new(sheet.clone(), "sheet-1", "Agents"),
        WriteMode::OverwriteAll,
        &["id"],
    );

    let report = coordinator
        .run(vec![table.clone()], RunContext::new(date(2025, 11, 20)))
        .await;
    assert!(report.is_success(), "{:?}", report);
    assert_eq!(column_by_id(&h.target("agents"), "agent_name"), vec!["1=Ada", "2=Grace"]);

    *sheet.rows.lock().unwrap() = vec![vec!["2".into(), "Grace Hopper".into()], vec!["3".into(), "Linus".into()]];
    let report = coordinator
        .run(vec![table], RunContext::new(date(2025, 11, 21)))
        .await;
    assert!(report.is_success(), "{:?}", report);

    // Only the latest snapshot stays staged
    let staged = h.staged_files("agents").await;
    assert_eq!(staged.len(), 1);
    assert!(staged[0].contains("ingestion_date=2025-11-21"));

    // Rows missing from the new snapshot stay in the target
    assert_eq!(
        column_by_id(&h.target("agents"), "agent_name"),
        vec!["1=Ada", "2=Grace Hopper", "3=Linus"]
    );
}

#[tokio::test]
async fn test_failing_snapshot_aborts_table() {
    struct Broken;

    #[async_trait]
    impl SheetClient for Broken {
        async fn read_all(&self, _sheet_id: &str, _sheet_name: &str) -> anyhow::Result<Batch> {
            anyhow::bail!("403 Forbidden")
        }
    }

    let h = Harness::new();
    let table = pipeline("agents", SnapshotSource::new(Arc::new(Broken), "s", "Agents"), WriteMode::OverwriteAll, &["id"]);
    let report = h
        .coordinator()
        .run(vec![table], RunContext::new(date(2025, 11, 20)))
        .await;

    let failure = report.table("agents").unwrap().failure.as_ref().unwrap();
    assert_eq!(failure.stage_label(), "read");
    assert!(failure.error.to_string().contains("403 Forbidden"));
    assert!(h.staged_files("agents").await.is_empty());
}
