//! Column-name normalization and ingestion metadata

use std::collections::HashSet;

use chrono::{DateTime, NaiveDate, Utc};
use lakeshore_common::types::{Batch, DataType, Value};

pub const SOURCE_SYSTEM: &str = "source_system";
pub const INGESTION_TIMESTAMP: &str = "ingestion_timestamp";
pub const INGESTION_DATE: &str = "ingestion_date";

/// Provenance stamped onto every normalized row
#[derive(Debug, Clone, PartialEq)]
pub struct IngestionStamp {
    pub source_name: String,
    pub timestamp: DateTime<Utc>,
    pub run_date: NaiveDate,
}

impl IngestionStamp {
    pub fn now(source_name: impl Into<String>, run_date: NaiveDate) -> Self {
        Self {
            source_name: source_name.into(),
            timestamp: Utc::now(),
            run_date,
        }
    }
}

/// Trim, lower-case and replace spaces with underscores
pub fn normalize_column_name(name: &str) -> String {
    name.trim().to_lowercase().replace(' ', "_")
}

/// Rename columns and append (or overwrite) the three metadata columns.
///
/// Names that collide after normalization get a numeric suffix
/// (`amount`, `amount_2`, ...), so a normalized batch never repeats a column.
pub fn normalize(batch: &Batch, stamp: &IngestionStamp) -> Batch {
    let mut seen: HashSet<String> = HashSet::new();
    let renamed = batch.rename_columns(|name| {
        let base = normalize_column_name(name);
        let mut candidate = base.clone();
        let mut n = 2;
        while !seen.insert(candidate.clone()) {
            candidate = format!("{}_{}", base, n);
            n += 1;
        }
        candidate
    });

    renamed
        .with_constant(
            SOURCE_SYSTEM,
            DataType::Utf8,
            Value::Utf8(stamp.source_name.clone()),
        )
        .with_constant(
            INGESTION_TIMESTAMP,
            DataType::Timestamp,
            Value::Timestamp(stamp.timestamp),
        )
        .with_constant(INGESTION_DATE, DataType::Date, Value::Date(stamp.run_date))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lakeshore_common::types::{Column, Schema};
    use proptest::prelude::*;

    fn stamp() -> IngestionStamp {
        IngestionStamp {
            source_name: "customers".to_string(),
            timestamp: DateTime::parse_from_rfc3339("2025-11-20T06:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            run_date: NaiveDate::from_ymd_opt(2025, 11, 20).unwrap(),
        }
    }

    fn batch(names: &[&str]) -> Batch {
        let schema = Schema::new(names.iter().map(|n| Column::new(*n, DataType::Int64)).collect());
        let row = (0..names.len() as i64).map(Value::Int64).collect();
        Batch::try_new(schema, vec![row]).unwrap()
    }

    #[test]
    fn test_column_names() {
        assert_eq!(normalize_column_name("  Customer ID "), "customer_id");
        assert_eq!(normalize_column_name("Agent Email Address"), "agent_email_address");
        assert_eq!(normalize_column_name("already_ok"), "already_ok");
    }

    #[test]
    fn test_appends_metadata_columns() {
        let out = normalize(&batch(&["Customer ID", "Name"]), &stamp());
        assert_eq!(
            out.schema().names(),
            vec!["customer_id", "name", SOURCE_SYSTEM, INGESTION_TIMESTAMP, INGESTION_DATE]
        );
        let row = &out.rows()[0];
        assert_eq!(row[2], Value::Utf8("customers".into()));
        assert_eq!(row[4], Value::Date(stamp().run_date));
    }

    #[test]
    fn test_replaces_existing_metadata() {
        let out = normalize(&batch(&["id", "Ingestion Date"]), &stamp());
        assert_eq!(out.schema().len(), 4);
        let idx = out.schema().index_of(INGESTION_DATE).unwrap();
        assert_eq!(out.schema().columns()[idx].data_type, DataType::Date);
        assert_eq!(out.rows()[0][idx], Value::Date(stamp().run_date));
    }

    #[test]
    fn test_collisions_get_suffix() {
        let out = normalize(&batch(&["Amount", "amount", "AMOUNT "]), &stamp());
        assert_eq!(&out.schema().names()[..3], &["amount", "amount_2", "amount_3"]);
    }

    #[test]
    fn test_input_untouched() {
        let input = batch(&["Customer ID"]);
        let _ = normalize(&input, &stamp());
        assert_eq!(input.schema().names(), vec!["Customer ID"]);
    }

    proptest! {
        #[test]
        fn normalize_is_idempotent(names in proptest::collection::vec("[ A-Za-z0-9_]{1,12}", 1..6)) {
            let names: Vec<&str> = names.iter().map(String::as_str).collect();
            let once = normalize(&batch(&names), &stamp());
            let twice = normalize(&once, &stamp());
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn column_name_is_idempotent(name in "[ A-Za-z0-9_-]{0,24}") {
            let once = normalize_column_name(&name);
            prop_assert_eq!(normalize_column_name(&once), once);
        }
    }
}
