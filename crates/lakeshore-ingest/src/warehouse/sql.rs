//! SQL text for the PostgreSQL adapter

use lakeshore_common::types::{Column, DataType, Schema};

/// Name of the session table recording loaded file tokens
pub const LOAD_HISTORY_TABLE: &str = "_lakeshore_load_history";
const RANK_COLUMN: &str = "_lakeshore_rank";

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn column_list(columns: &[String]) -> String {
    columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ")
}

pub fn pg_type(data_type: DataType) -> &'static str {
    match data_type {
        DataType::Boolean => "BOOLEAN",
        DataType::Int64 => "BIGINT",
        DataType::Float64 => "DOUBLE PRECISION",
        DataType::Utf8 => "TEXT",
        DataType::Date => "DATE",
        DataType::Timestamp => "TIMESTAMPTZ",
    }
}

/// Inverse of [`pg_type`] for `format_type()` output
pub fn data_type_of(formatted: &str) -> DataType {
    match formatted {
        "boolean" => DataType::Boolean,
        "smallint" | "integer" | "bigint" => DataType::Int64,
        "real" | "double precision" => DataType::Float64,
        "date" => DataType::Date,
        t if t.starts_with("numeric") => DataType::Float64,
        t if t.starts_with("timestamp") => DataType::Timestamp,
        _ => DataType::Utf8,
    }
}

fn column_def(column: &Column) -> String {
    format!("{} {}", quote_ident(&column.name), pg_type(column.data_type))
}

pub fn drop_temp_table(name: &str) -> String {
    format!("DROP TABLE IF EXISTS pg_temp.{}", quote_ident(name))
}

pub fn create_temp_table(name: &str, schema: &Schema) -> String {
    let defs = schema.columns().iter().map(column_def).collect::<Vec<_>>().join(", ");
    format!("CREATE TEMPORARY TABLE {} ({})", quote_ident(name), defs)
}

pub fn create_load_history() -> String {
    format!(
        "CREATE TEMPORARY TABLE IF NOT EXISTS {} (table_name TEXT NOT NULL, token TEXT NOT NULL, file_key TEXT NOT NULL, PRIMARY KEY (table_name, token))",
        quote_ident(LOAD_HISTORY_TABLE)
    )
}

pub fn rename_column(table: &str, from: &str, to: &str) -> String {
    format!(
        "ALTER TABLE {} RENAME COLUMN {} TO {}",
        quote_ident(table),
        quote_ident(from),
        quote_ident(to)
    )
}

pub fn create_table_like(target: &str, template: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (LIKE {})",
        quote_ident(target),
        quote_ident(template)
    )
}

pub fn add_column(table: &str, column: &Column) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {}",
        quote_ident(table),
        column_def(column)
    )
}

pub fn truncate(table: &str) -> String {
    format!("TRUNCATE TABLE {}", quote_ident(table))
}

pub fn count(table: &str) -> String {
    format!("SELECT COUNT(*) FROM {}", quote_ident(table))
}

/// Keep one row per key, preferring the greatest `order_by` and then the
/// most recently inserted row
pub fn deduplicate(source: &str, dest: &str, columns: &[String], keys: &[String], order_by: Option<&str>) -> String {
    let order = match order_by {
        Some(col) => format!("{} DESC NULLS LAST, ctid DESC", quote_ident(col)),
        None => "ctid DESC".to_string(),
    };
    format!(
        "CREATE TEMPORARY TABLE {dest} AS SELECT {cols} FROM (SELECT *, ROW_NUMBER() OVER (PARTITION BY {keys} ORDER BY {order}) AS {rank} FROM {source}) ranked WHERE {rank} = 1",
        dest = quote_ident(dest),
        cols = column_list(columns),
        keys = column_list(keys),
        order = order,
        rank = quote_ident(RANK_COLUMN),
        source = quote_ident(source),
    )
}

/// Single-statement upsert. Without non-key columns only inserts.
pub fn merge(target: &str, source: &str, keys: &[String], columns: &[String]) -> String {
    let on = keys
        .iter()
        .map(|k| format!("tgt.{0} = src.{0}", quote_ident(k)))
        .collect::<Vec<_>>()
        .join(" AND ");
    let non_keys: Vec<&String> = columns
        .iter()
        .filter(|c| !keys.iter().any(|k| k.eq_ignore_ascii_case(c)))
        .collect();

    let mut sql = format!(
        "MERGE INTO {} AS tgt USING {} AS src ON {}",
        quote_ident(target),
        quote_ident(source),
        on
    );
    if !non_keys.is_empty() {
        let set = non_keys
            .iter()
            .map(|c| format!("{0} = src.{0}", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");
        sql.push_str(&format!(" WHEN MATCHED THEN UPDATE SET {}", set));
    }
    let values = columns
        .iter()
        .map(|c| format!("src.{}", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");
    sql.push_str(&format!(
        " WHEN NOT MATCHED THEN INSERT ({}) VALUES ({})",
        column_list(columns),
        values
    ));
    sql
}

/// Existing relation named `table` (temporary tables first)
pub const REGCLASS_QUERY: &str = "SELECT to_regclass($1)::text";

pub const DESCRIBE_QUERY: &str = "SELECT a.attname::text, format_type(a.atttypid, a.atttypmod) \
     FROM pg_attribute a \
     WHERE a.attrelid = to_regclass($1) AND a.attnum > 0 AND NOT a.attisdropped \
     ORDER BY a.attnum";
