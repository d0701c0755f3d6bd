//! Row-major tabular batch with a declared schema

use serde::{Deserialize, Serialize};

use super::value::{DataType, Value};
use crate::error::{LakeError, Result};

/// A named, typed column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// Ordered list of columns
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    columns: Vec<Column>,
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Case-insensitive lookup, as warehouses fold identifier case
    pub fn find_ignore_case(&self, name: &str) -> Option<&Column> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Union of two schemas. Columns keep first-seen order; a column present in
    /// both with different types is widened.
    pub fn union(&self, other: &Schema) -> Schema {
        let mut columns = self.columns.clone();
        for col in &other.columns {
            match columns
                .iter_mut()
                .find(|c| c.name.eq_ignore_ascii_case(&col.name))
            {
                Some(existing) => existing.data_type = existing.data_type.widen(col.data_type),
                None => columns.push(col.clone()),
            }
        }
        Schema { columns }
    }
}

/// Schema plus rows. Every row has exactly one value per column and every
/// non-null value matches its column's declared type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    schema: Schema,
    rows: Vec<Vec<Value>>,
}

impl Batch {
    /// Build a batch, checking row width and value types
    pub fn try_new(schema: Schema, rows: Vec<Vec<Value>>) -> Result<Self> {
        for (idx, row) in rows.iter().enumerate() {
            if row.len() != schema.len() {
                return Err(LakeError::Schema(format!(
                    "row {} has {} values, schema has {} columns",
                    idx,
                    row.len(),
                    schema.len()
                )));
            }
            for (value, column) in row.iter().zip(schema.columns()) {
                if let Some(found) = value.data_type() {
                    if found != column.data_type {
                        return Err(LakeError::Schema(format!(
                            "row {} column '{}' holds {} but is declared {}",
                            idx, column.name, found, column.data_type
                        )));
                    }
                }
            }
        }
        Ok(Self { schema, rows })
    }

    pub fn empty(schema: Schema) -> Self {
        Self {
            schema,
            rows: Vec::new(),
        }
    }

    /// Build from raw text cells, inferring one type per column.
    ///
    /// Short rows are padded with nulls; extra cells are dropped.
    pub fn from_text_rows(headers: &[String], raw_rows: &[Vec<String>]) -> Self {
        let width = headers.len();
        let inferred: Vec<Vec<Value>> = raw_rows
            .iter()
            .map(|raw| {
                (0..width)
                    .map(|i| raw.get(i).map(|cell| Value::infer(cell)).unwrap_or(Value::Null))
                    .collect()
            })
            .collect();

        let columns = headers
            .iter()
            .enumerate()
            .map(|(i, name)| Column::new(name.clone(), column_type(&inferred, i)))
            .collect();

        Self::conform(Schema::new(columns), inferred)
    }

    /// Build from JSON objects. Nested objects are flattened into
    /// `parent.child` columns; arrays are kept as their JSON text.
    pub fn from_json_objects(objects: &[serde_json::Map<String, serde_json::Value>]) -> Self {
        let mut names: Vec<String> = Vec::new();
        let flat: Vec<Vec<(String, Value)>> = objects
            .iter()
            .map(|obj| {
                let mut cells = Vec::new();
                flatten_into("", obj, &mut cells);
                for (name, _) in &cells {
                    if !names.contains(name) {
                        names.push(name.clone());
                    }
                }
                cells
            })
            .collect();

        let rows: Vec<Vec<Value>> = flat
            .into_iter()
            .map(|cells| {
                let mut row = vec![Value::Null; names.len()];
                for (name, value) in cells {
                    if let Some(i) = names.iter().position(|n| *n == name) {
                        row[i] = value;
                    }
                }
                row
            })
            .collect();

        let columns = names
            .iter()
            .enumerate()
            .map(|(i, name)| Column::new(name.clone(), column_type(&rows, i)))
            .collect();

        Self::conform(Schema::new(columns), rows)
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Vec<Value>> {
        self.rows
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Values of one column, top to bottom
    pub fn column_values(&self, index: usize) -> impl Iterator<Item = &Value> {
        self.rows.iter().map(move |row| &row[index])
    }

    /// Copy with every column renamed through `rename`
    pub fn rename_columns<F>(&self, mut rename: F) -> Batch
    where
        F: FnMut(&str) -> String,
    {
        let columns = self
            .schema
            .columns()
            .iter()
            .map(|c| Column::new(rename(&c.name), c.data_type))
            .collect();
        Batch {
            schema: Schema::new(columns),
            rows: self.rows.clone(),
        }
    }

    /// Set `name` to `value` on every row, replacing an existing column of the
    /// same name or appending a new one.
    pub fn with_constant(mut self, name: &str, data_type: DataType, value: Value) -> Batch {
        match self.schema.index_of(name) {
            Some(idx) => {
                self.schema.columns[idx].data_type = data_type;
                for row in &mut self.rows {
                    row[idx] = value.clone();
                }
            },
            None => {
                self.schema.columns.push(Column::new(name, data_type));
                for row in &mut self.rows {
                    row.push(value.clone());
                }
            },
        }
        self
    }

    /// Re-shape into `target`: columns are matched case-insensitively, missing
    /// ones become null and values are cast to the target types.
    pub fn conform_to(&self, target: &Schema) -> Batch {
        let mapping: Vec<Option<usize>> = target
            .columns()
            .iter()
            .map(|col| {
                self.schema
                    .columns()
                    .iter()
                    .position(|c| c.name.eq_ignore_ascii_case(&col.name))
            })
            .collect();

        let rows = self
            .rows
            .iter()
            .map(|row| {
                mapping
                    .iter()
                    .zip(target.columns())
                    .map(|(src, col)| match src {
                        Some(i) => row[*i].cast(col.data_type),
                        None => Value::Null,
                    })
                    .collect()
            })
            .collect();

        Batch {
            schema: target.clone(),
            rows,
        }
    }

    fn conform(schema: Schema, rows: Vec<Vec<Value>>) -> Batch {
        let rows = rows
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .zip(schema.columns())
                    .map(|(v, c)| v.cast(c.data_type))
                    .collect()
            })
            .collect();
        Batch { schema, rows }
    }
}

fn column_type(rows: &[Vec<Value>], index: usize) -> DataType {
    rows.iter()
        .filter_map(|row| row[index].data_type())
        .reduce(DataType::widen)
        .unwrap_or(DataType::Utf8)
}

fn flatten_into(
    prefix: &str,
    obj: &serde_json::Map<String, serde_json::Value>,
    out: &mut Vec<(String, Value)>,
) {
    for (key, value) in obj {
        let name = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        match value {
            serde_json::Value::Object(nested) => flatten_into(&name, nested, out),
            other => out.push((name, Value::from(other))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn headers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_from_text_rows_infers_per_column() {
        let rows = vec![
            vec!["1".to_string(), "Ada".to_string(), "2.5".to_string()],
            vec!["2".to_string(), "".to_string(), "3".to_string()],
        ];
        let batch = Batch::from_text_rows(&headers(&["id", "name", "score"]), &rows);

        let types: Vec<DataType> = batch.schema().columns().iter().map(|c| c.data_type).collect();
        assert_eq!(types, vec![DataType::Int64, DataType::Utf8, DataType::Float64]);
        assert_eq!(batch.rows()[1][1], Value::Null);
        assert_eq!(batch.rows()[1][2], Value::Float64(3.0));
    }

    #[test]
    fn test_mixed_column_falls_back_to_text() {
        let rows = vec![vec!["1".to_string()], vec!["abc".to_string()]];
        let batch = Batch::from_text_rows(&headers(&["code"]), &rows);
        assert_eq!(batch.schema().columns()[0].data_type, DataType::Utf8);
        assert_eq!(batch.rows()[0][0], Value::Utf8("1".to_string()));
    }

    #[test]
    fn test_from_json_flattens_nested_objects() {
        let docs = vec![
            json!({"id": 1, "user": {"handle": "@a", "followers": 10}}),
            json!({"id": 2, "user": {"handle": "@b"}, "tags": ["x"]}),
        ];
        let objects: Vec<_> = docs.into_iter().map(|d| d.as_object().unwrap().clone()).collect();
        let batch = Batch::from_json_objects(&objects);

        assert_eq!(
            batch.schema().names(),
            vec!["id", "user.handle", "user.followers", "tags"]
        );
        assert_eq!(batch.rows()[1][2], Value::Null);
        assert_eq!(batch.rows()[1][3], Value::Utf8("[\"x\"]".to_string()));
    }

    #[test]
    fn test_try_new_rejects_mismatched_types() {
        let schema = Schema::new(vec![Column::new("id", DataType::Int64)]);
        let err = Batch::try_new(schema, vec![vec![Value::Utf8("x".into())]]);
        assert!(err.is_err());
    }

    #[test]
    fn test_with_constant_replaces_existing_column() {
        let schema = Schema::new(vec![Column::new("id", DataType::Int64)]);
        let batch = Batch::try_new(schema, vec![vec![Value::Int64(1)]]).unwrap();
        let batch = batch
            .with_constant("src", DataType::Utf8, Value::Utf8("a".into()))
            .with_constant("src", DataType::Utf8, Value::Utf8("b".into()));
        assert_eq!(batch.schema().len(), 2);
        assert_eq!(batch.rows()[0][1], Value::Utf8("b".into()));
    }

    #[test]
    fn test_schema_union_widens_conflicts() {
        let a = Schema::new(vec![Column::new("id", DataType::Int64)]);
        let b = Schema::new(vec![
            Column::new("ID", DataType::Float64),
            Column::new("name", DataType::Utf8),
        ]);
        let merged = a.union(&b);
        assert_eq!(merged.names(), vec!["id", "name"]);
        assert_eq!(merged.columns()[0].data_type, DataType::Float64);
    }

    #[test]
    fn test_conform_to_fills_missing_columns() {
        let schema = Schema::new(vec![Column::new("id", DataType::Int64)]);
        let batch = Batch::try_new(schema, vec![vec![Value::Int64(5)]]).unwrap();
        let target = Schema::new(vec![
            Column::new("ID", DataType::Float64),
            Column::new("extra", DataType::Utf8),
        ]);
        let conformed = batch.conform_to(&target);
        assert_eq!(conformed.rows()[0], vec![Value::Float64(5.0), Value::Null]);
    }
}
