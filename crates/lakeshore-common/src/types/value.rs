//! Cell values and their declared types

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Semantic type of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Boolean,
    Int64,
    Float64,
    Utf8,
    Date,
    Timestamp,
}

impl DataType {
    /// Smallest type able to hold values of both `self` and `other`.
    ///
    /// Integers widen to floats; any other disagreement falls back to text.
    pub fn widen(self, other: DataType) -> DataType {
        match (self, other) {
            (a, b) if a == b => a,
            (DataType::Int64, DataType::Float64) | (DataType::Float64, DataType::Int64) => {
                DataType::Float64
            },
            _ => DataType::Utf8,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Boolean => "boolean",
            DataType::Int64 => "int64",
            DataType::Float64 => "float64",
            DataType::Utf8 => "utf8",
            DataType::Date => "date",
            DataType::Timestamp => "timestamp",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single cell
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Int64(i64),
    Float64(f64),
    Utf8(String),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
}

const TIMESTAMP_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

impl Value {
    /// Declared type of this value, `None` for nulls
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Null => None,
            Value::Boolean(_) => Some(DataType::Boolean),
            Value::Int64(_) => Some(DataType::Int64),
            Value::Float64(_) => Some(DataType::Float64),
            Value::Utf8(_) => Some(DataType::Utf8),
            Value::Date(_) => Some(DataType::Date),
            Value::Timestamp(_) => Some(DataType::Timestamp),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Guess the narrowest type for a raw text cell.
    ///
    /// Empty cells become [`Value::Null`].
    pub fn infer(raw: &str) -> Value {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Value::Null;
        }
        if let Ok(i) = trimmed.parse::<i64>() {
            return Value::Int64(i);
        }
        if let Ok(f) = trimmed.parse::<f64>() {
            if f.is_finite() {
                return Value::Float64(f);
            }
        }
        match trimmed.to_ascii_lowercase().as_str() {
            "true" => return Value::Boolean(true),
            "false" => return Value::Boolean(false),
            _ => {},
        }
        if let Ok(d) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
            return Value::Date(d);
        }
        if let Some(ts) = parse_timestamp(trimmed) {
            return Value::Timestamp(ts);
        }
        Value::Utf8(raw.to_string())
    }

    /// Convert into `target`, falling back to the text form when the value
    /// cannot be represented. Nulls stay null.
    pub fn cast(&self, target: DataType) -> Value {
        if self.data_type() == Some(target) || self.is_null() {
            return self.clone();
        }
        match (self, target) {
            (Value::Int64(i), DataType::Float64) => Value::Float64(*i as f64),
            (_, DataType::Utf8) => Value::Utf8(self.to_text()),
            (Value::Utf8(s), t) => {
                let inferred = Value::infer(s);
                match inferred.data_type() {
                    Some(found) if found == t => inferred,
                    Some(DataType::Int64) if t == DataType::Float64 => inferred.cast(t),
                    _ => Value::Null,
                }
            },
            _ => Value::Null,
        }
    }

    /// Like [`Value::cast`], but `None` when a non-null value would be lost
    pub fn try_cast(&self, target: DataType) -> Option<Value> {
        let cast = self.cast(target);
        (self.is_null() || !cast.is_null()).then_some(cast)
    }

    /// Text rendering used for CSV-ish output and key comparison
    pub fn to_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Boolean(b) => b.to_string(),
            Value::Int64(i) => i.to_string(),
            Value::Float64(f) => f.to_string(),
            Value::Utf8(s) => s.clone(),
            Value::Date(d) => d.format("%Y-%m-%d").to_string(),
            Value::Timestamp(ts) => ts.to_rfc3339(),
        }
    }

    /// Total ordering used for "latest wins" comparisons; nulls sort first.
    pub fn sort_cmp(&self, other: &Value) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Less,
            (_, Value::Null) => Ordering::Greater,
            (Value::Int64(a), Value::Int64(b)) => a.cmp(b),
            (Value::Float64(a), Value::Float64(b)) => a.total_cmp(b),
            (Value::Int64(a), Value::Float64(b)) => (*a as f64).total_cmp(b),
            (Value::Float64(a), Value::Int64(b)) => a.total_cmp(&(*b as f64)),
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            _ => self.to_text().cmp(&other.to_text()),
        }
    }
}

impl From<&serde_json::Value> for Value {
    fn from(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Boolean(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int64(i),
                None => n.as_f64().map(Value::Float64).unwrap_or(Value::Null),
            },
            serde_json::Value::String(s) => Value::Utf8(s.clone()),
            other => Value::Utf8(other.to_string()),
        }
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_scalars() {
        assert_eq!(Value::infer("42"), Value::Int64(42));
        assert_eq!(Value::infer("4.5"), Value::Float64(4.5));
        assert_eq!(Value::infer("TRUE"), Value::Boolean(true));
        assert_eq!(Value::infer("  "), Value::Null);
        assert_eq!(
            Value::infer("2025-01-02"),
            Value::Date(NaiveDate::from_ymd_opt(2025, 1, 2).unwrap())
        );
        assert_eq!(Value::infer("Lagos"), Value::Utf8("Lagos".to_string()));
    }

    #[test]
    fn test_infer_timestamps() {
        let ts = Value::infer("2025-11-20 08:15:00");
        assert_eq!(ts.data_type(), Some(DataType::Timestamp));
        let ts = Value::infer("2025-11-20T08:15:00+01:00");
        assert_eq!(ts.to_text(), "2025-11-20T07:15:00+00:00");
    }

    #[test]
    fn test_widen() {
        assert_eq!(DataType::Int64.widen(DataType::Float64), DataType::Float64);
        assert_eq!(DataType::Date.widen(DataType::Date), DataType::Date);
        assert_eq!(DataType::Boolean.widen(DataType::Int64), DataType::Utf8);
    }

    #[test]
    fn test_cast() {
        assert_eq!(Value::Int64(3).cast(DataType::Float64), Value::Float64(3.0));
        assert_eq!(Value::Int64(3).cast(DataType::Utf8), Value::Utf8("3".into()));
        assert_eq!(Value::Utf8("7".into()).cast(DataType::Int64), Value::Int64(7));
        assert_eq!(Value::Utf8("x".into()).cast(DataType::Int64), Value::Null);
        assert_eq!(Value::Null.cast(DataType::Date), Value::Null);
        assert_eq!(Value::Utf8("7".into()).try_cast(DataType::Int64), Some(Value::Int64(7)));
        assert_eq!(Value::Utf8("x".into()).try_cast(DataType::Int64), None);
        assert_eq!(Value::Null.try_cast(DataType::Int64), Some(Value::Null));
    }

    #[test]
    fn test_sort_cmp_nulls_first() {
        use std::cmp::Ordering;
        assert_eq!(Value::Null.sort_cmp(&Value::Int64(1)), Ordering::Less);
        assert_eq!(Value::Int64(2).sort_cmp(&Value::Float64(1.5)), Ordering::Greater);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        fn any_type() -> impl Strategy<Value = DataType> {
            prop_oneof![
                Just(DataType::Boolean),
                Just(DataType::Int64),
                Just(DataType::Float64),
                Just(DataType::Utf8),
                Just(DataType::Date),
                Just(DataType::Timestamp),
            ]
        }

        proptest! {
            #[test]
            fn widen_is_commutative(a in any_type(), b in any_type()) {
                prop_assert_eq!(a.widen(b), b.widen(a));
            }

            #[test]
            fn integers_infer_as_int64(n in any::<i64>()) {
                prop_assert_eq!(Value::infer(&n.to_string()), Value::Int64(n));
            }
        }
    }
}
