//! Parquet encoding of batches
//!
//! Staged files are self-describing Parquet with Snappy compression. The
//! merge engine reads only the footer schema during inference and decodes
//! whole files when loading.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use arrow_array::{
    cast::AsArray,
    types::{
        Date32Type, Float32Type, Float64Type, Int16Type, Int32Type, Int64Type, Int8Type,
        TimestampMicrosecondType, TimestampMillisecondType, TimestampNanosecondType,
        TimestampSecondType,
    },
    Array, ArrayRef, BooleanArray, Date32Array, Float64Array, Int64Array, RecordBatch,
    StringArray, TimestampMicrosecondArray,
};
use arrow_schema::{DataType as ArrowType, Field, Schema as ArrowSchema, TimeUnit};
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use lakeshore_common::types::{Batch, Column, DataType, Schema, Value};
use parquet::{
    arrow::{arrow_reader::ParquetRecordBatchReaderBuilder, parquet_to_arrow_schema, ArrowWriter},
    basic::Compression,
    file::{footer::decode_metadata, properties::WriterProperties},
};

pub const PARQUET_CONTENT_TYPE: &str = "application/vnd.apache.parquet";
const UTC: &str = "UTC";

fn to_arrow_type(data_type: DataType) -> ArrowType {
    match data_type {
        DataType::Boolean => ArrowType::Boolean,
        DataType::Int64 => ArrowType::Int64,
        DataType::Float64 => ArrowType::Float64,
        DataType::Utf8 => ArrowType::Utf8,
        DataType::Date => ArrowType::Date32,
        DataType::Timestamp => ArrowType::Timestamp(TimeUnit::Microsecond, Some(UTC.into())),
    }
}

fn from_arrow_type(arrow: &ArrowType) -> Result<DataType> {
    Ok(match arrow {
        ArrowType::Boolean => DataType::Boolean,
        ArrowType::Int8 | ArrowType::Int16 | ArrowType::Int32 | ArrowType::Int64 => DataType::Int64,
        ArrowType::Float32 | ArrowType::Float64 => DataType::Float64,
        ArrowType::Utf8 | ArrowType::LargeUtf8 | ArrowType::Null => DataType::Utf8,
        ArrowType::Date32 => DataType::Date,
        ArrowType::Timestamp(_, _) => DataType::Timestamp,
        other => bail!("Unsupported Parquet column type: {}", other),
    })
}

fn days_since_epoch(date: NaiveDate) -> i32 {
    (date - NaiveDate::default()).num_days() as i32
}

fn date_from_days(days: i32) -> Option<NaiveDate> {
    NaiveDate::default().checked_add_signed(TimeDelta::days(days as i64))
}

fn column_array(batch: &Batch, index: usize, data_type: DataType) -> ArrayRef {
    let values = batch.column_values(index);
    match data_type {
        DataType::Boolean => Arc::new(BooleanArray::from(
            values
                .map(|v| match v {
                    Value::Boolean(b) => Some(*b),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        DataType::Int64 => Arc::new(Int64Array::from(
            values
                .map(|v| match v {
                    Value::Int64(i) => Some(*i),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        DataType::Float64 => Arc::new(Float64Array::from(
            values
                .map(|v| match v {
                    Value::Float64(f) => Some(*f),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        DataType::Utf8 => Arc::new(StringArray::from(
            values
                .map(|v| match v {
                    Value::Null => None,
                    other => Some(other.to_text()),
                })
                .collect::<Vec<_>>(),
        )),
        DataType::Date => Arc::new(Date32Array::from(
            values
                .map(|v| match v {
                    Value::Date(d) => Some(days_since_epoch(*d)),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        DataType::Timestamp => Arc::new(
            TimestampMicrosecondArray::from(
                values
                    .map(|v| match v {
                        Value::Timestamp(ts) => Some(ts.timestamp_micros()),
                        _ => None,
                    })
                    .collect::<Vec<_>>(),
            )
            .with_timezone(UTC),
        ),
    }
}

/// Encode a batch as one Snappy-compressed Parquet file
pub fn encode(batch: &Batch) -> Result<Vec<u8>> {
    let fields: Vec<Field> = batch
        .schema()
        .columns()
        .iter()
        .map(|c| Field::new(&c.name, to_arrow_type(c.data_type), true))
        .collect();
    let arrow_schema = Arc::new(ArrowSchema::new(fields));

    let arrays: Vec<ArrayRef> = batch
        .schema()
        .columns()
        .iter()
        .enumerate()
        .map(|(i, c)| column_array(batch, i, c.data_type))
        .collect();
    let record = RecordBatch::try_new(arrow_schema.clone(), arrays)
        .context("Failed to assemble record batch")?;

    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();

    let mut buf = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buf, arrow_schema, Some(props))
        .context("Failed to create Parquet writer")?;
    writer.write(&record).context("Failed to write Parquet rows")?;
    writer.close().context("Failed to finish Parquet file")?;

    Ok(buf)
}

/// Length in bytes of the trailer after the footer metadata: the metadata
/// length and the `PAR1` magic
pub const TRAILER_LEN: usize = 8;

/// Size of the footer metadata, read from a file's trailing bytes
pub fn footer_len(tail: &[u8]) -> Result<usize> {
    if tail.len() < TRAILER_LEN || !tail.ends_with(b"PAR1") {
        bail!("Not a Parquet file: missing trailing magic");
    }
    let start = tail.len() - TRAILER_LEN;
    let len: [u8; 4] = tail[start..start + 4].try_into()?;
    Ok(u32::from_le_bytes(len) as usize)
}

/// Column names and types from the footer. `tail` is any suffix of the file
/// holding the footer metadata and the trailer, up to the whole file.
pub fn read_schema(tail: &[u8]) -> Result<Schema> {
    let metadata_len = footer_len(tail)?;
    let end = tail.len() - TRAILER_LEN;
    if end < metadata_len {
        bail!("Truncated Parquet footer: need {} bytes, have {}", metadata_len, end);
    }
    #[allow(deprecated)]
    let metadata =
        decode_metadata(&tail[end - metadata_len..end]).context("Failed to read Parquet footer")?;
    let file = metadata.file_metadata();
    let arrow = parquet_to_arrow_schema(file.schema_descr(), file.key_value_metadata())
        .context("Failed to read Arrow schema from Parquet footer")?;
    arrow_to_schema(&arrow)
}

fn arrow_to_schema(arrow: &ArrowSchema) -> Result<Schema> {
    let columns = arrow
        .fields()
        .iter()
        .map(|f| Ok(Column::new(f.name().clone(), from_arrow_type(f.data_type())?)))
        .collect::<Result<Vec<_>>>()?;
    Ok(Schema::new(columns))
}

/// Decode a whole Parquet file
pub fn decode(data: Vec<u8>) -> Result<Batch> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(Bytes::from(data))
        .context("Failed to read Parquet footer")?;
    let schema = arrow_to_schema(builder.schema())?;
    let reader = builder.build().context("Failed to open Parquet reader")?;

    let mut rows: Vec<Vec<Value>> = Vec::new();
    for record in reader {
        let record = record.context("Failed to decode Parquet row group")?;
        let columns = record
            .columns()
            .iter()
            .map(|array| array_values(array.as_ref()))
            .collect::<Result<Vec<_>>>()?;

        for row in 0..record.num_rows() {
            rows.push(columns.iter().map(|col| col[row].clone()).collect());
        }
    }

    Batch::try_new(schema, rows).map_err(|e| anyhow!("Decoded rows do not match footer: {}", e))
}

fn timestamp(value: i64, per_second: i64) -> Value {
    let secs = value.div_euclid(per_second);
    let nanos = value.rem_euclid(per_second) * (1_000_000_000 / per_second);
    DateTime::<Utc>::from_timestamp(secs, nanos as u32)
        .map(Value::Timestamp)
        .unwrap_or(Value::Null)
}

fn array_values(array: &dyn Array) -> Result<Vec<Value>> {
    let data_type = array.data_type().clone();
    from_arrow_type(&data_type)?;

    let value_at = |i: usize| -> Value {
        match &data_type {
            ArrowType::Boolean => Value::Boolean(array.as_boolean().value(i)),
            ArrowType::Int8 => Value::Int64(array.as_primitive::<Int8Type>().value(i) as i64),
            ArrowType::Int16 => Value::Int64(array.as_primitive::<Int16Type>().value(i) as i64),
            ArrowType::Int32 => Value::Int64(array.as_primitive::<Int32Type>().value(i) as i64),
            ArrowType::Int64 => Value::Int64(array.as_primitive::<Int64Type>().value(i)),
            ArrowType::Float32 => Value::Float64(array.as_primitive::<Float32Type>().value(i) as f64),
            ArrowType::Float64 => Value::Float64(array.as_primitive::<Float64Type>().value(i)),
            ArrowType::Utf8 => Value::Utf8(array.as_string::<i32>().value(i).to_string()),
            ArrowType::LargeUtf8 => Value::Utf8(array.as_string::<i64>().value(i).to_string()),
            ArrowType::Date32 => date_from_days(array.as_primitive::<Date32Type>().value(i))
                .map(Value::Date)
                .unwrap_or(Value::Null),
            ArrowType::Timestamp(TimeUnit::Second, _) => {
                timestamp(array.as_primitive::<TimestampSecondType>().value(i), 1)
            },
            ArrowType::Timestamp(TimeUnit::Millisecond, _) => {
                timestamp(array.as_primitive::<TimestampMillisecondType>().value(i), 1_000)
            },
            ArrowType::Timestamp(TimeUnit::Microsecond, _) => {
                timestamp(array.as_primitive::<TimestampMicrosecondType>().value(i), 1_000_000)
            },
            ArrowType::Timestamp(TimeUnit::Nanosecond, _) => {
                timestamp(array.as_primitive::<TimestampNanosecondType>().value(i), 1_000_000_000)
            },
            _ => Value::Null,
        }
    };

    Ok((0..array.len())
        .map(|i| if array.is_null(i) { Value::Null } else { value_at(i) })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Batch {
        let schema = Schema::new(vec![
            Column::new("id", DataType::Int64),
            Column::new("name", DataType::Utf8),
            Column::new("score", DataType::Float64),
            Column::new("active", DataType::Boolean),
            Column::new("ingestion_date", DataType::Date),
            Column::new("ingestion_timestamp", DataType::Timestamp),
        ]);
        let ts = DateTime::parse_from_rfc3339("2025-11-20T06:30:00.250Z")
            .unwrap()
            .with_timezone(&Utc);
        let date = NaiveDate::from_ymd_opt(2025, 11, 20).unwrap();
        Batch::try_new(
            schema,
            vec![
                vec![
                    Value::Int64(1),
                    Value::Utf8("Ada".into()),
                    Value::Float64(2.5),
                    Value::Boolean(true),
                    Value::Date(date),
                    Value::Timestamp(ts),
                ],
                vec![
                    Value::Int64(2),
                    Value::Null,
                    Value::Null,
                    Value::Boolean(false),
                    Value::Date(date),
                    Value::Timestamp(ts),
                ],
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_encode_decode_preserves_values() {
        let batch = sample();
        let bytes = encode(&batch).unwrap();
        assert_eq!(&bytes[..4], b"PAR1");
        assert_eq!(decode(bytes).unwrap(), batch);
    }

    #[test]
    fn test_read_schema_from_footer() {
        let bytes = encode(&sample()).unwrap();
        let schema = read_schema(&bytes).unwrap();
        assert_eq!(schema, sample().schema().clone());

        let needed = footer_len(&bytes).unwrap() + TRAILER_LEN;
        let tail = &bytes[bytes.len() - needed..];
        assert_eq!(read_schema(tail).unwrap(), schema);
        assert!(read_schema(&tail[1..]).is_err());
        assert!(footer_len(b"not parquet").is_err());
    }

    #[test]
    fn test_empty_batch_encodes_schema() {
        let empty = Batch::empty(sample().schema().clone());
        let decoded = decode(encode(&empty).unwrap()).unwrap();
        assert!(decoded.is_empty());
        assert_eq!(decoded.schema().len(), 6);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(decode(b"not parquet".to_vec()).is_err());
    }
}
