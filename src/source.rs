//! Trade record ingestion
//!
//! The replay core only needs "all records, sorted ascending by timestamp".
//! [`TradeSource`] is that contract; [`ParquetTradeSource`] is the shipping
//! implementation, decoding each Parquet row into the JSON field map it will
//! later carry on the wire.

use std::fs::File;
use std::path::PathBuf;

use arrow::json::ArrayWriter;
use chrono::{DateTime, NaiveDateTime, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde_json::{Map, Value};
use tracing::info;

use crate::batch::Record;
use crate::error::{ReplayError, Result};

/// Column every record must carry.
pub const TIMESTAMP_FIELD: &str = "timestamp";

pub trait TradeSource {
    /// Load every record, sorted ascending by timestamp. Records sharing a
    /// timestamp keep their source order.
    fn load(&self) -> Result<Vec<Record>>;
}

/// Reads trade records from an Apache Parquet file.
pub struct ParquetTradeSource {
    path: PathBuf,
}

impl ParquetTradeSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TradeSource for ParquetTradeSource {
    fn load(&self) -> Result<Vec<Record>> {
        let file = File::open(&self.path)?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;

        // Round-trip the columnar data through Arrow's JSON writer so the
        // rows come out exactly as they will be serialized for subscribers.
        let mut buf = Vec::new();
        {
            let mut writer = ArrayWriter::new(&mut buf);
            for batch in reader {
                writer.write(&batch?)?;
            }
            writer.finish()?;
        }

        let rows: Vec<Map<String, Value>> = if buf.is_empty() {
            Vec::new()
        } else {
            serde_json::from_slice(&buf)?
        };

        let mut records = rows
            .into_iter()
            .map(|fields| {
                let timestamp = parse_timestamp(fields.get(TIMESTAMP_FIELD))?;
                Ok(Record { timestamp, fields })
            })
            .collect::<Result<Vec<_>>>()?;

        // Stable sort keeps the file order of same-timestamp trades.
        records.sort_by_key(|r| r.timestamp);

        info!(
            path = %self.path.display(),
            records = records.len(),
            "loaded trade records"
        );
        Ok(records)
    }
}

fn parse_timestamp(value: Option<&Value>) -> Result<DateTime<Utc>> {
    let text = match value {
        Some(Value::String(s)) => s.as_str(),
        Some(other) => {
            return Err(ReplayError::Source {
                message: format!("timestamp field is not a string: {other}"),
            })
        }
        None => {
            return Err(ReplayError::Source {
                message: format!("record is missing the '{TIMESTAMP_FIELD}' field"),
            })
        }
    };

    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Ok(ts.with_timezone(&Utc));
    }

    // Timestamps without an offset are taken as UTC.
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| ReplayError::Source {
            message: format!("unparseable timestamp '{text}': {e}"),
        })
}
