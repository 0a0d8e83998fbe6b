//! Timestamp batching of sorted trade records

use std::iter::Peekable;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::error::{ReplayError, Result};

/// One timestamped trade entry.
///
/// Field values are kept as decoded JSON so the server can replay arbitrary
/// trade schemas without knowing the columns.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub timestamp: DateTime<Utc>,
    pub fields: Map<String, Value>,
}

/// All records sharing one exact timestamp, delivered as a single wire
/// message.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub timestamp: DateTime<Utc>,
    pub records: Vec<Record>,
}

/// Groups consecutive same-timestamp records from an already-sorted stream.
///
/// Single forward pass: a batch is yielded as soon as a record with a later
/// timestamp is seen, so the input never has to be materialized here.
/// Timestamp equality is exact, no tolerance. A timestamp regression in the
/// input yields an error and ends the stream, since continuing would corrupt
/// the grouping.
pub struct Batcher<I: Iterator<Item = Record>> {
    records: Peekable<I>,
    failed: bool,
}

impl<I: Iterator<Item = Record>> Batcher<I> {
    pub fn new(records: I) -> Self {
        Self {
            records: records.peekable(),
            failed: false,
        }
    }
}

impl<I: Iterator<Item = Record>> Iterator for Batcher<I> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        let first = self.records.next()?;
        let timestamp = first.timestamp;
        let mut records = vec![first];

        while let Some(record) = self.records.next_if(|r| r.timestamp == timestamp) {
            records.push(record);
        }

        if let Some(next) = self.records.peek() {
            if next.timestamp < timestamp {
                self.failed = true;
                return Some(Err(ReplayError::OrderingViolation {
                    previous: timestamp,
                    current: next.timestamp,
                }));
            }
        }

        Some(Ok(Batch { timestamp, records }))
    }
}
