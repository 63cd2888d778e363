//! Chunk payload codec.
//!
//! A payload is an opaque blob of newline-delimited JSON records. Handlers read
//! it through [`RecordStream`], which decodes one record at a time. A stream is
//! finite and forward-only; calling [`ChunkPayload::records`] again restarts
//! from the first record.

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// A single record flowing through the engine.
pub type Record = serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkPayload {
    blob: String,
}

impl ChunkPayload {
    /// Serialize records in order into a payload blob.
    pub fn encode<'a>(records: impl IntoIterator<Item = &'a Record>) -> SyncResult<Self> {
        let mut blob = String::new();
        for record in records {
            // serde_json escapes newlines inside strings, so one line == one record
            blob.push_str(&serde_json::to_string(record)?);
            blob.push('\n');
        }
        Ok(Self { blob })
    }

    /// Rebuild a payload from its persisted blob.
    pub fn from_blob(blob: impl Into<String>) -> Self {
        Self { blob: blob.into() }
    }

    pub fn as_blob(&self) -> &str {
        &self.blob
    }

    pub fn into_blob(self) -> String {
        self.blob
    }

    /// Number of records in the payload.
    pub fn len(&self) -> usize {
        self.lines().count()
    }

    pub fn is_empty(&self) -> bool {
        self.lines().next().is_none()
    }

    /// Lazily decode the records, in their original order.
    pub fn records(&self) -> RecordStream<'_> {
        RecordStream {
            lines: self.blob.lines(),
            position: 0,
        }
    }

    fn lines(&self) -> impl Iterator<Item = &str> {
        self.blob.lines().filter(|line| !line.trim().is_empty())
    }
}

/// Forward-only record iterator over a payload.
#[derive(Debug)]
pub struct RecordStream<'a> {
    lines: core::str::Lines<'a>,
    position: usize,
}

impl RecordStream<'_> {
    /// Number of records yielded so far.
    pub fn position(&self) -> usize {
        self.position
    }
}

impl Iterator for RecordStream<'_> {
    type Item = SyncResult<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = self.lines.next()?;
            if line.trim().is_empty() {
                continue;
            }
            self.position += 1;
            let position = self.position;
            return Some(serde_json::from_str(line).map_err(|e| {
                SyncError::Serialization(format!("record {position}: {e}"))
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn records_decode_in_order() {
        let records = vec![json!({"id": 1}), json!("two\nlines"), json!([3])];
        let payload = ChunkPayload::encode(&records).unwrap();

        assert_eq!(payload.len(), 3);
        let decoded: Vec<Record> = payload.records().collect::<SyncResult<_>>().unwrap();
        assert_eq!(decoded, records);
    }

    #[test]
    fn stream_restarts_from_the_beginning() {
        let payload = ChunkPayload::encode(&[json!(1), json!(2)]).unwrap();

        let mut first = payload.records();
        assert_eq!(first.next().unwrap().unwrap(), json!(1));
        assert_eq!(first.position(), 1);

        let mut second = payload.records();
        assert_eq!(second.next().unwrap().unwrap(), json!(1));
    }

    #[test]
    fn corrupt_record_reports_position() {
        let payload = ChunkPayload::from_blob("1\n{oops\n");
        let results: Vec<_> = payload.records().collect();
        assert!(results[0].is_ok());
        match &results[1] {
            Err(SyncError::Serialization(msg)) => assert!(msg.starts_with("record 2")),
            other => panic!("expected serialization error, got {other:?}"),
        }
    }

    #[test]
    fn empty_payload() {
        let payload = ChunkPayload::encode(Vec::<Record>::new().iter()).unwrap();
        assert!(payload.is_empty());
        assert_eq!(payload.records().count(), 0);
    }
}
