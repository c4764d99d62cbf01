//! In-memory record store

use super::{Record, RecordStore};
use crate::error::RecordStoreError;
use std::collections::HashSet;

/// Ordered key/value pairs held in memory
///
/// Keys can be marked unreadable to simulate corrupt entries.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecordStore {
    records: Vec<Record>,
    unreadable: HashSet<String>,
    cursor: usize,
}

impl MemoryRecordStore {
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            records,
            unreadable: HashSet::new(),
            cursor: 0,
        }
    }

    /// Store with keys `<prefix>0000`, `<prefix>0001`, ... and values equal to the key bytes
    pub fn with_keys(prefix: &str, count: usize) -> Self {
        Self::new(
            (0..count)
                .map(|i| {
                    let key = format!("{}{:04}", prefix, i);
                    let value = key.as_bytes().to_vec();
                    (key, value)
                })
                .collect(),
        )
    }

    /// Make every read of `key` fail
    pub fn mark_unreadable(&mut self, key: &str) {
        self.unreadable.insert(key.to_string());
    }

    /// Zero-based position of the next record to be read
    pub fn position(&self) -> usize {
        self.cursor
    }

    fn advance(&mut self) -> Result<&Record, RecordStoreError> {
        let index = self.cursor;
        let record = self
            .records
            .get(index)
            .ok_or_else(|| RecordStoreError::NotFound("end of sequence".into()))?;
        self.cursor += 1;
        if self.unreadable.contains(&record.0) {
            return Err(RecordStoreError::ReadFailed {
                key: record.0.clone(),
                reason: "record is unreadable".into(),
            });
        }
        Ok(record)
    }
}

impl RecordStore for MemoryRecordStore {
    fn count(&self) -> u64 {
        self.records.len() as u64
    }

    fn sequence(&mut self) -> Result<Record, RecordStoreError> {
        self.advance().cloned()
    }

    fn sequence_key(&mut self) -> Result<String, RecordStoreError> {
        self.advance().map(|(key, _)| key.clone())
    }

    fn set_cursor_at_key(&mut self, key: &str) -> Result<(), RecordStoreError> {
        let index = self
            .records
            .iter()
            .position(|(k, _)| k == key)
            .ok_or_else(|| RecordStoreError::NotFound(key.to_string()))?;
        self.cursor = index;
        Ok(())
    }

    fn description(&self) -> String {
        format!("memory store ({} records)", self.records.len())
    }
}
