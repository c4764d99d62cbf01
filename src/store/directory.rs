//! Directory-backed record store
//!
//! Each regular file in the directory is one record: the file name is the
//! key and the file contents are the value. Records are visited in sorted
//! key order, fixed when the store is opened.

use super::{Record, RecordStore};
use crate::error::RecordStoreError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Read-only record store over a directory of files
#[derive(Debug)]
pub struct DirectoryRecordStore {
    root: PathBuf,
    keys: Vec<String>,
    cursor: usize,
}

impl DirectoryRecordStore {
    /// Open `root` and snapshot its sorted file names
    pub fn open(root: &Path) -> Result<Self, RecordStoreError> {
        let entries = fs::read_dir(root).map_err(|e| {
            RecordStoreError::Unavailable(format!("{}: {}", root.display(), e))
        })?;

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| {
                RecordStoreError::Unavailable(format!("{}: {}", root.display(), e))
            })?;
            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            if !is_file {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) => keys.push(name),
                Err(name) => warn!(name = ?name, "Skipping record with non-UTF-8 name"),
            }
        }
        keys.sort();

        Ok(Self {
            root: root.to_path_buf(),
            keys,
            cursor: 0,
        })
    }

    fn next_key(&mut self) -> Result<String, RecordStoreError> {
        let key = self
            .keys
            .get(self.cursor)
            .cloned()
            .ok_or_else(|| RecordStoreError::NotFound("end of sequence".into()))?;
        self.cursor += 1;
        Ok(key)
    }
}

impl RecordStore for DirectoryRecordStore {
    fn count(&self) -> u64 {
        self.keys.len() as u64
    }

    fn sequence(&mut self) -> Result<Record, RecordStoreError> {
        let key = self.next_key()?;
        match fs::read(self.root.join(&key)) {
            Ok(value) => Ok((key, value)),
            Err(e) => Err(RecordStoreError::ReadFailed {
                key,
                reason: e.to_string(),
            }),
        }
    }

    fn sequence_key(&mut self) -> Result<String, RecordStoreError> {
        self.next_key()
    }

    fn set_cursor_at_key(&mut self, key: &str) -> Result<(), RecordStoreError> {
        let index = self
            .keys
            .binary_search_by(|k| k.as_str().cmp(key))
            .map_err(|_| RecordStoreError::NotFound(key.to_string()))?;
        self.cursor = index;
        Ok(())
    }

    fn description(&self) -> String {
        format!("{} ({} records)", self.root.display(), self.keys.len())
    }
}
