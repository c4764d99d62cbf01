//! Line-oriented record store
//!
//! Every line of a text file (typically CSV) is one record. The key is
//! the 1-based line number in decimal, the value is the line's bytes
//! without the line terminator. Lines can be handed out in a shuffled
//! order that is fixed by a seed, so a resumed run sees the same order.

use super::{Record, RecordStore};
use crate::error::RecordStoreError;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::fs;
use std::path::{Path, PathBuf};

/// Read-only record store over the lines of one file
#[derive(Debug)]
pub struct LineRecordStore {
    path: PathBuf,
    lines: Vec<Vec<u8>>,
    /// Zero-based line indexes in distribution order
    order: Vec<usize>,
    cursor: usize,
    seed: Option<u64>,
}

impl LineRecordStore {
    /// Read all of `path`; `seed` shuffles the line order
    pub fn open(path: &Path, trim: bool, seed: Option<u64>) -> Result<Self, RecordStoreError> {
        let content = fs::read(path)
            .map_err(|e| RecordStoreError::Unavailable(format!("{}: {}", path.display(), e)))?;
        let lines = split_lines(&content, trim);

        let mut order: Vec<usize> = (0..lines.len()).collect();
        if let Some(seed) = seed {
            order.shuffle(&mut StdRng::seed_from_u64(seed));
        }

        Ok(Self {
            path: path.to_path_buf(),
            lines,
            order,
            cursor: 0,
            seed,
        })
    }

    /// Zero-based position of the next record to be read
    pub fn position(&self) -> usize {
        self.cursor
    }

    fn next_index(&mut self) -> Result<usize, RecordStoreError> {
        let index = *self
            .order
            .get(self.cursor)
            .ok_or_else(|| RecordStoreError::NotFound("end of sequence".into()))?;
        self.cursor += 1;
        Ok(index)
    }
}

fn split_lines(content: &[u8], trim: bool) -> Vec<Vec<u8>> {
    if content.is_empty() {
        return Vec::new();
    }
    let body = content.strip_suffix(b"\n").unwrap_or(content);
    body.split(|b| *b == b'\n')
        .map(|line| {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if trim {
                line.trim_ascii().to_vec()
            } else {
                line.to_vec()
            }
        })
        .collect()
}

fn line_key(index: usize) -> String {
    (index + 1).to_string()
}

impl RecordStore for LineRecordStore {
    fn count(&self) -> u64 {
        self.lines.len() as u64
    }

    fn sequence(&mut self) -> Result<Record, RecordStoreError> {
        let index = self.next_index()?;
        Ok((line_key(index), self.lines[index].clone()))
    }

    fn sequence_key(&mut self) -> Result<String, RecordStoreError> {
        self.next_index().map(line_key)
    }

    fn set_cursor_at_key(&mut self, key: &str) -> Result<(), RecordStoreError> {
        let not_found = || RecordStoreError::NotFound(key.to_string());
        let line: usize = key.parse().map_err(|_| not_found())?;
        let index = line.checked_sub(1).ok_or_else(not_found)?;
        self.cursor = self
            .order
            .iter()
            .position(|i| *i == index)
            .ok_or_else(not_found)?;
        Ok(())
    }

    fn description(&self) -> String {
        match self.seed {
            Some(seed) => format!(
                "{} ({} lines, shuffled with seed {})",
                self.path.display(),
                self.lines.len(),
                seed
            ),
            None => format!("{} ({} lines)", self.path.display(), self.lines.len()),
        }
    }

    fn random_seed(&self) -> Option<u64> {
        self.seed
    }
}
