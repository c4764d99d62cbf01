//! Built-in record processors

use super::{worker_output_path, RecordProcessor};
use crate::error::ProcessorError;
use crate::logsheet::LogSheet;
use std::fs::{self, File, OpenOptions};
use std::io::{LineWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Writes one `key<TAB>value_len` line per record
///
/// Each worker writes its own `manifest-<hostname>-<pid>.tsv` in the
/// output directory.
#[derive(Debug)]
pub struct ManifestProcessor {
    output_dir: PathBuf,
    writer: Option<LineWriter<File>>,
    records: u64,
}

impl ManifestProcessor {
    pub fn new(output_dir: PathBuf) -> Self {
        Self {
            output_dir,
            writer: None,
            records: 0,
        }
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    /// Manifest file name for the current process
    pub fn manifest_path(output_dir: &Path) -> PathBuf {
        worker_output_path(output_dir, "manifest")
    }
}

impl RecordProcessor for ManifestProcessor {
    fn perform_initialization(&mut self, log: &Arc<LogSheet>) -> Result<(), ProcessorError> {
        fs::create_dir_all(&self.output_dir).map_err(|e| {
            ProcessorError::Abort(format!("{}: {}", self.output_dir.display(), e))
        })?;
        log.write_debug(&format!("Manifests go to {}", self.output_dir.display()));
        Ok(())
    }

    fn new_processor(&self, log: Arc<LogSheet>) -> Result<Self, ProcessorError> {
        let path = Self::manifest_path(&self.output_dir);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| ProcessorError::Abort(format!("{}: {}", path.display(), e)))?;
        log.write_debug(&format!("PID {}: writing {}", std::process::id(), path.display()));

        Ok(Self {
            output_dir: self.output_dir.clone(),
            writer: Some(LineWriter::new(file)),
            records: 0,
        })
    }

    fn process_record(&mut self, key: &str, value: Option<&[u8]>) -> Result<(), ProcessorError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| ProcessorError::Abort("manifest not open".into()))?;
        let len = value.map_or(0, <[u8]>::len);
        writeln!(writer, "{}\t{}", key, len)
            .map_err(|e| ProcessorError::Abort(format!("{}: {}", key, e)))?;
        self.records += 1;
        Ok(())
    }

    fn perform_shutdown(&mut self) -> Result<(), ProcessorError> {
        if let Some(writer) = self.writer.as_mut() {
            writer
                .flush()
                .map_err(|e| ProcessorError::Abort(e.to_string()))?;
        }
        Ok(())
    }
}

/// Discards records, counting them
#[derive(Debug, Default)]
pub struct NullProcessor {
    records: u64,
}

impl NullProcessor {
    pub fn records(&self) -> u64 {
        self.records
    }
}

impl RecordProcessor for NullProcessor {
    fn new_processor(&self, _log: Arc<LogSheet>) -> Result<Self, ProcessorError> {
        Ok(Self::default())
    }

    fn process_record(&mut self, _key: &str, _value: Option<&[u8]>) -> Result<(), ProcessorError> {
        self.records += 1;
        Ok(())
    }
}
