//! CSV line processor

use super::{worker_output_path, RecordProcessor};
use crate::error::ProcessorError;
use crate::logsheet::LogSheet;
use std::fs::{File, OpenOptions};
use std::io::{LineWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

/// Splits each line into fields and writes `line<TAB>field<TAB>field...`
///
/// Expects records from a line store: the key is the line number. Empty
/// lines are skipped. Each worker writes `csv-<hostname>-<pid>.tsv`.
#[derive(Debug)]
pub struct CsvProcessor {
    output_dir: PathBuf,
    delimiter: Option<char>,
    writer: Option<LineWriter<File>>,
    lines: u64,
}

impl CsvProcessor {
    /// `delimiter` empty keeps every line as a single field
    pub fn new(output_dir: PathBuf, delimiter: &str) -> Self {
        Self {
            output_dir,
            delimiter: delimiter.chars().next(),
            writer: None,
            lines: 0,
        }
    }

    pub fn lines(&self) -> u64 {
        self.lines
    }

    fn fields<'a>(&self, line: &'a str) -> Vec<&'a str> {
        match self.delimiter {
            Some(delimiter) => line.split(delimiter).collect(),
            None => vec![line],
        }
    }
}

impl RecordProcessor for CsvProcessor {
    fn perform_initialization(&mut self, log: &Arc<LogSheet>) -> Result<(), ProcessorError> {
        std::fs::create_dir_all(&self.output_dir).map_err(|e| {
            ProcessorError::Abort(format!("{}: {}", self.output_dir.display(), e))
        })?;
        log.write_debug(&format!("CSV output goes to {}", self.output_dir.display()));
        Ok(())
    }

    fn new_processor(&self, log: Arc<LogSheet>) -> Result<Self, ProcessorError> {
        let path = worker_output_path(&self.output_dir, "csv");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| ProcessorError::Abort(format!("{}: {}", path.display(), e)))?;
        log.write_debug(&format!("PID {}: writing {}", std::process::id(), path.display()));

        Ok(Self {
            output_dir: self.output_dir.clone(),
            delimiter: self.delimiter,
            writer: Some(LineWriter::new(file)),
            lines: 0,
        })
    }

    fn process_record(&mut self, key: &str, value: Option<&[u8]>) -> Result<(), ProcessorError> {
        let line_number: u64 = key
            .parse()
            .map_err(|_| ProcessorError::Abort(format!("'{}' is not a line number", key)))?;
        let Some(value) = value else {
            return Ok(());
        };

        let line = String::from_utf8_lossy(value);
        let fields = self.fields(&line).join("\t");
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| ProcessorError::Abort("CSV output not open".into()))?;
        writeln!(writer, "{}\t{}", line_number, fields)
            .map_err(|e| ProcessorError::Abort(format!("line {}: {}", line_number, e)))?;
        self.lines += 1;
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
