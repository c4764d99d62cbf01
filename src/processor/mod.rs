//! Work package processors
//!
//! A [`WorkPackageProcessor`] does the real work on each package. The
//! Receiver keeps one instance for initialization and shutdown. Every
//! worker process builds its own instance with [`WorkPackageProcessor::new_processor`]
//! so file handles and other state are never shared between workers.
//!
//! Most processors only care about individual records; they implement
//! [`RecordProcessor`] and are wrapped in a [`RecordPackageProcessor`].

pub mod csv;
pub mod manifest;

pub use csv::CsvProcessor;
pub use manifest::{ManifestProcessor, NullProcessor};

use crate::config::Resources;
use crate::error::ProcessorError;
use crate::logsheet::LogSheet;
use crate::package::WorkPackage;
use crate::signals::ExitFlags;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Per-worker output file `<prefix>-<hostname>-<pid>.tsv` in `output_dir`
pub fn worker_output_path(output_dir: &Path, prefix: &str) -> PathBuf {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    output_dir.join(format!("{}-{}-{}.tsv", prefix, host, std::process::id()))
}

/// Processes whole work packages
pub trait WorkPackageProcessor: Send {
    /// One-time setup in the Receiver before workers start
    fn perform_initialization(&mut self, log: &Arc<LogSheet>) -> Result<(), ProcessorError>;

    /// Build the independent instance used by one worker
    fn new_processor(
        &self,
        log: Arc<LogSheet>,
    ) -> Result<Box<dyn WorkPackageProcessor>, ProcessorError>;

    /// Process every record of a package
    fn process_work_package(&mut self, package: &WorkPackage) -> Result<(), ProcessorError>;

    /// Cleanup in the Receiver after workers stop
    fn perform_shutdown(&mut self) -> Result<(), ProcessorError>;
}

/// Processes one record at a time
pub trait RecordProcessor: Send + Sized + 'static {
    fn perform_initialization(&mut self, _log: &Arc<LogSheet>) -> Result<(), ProcessorError> {
        Ok(())
    }

    fn new_processor(&self, log: Arc<LogSheet>) -> Result<Self, ProcessorError>;

    /// Process one record; `value` is `None` when the record has no value
    fn process_record(&mut self, key: &str, value: Option<&[u8]>) -> Result<(), ProcessorError>;

    fn perform_shutdown(&mut self) -> Result<(), ProcessorError> {
        Ok(())
    }
}

/// Adapts a [`RecordProcessor`] to whole packages
///
/// Stops early once QuickExit or TermExit is raised. A record that fails
/// with `Abort` is logged and skipped; `TerminateJob` ends the package.
pub struct RecordPackageProcessor<P> {
    inner: P,
    flags: ExitFlags,
    log: Option<Arc<LogSheet>>,
}

impl<P: RecordProcessor> RecordPackageProcessor<P> {
    pub fn new(inner: P, flags: ExitFlags) -> Self {
        Self {
            inner,
            flags,
            log: None,
        }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }
}

impl<P: RecordProcessor> WorkPackageProcessor for RecordPackageProcessor<P> {
    fn perform_initialization(&mut self, log: &Arc<LogSheet>) -> Result<(), ProcessorError> {
        self.log = Some(Arc::clone(log));
        self.inner.perform_initialization(log)
    }

    fn new_processor(
        &self,
        log: Arc<LogSheet>,
    ) -> Result<Box<dyn WorkPackageProcessor>, ProcessorError> {
        let inner = self.inner.new_processor(Arc::clone(&log))?;
        Ok(Box::new(RecordPackageProcessor {
            inner,
            flags: self.flags.clone(),
            log: Some(log),
        }))
    }

    fn process_work_package(&mut self, package: &WorkPackage) -> Result<(), ProcessorError> {
        for record in package.records() {
            if self.flags.quick_exit() || self.flags.term_exit() {
                break;
            }
            let record = record.map_err(|e| ProcessorError::Abort(e.to_string()))?;
            let value = (!record.value.is_empty()).then_some(record.value);
            match self.inner.process_record(record.key, value) {
                Ok(()) => {}
                Err(ProcessorError::Abort(reason)) => {
                    if let Some(log) = &self.log {
                        log.write_debug(&format!("Skipped record {}: {}", record.key, reason));
                    }
                }
                Err(fatal) => return Err(fatal),
            }
        }
        Ok(())
    }

    fn perform_shutdown(&mut self) -> Result<(), ProcessorError> {
        self.inner.perform_shutdown()
    }
}

/// Built-in processors a worker process can construct by name
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ProcessorKind {
    /// Write a key/size manifest per worker
    Manifest,
    /// Split CSV lines into tab-separated fields
    Csv,
    /// Discard all records
    Null,
}

impl ProcessorKind {
    /// Build the processor template
    pub fn build(
        self,
        output_dir: PathBuf,
        resources: &Resources,
        flags: ExitFlags,
    ) -> Box<dyn WorkPackageProcessor> {
        match self {
            ProcessorKind::Manifest => Box::new(RecordPackageProcessor::new(
                ManifestProcessor::new(output_dir),
                flags,
            )),
            ProcessorKind::Csv => Box::new(RecordPackageProcessor::new(
                CsvProcessor::new(output_dir, &resources.csv_delimiter),
                flags,
            )),
            ProcessorKind::Null => {
                Box::new(RecordPackageProcessor::new(NullProcessor::default(), flags))
            }
        }
    }
}

impl fmt::Display for ProcessorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessorKind::Manifest => write!(f, "manifest"),
            ProcessorKind::Csv => write!(f, "csv"),
            ProcessorKind::Null => write!(f, "null"),
        }
    }
}
