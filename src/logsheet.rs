//! Per-task log sheet
//!
//! A log sheet is an append-only text log opened once per task from a URL.
//! Only `file://` URLs are supported; an empty URL gives a disabled sheet.
//! File sheets get a `-<hostname>-<rank>-<pid>` suffix (workers use
//! `-<hostname>-worker-<pid>`) so concurrent tasks sharing a URL never
//! write to the same file.

use crate::error::LogSheetError;
use chrono::Local;
use parking_lot::Mutex;
use regex::Regex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, warn};

/// Regex for parsing log sheet URLs
static LOGSHEET_URL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    // Matches: file:///abs/path or file://relative/path
    Regex::new(r"^file://(.+)$").expect("Invalid log sheet URL regex")
});

/// Append-only log for one task
pub struct LogSheet {
    path: Option<PathBuf>,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl LogSheet {
    /// A sheet that discards everything
    pub fn disabled() -> Self {
        Self {
            path: None,
            writer: Mutex::new(None),
        }
    }

    /// Open the sheet named by `url`, made unique with `suffix`
    pub fn open(url: &str, suffix: &str) -> Result<Self, LogSheetError> {
        let url = url.trim();
        if url.is_empty() {
            return Ok(Self::disabled());
        }

        let caps = LOGSHEET_URL_REGEX
            .captures(url)
            .ok_or_else(|| LogSheetError::UnsupportedUrl(url.to_string()))?;
        let base = &caps[1];

        let path = PathBuf::from(format!("{}-{}", base, suffix));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| LogSheetError::Open {
                path: path.clone(),
                source,
            })?;

        debug!(path = %path.display(), "Opened log sheet");
        Ok(Self {
            path: Some(path),
            writer: Mutex::new(Some(BufWriter::new(file))),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.writer.lock().is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append one timestamped line
    ///
    /// A write failure disables the sheet for the rest of the task.
    pub fn write_debug(&self, message: &str) {
        debug!(target: "biodist::logsheet", "{}", message);

        let mut guard = self.writer.lock();
        let Some(writer) = guard.as_mut() else {
            return;
        };

        let line = format!("{} {}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"), message);
        let result = writeln!(writer, "{}", line).and_then(|_| writer.flush());
        if let Err(e) = result {
            warn!(error = %e, "Log sheet write failed, disabling log sheet");
            *guard = None;
        }
    }
}

impl std::fmt::Debug for LogSheet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSheet").field("path", &self.path).finish()
    }
}

fn host_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Suffix that identifies this task: `<hostname>-<rank>-<pid>`
pub fn task_suffix(rank: usize) -> String {
    format!("{}-{}-{}", host_name(), rank, std::process::id())
}

/// Suffix for a worker process: `<hostname>-worker-<pid>`
pub fn worker_suffix() -> String {
    format!("{}-worker-{}", host_name(), std::process::id())
}
