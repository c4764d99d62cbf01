//! Error types for biodist
//!
//! One `thiserror` enum per subsystem, folded into [`DistError`] at the
//! library boundary:
//! - Configuration and properties files
//! - Message transport between ranks
//! - Worker process supervision
//! - Work package encoding
//! - Record store and processor collaborators
//! - Distributor/Receiver job roles

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for biodist
#[derive(Error, Debug)]
pub enum DistError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Properties file errors
    #[error("Properties error: {0}")]
    Properties(#[from] PropertiesError),

    /// Message transport errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Worker supervision errors
    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    /// Work package encoding errors
    #[error("Work package error: {0}")]
    Package(#[from] PackageError),

    /// Record store errors
    #[error("Record store error: {0}")]
    RecordStore(#[from] RecordStoreError),

    /// Processor collaborator errors
    #[error("Processor error: {0}")]
    Processor(#[from] ProcessorError),

    /// Log sheet errors
    #[error("Log sheet error: {0}")]
    LogSheet(#[from] LogSheetError),

    /// Checkpoint errors
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Job role errors
    #[error("Job error: {0}")]
    Job(#[from] JobError),

    /// I/O errors (file operations, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Interrupted by signal
    #[error("Operation interrupted by signal")]
    Interrupted,
}

/// Configuration and CLI errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    /// A required property is absent
    #[error("Missing required property '{0}'")]
    MissingProperty(String),

    /// A property has a value that cannot be used
    #[error("Invalid value '{value}' for '{name}': {reason}")]
    InvalidProperty {
        name: String,
        value: String,
        reason: String,
    },

    /// Path does not exist or is not accessible
    #[error("Path not accessible: {path}")]
    PathNotAccessible { path: PathBuf },

    /// Invalid CLI argument
    #[error("Invalid argument '{name}': {reason}")]
    InvalidArgument { name: String, reason: String },

    /// Properties file could not be read
    #[error("Cannot read properties from {path}: {reason}")]
    Unreadable { path: PathBuf, reason: String },
}

/// Errors from the `key = value` properties collaborator
#[derive(Error, Debug)]
pub enum PropertiesError {
    /// Key not present
    #[error("Property '{0}' not found")]
    NotFound(String),

    /// Value could not be converted
    #[error("Property '{key}' has invalid value '{value}'")]
    InvalidValue { key: String, value: String },

    /// Malformed line
    #[error("Malformed line {line} in {path}: '{content}'")]
    Malformed {
        path: PathBuf,
        line: usize,
        content: String,
    },

    /// I/O failure reading or syncing the file
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Message transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// Destination rank outside the job
    #[error("Invalid rank {rank} (job size {size})")]
    InvalidRank { rank: usize, size: usize },

    /// Destination not reachable from this rank
    #[error("Rank {from} cannot address rank {to}")]
    Unroutable { from: usize, to: usize },

    /// Peer connection closed
    #[error("Connection to rank {0} closed")]
    Disconnected(usize),

    /// Payload does not decode as the expected type
    #[error("Malformed {what} message ({len} bytes)")]
    Malformed { what: &'static str, len: usize },

    /// Unknown status/command code
    #[error("Unknown {what} code {code}")]
    UnknownCode { what: &'static str, code: i64 },

    /// Rank handshake failed
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Socket I/O
    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Worker supervision errors
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// Pid is not tracked by this supervisor
    #[error("No worker with pid {pid}")]
    NotFound { pid: i32 },

    /// Worker handle is not registered
    #[error("Unknown worker handle {0}")]
    UnknownWorker(usize),

    /// Worker already registered or already running
    #[error("Worker already exists: {0}")]
    AlreadyExists(String),

    /// Spawning the child failed
    #[error("Failed to start worker: {0}")]
    Strategy(String),

    /// Communication was not enabled when the worker started
    #[error("Worker {0} has no message channel")]
    NoChannel(usize),

    /// Pipe I/O
    #[error("Worker channel I/O error: {0}")]
    Channel(#[from] std::io::Error),

    /// Signal delivery failed
    #[error("Failed to signal pid {pid}: {reason}")]
    Signal { pid: i32, reason: String },
}

/// Work package encoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PackageError {
    /// Payload ends inside a record
    #[error("Payload truncated at offset {offset}: need {needed} more bytes")]
    Truncated { offset: usize, needed: usize },

    /// Record key is not UTF-8
    #[error("Record key at offset {offset} is not valid UTF-8")]
    InvalidKey { offset: usize },

    /// Declared element count disagrees with payload
    #[error("Package declares {declared} elements but payload holds {actual}")]
    CountMismatch { declared: u64, actual: u64 },
}

/// Record store collaborator errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordStoreError {
    /// End of sequence, or key absent
    #[error("Record not found: {0}")]
    NotFound(String),

    /// A single record could not be read
    #[error("Failed to read record '{key}': {reason}")]
    ReadFailed { key: String, reason: String },

    /// The store itself is unusable
    #[error("Record store unavailable: {0}")]
    Unavailable(String),
}

impl RecordStoreError {
    /// Check if this error only affects one record (skip and continue)
    pub fn is_recoverable(&self) -> bool {
        matches!(self, RecordStoreError::ReadFailed { .. })
    }
}

/// Processor collaborator errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessorError {
    /// Abandon the current package or record
    #[error("Processing aborted: {0}")]
    Abort(String),

    /// Terminate the whole job
    #[error("Job termination requested: {0}")]
    TerminateJob(String),
}

impl ProcessorError {
    /// Check if this error should end the whole run
    pub fn is_job_fatal(&self) -> bool {
        matches!(self, ProcessorError::TerminateJob(_))
    }
}

/// Log sheet errors
#[derive(Error, Debug)]
pub enum LogSheetError {
    /// URL scheme not supported
    #[error("Unsupported log sheet URL '{0}'")]
    UnsupportedUrl(String),

    /// File could not be created
    #[error("Cannot open log sheet {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Checkpoint save/restore errors
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// Checkpointing requested without a checkpoint path
    #[error("Checkpointing enabled but no checkpoint path configured")]
    NotConfigured,

    /// Checkpoint file unreadable or incomplete
    #[error("Checkpoint {path} unusable: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: PropertiesError,
    },

    /// Recorded key could not be located in the record store
    #[error("Cannot resume at key '{key}': {source}")]
    Reposition {
        key: String,
        #[source]
        source: RecordStoreError,
    },

    /// Recorded count exceeds the store size
    #[error("Checkpoint records {distributed} keys but store holds {total}")]
    CountOutOfRange { distributed: u64, total: u64 },

    /// The input is shuffled differently than when the checkpoint was saved
    #[error(
        "Checkpoint random seed {} does not match input random seed {}",
        seed_text(.saved),
        seed_text(.current)
    )]
    SeedMismatch {
        saved: Option<u64>,
        current: Option<u64>,
    },
}

fn seed_text(seed: &Option<u64>) -> String {
    seed.map_or_else(|| "(none)".to_string(), |s| s.to_string())
}

/// Distributor/Receiver role errors
#[derive(Error, Debug)]
pub enum JobError {
    /// No local workers are available
    #[error("No workers")]
    NoWorkers,

    /// A worker requested whole-job termination
    #[error("Job termination requested by worker {worker}")]
    TerminateJob { worker: usize },

    /// Peer sent a message that does not fit the protocol state
    #[error("Protocol violation from rank {rank}: {reason}")]
    Protocol { rank: usize, reason: String },

    /// Job requires more than one rank
    #[error("Job needs at least 2 ranks, got {0}")]
    TooFewRanks(usize),

    /// Distributor aborted the run during the handshake
    #[error("Distributor aborted the run")]
    Aborted,
}

/// Result type alias for biodist operations
pub type Result<T> = std::result::Result<T, DistError>;

/// Result type alias for supervisor operations
pub type SupervisorResult<T> = std::result::Result<T, SupervisorError>;

/// Result type alias for transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SupervisorError::NotFound { pid: 42 };
        assert_eq!(err.to_string(), "No worker with pid 42");

        let err = ConfigError::MissingProperty("Chunk Size".into());
        assert!(err.to_string().contains("Chunk Size"));
    }

    #[test]
    fn test_record_error_recoverable() {
        assert!(RecordStoreError::ReadFailed {
            key: "k".into(),
            reason: "corrupt".into()
        }
        .is_recoverable());
        assert!(!RecordStoreError::NotFound("end".into()).is_recoverable());
        assert!(!RecordStoreError::Unavailable("gone".into()).is_recoverable());
    }

    #[test]
    fn test_processor_error_job_fatal() {
        assert!(ProcessorError::TerminateJob("x".into()).is_job_fatal());
        assert!(!ProcessorError::Abort("x".into()).is_job_fatal());
    }

    #[test]
    fn test_error_conversion() {
        let err: DistError = JobError::NoWorkers.into();
        assert!(matches!(err, DistError::Job(JobError::NoWorkers)));
        assert_eq!(err.to_string(), "Job error: No workers");
    }
}
