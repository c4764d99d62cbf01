//! Configuration types for biodist
//!
//! This module defines:
//! - CLI argument parsing using clap derive macros
//! - Resources: the validated per-task configuration read from a
//!   properties file once at startup

use crate::error::{ConfigError, PropertiesError};
use crate::processor::ProcessorKind;
use crate::properties::PropertiesFile;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Maximum reasonable worker count per node
const MAX_WORKERS: usize = 512;

/// Default TCP port of the distributor
pub const DEFAULT_PORT: u16 = 7466;

/// Name of the checkpoint file inside the checkpoint directory
pub const CHECKPOINT_FILE_NAME: &str = "Distributor.chk";

/// Distributed record processing with supervised worker processes
#[derive(Parser, Debug, Clone)]
#[command(
    name = "biodist",
    version,
    about = "Distribute a record store across nodes and supervised worker processes",
    long_about = "Rank 0 (the distributor) splits a record store into work packages.\n\
                  Every other rank (a receiver) pulls packages and hands them to local\n\
                  worker processes. Distribution can be checkpointed and resumed.",
    after_help = "EXAMPLES:\n    \
        biodist run -P job.properties --receivers 2 --output-dir out/\n    \
        biodist distribute -P job.properties --listen 0.0.0.0:7466 --receivers 4 --checkpoint\n    \
        biodist receive -P job.properties --connect head-node:7466 --output-dir out/\n    \
        biodist show-config -P job.properties"
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Verbose output (debug logging)
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,
}

/// Subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run a whole job on this machine (distributor plus receiver ranks)
    Run {
        #[command(flatten)]
        job: JobArgs,

        /// Number of receiver ranks
        #[arg(short = 'r', long, default_value = "1", value_name = "NUM")]
        receivers: usize,

        /// Enable checkpoint/resume
        #[arg(long)]
        checkpoint: bool,

        /// Show distribution progress
        #[arg(short = 'p', long)]
        progress: bool,
    },

    /// Run rank 0 and wait for receivers over TCP
    Distribute {
        /// Properties file describing the job
        #[arg(short = 'P', long, value_name = "FILE", env = "BIODIST_PROPERTIES")]
        properties: PathBuf,

        /// Address to listen on
        #[arg(long, default_value_t = format!("0.0.0.0:{}", DEFAULT_PORT), value_name = "ADDR")]
        listen: String,

        /// Number of receiver ranks to wait for
        #[arg(short = 'r', long, value_name = "NUM")]
        receivers: usize,

        /// Enable checkpoint/resume
        #[arg(long)]
        checkpoint: bool,

        /// Show distribution progress
        #[arg(short = 'p', long)]
        progress: bool,
    },

    /// Run one receiver rank connected to a distributor over TCP
    Receive {
        #[command(flatten)]
        job: JobArgs,

        /// Distributor address
        #[arg(long, value_name = "ADDR", env = "BIODIST_DISTRIBUTOR")]
        connect: String,
    },

    /// Entry point of a spawned worker process
    #[command(hide = true)]
    Worker {
        #[command(flatten)]
        job: JobArgs,
    },

    /// Validate a properties file and print the resolved resources
    ShowConfig {
        /// Properties file describing the job
        #[arg(short = 'P', long, value_name = "FILE", env = "BIODIST_PROPERTIES")]
        properties: PathBuf,

        /// Validate checkpoint settings too
        #[arg(long)]
        checkpoint: bool,
    },
}

/// Arguments shared by every role that runs workers
#[derive(Args, Debug, Clone)]
pub struct JobArgs {
    /// Properties file describing the job
    #[arg(short = 'P', long, value_name = "FILE", env = "BIODIST_PROPERTIES")]
    pub properties: PathBuf,

    /// Record processor run by each worker
    #[arg(long, value_enum, default_value_t = ProcessorKind::Manifest)]
    pub processor: ProcessorKind,

    /// Directory for processor output
    #[arg(short = 'o', long, default_value = ".", value_name = "DIR")]
    pub output_dir: PathBuf,
}

impl JobArgs {
    /// Check that the output directory is usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.output_dir.is_dir() {
            return Err(ConfigError::PathNotAccessible {
                path: self.output_dir.clone(),
            });
        }
        Ok(())
    }
}

/// How many workers each node should start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkersPerNode {
    /// Explicit count
    Count(usize),
    /// One per logical CPU
    NumCpus,
    /// One per physical core
    NumCores,
    /// One per CPU socket
    NumSockets,
}

impl WorkersPerNode {
    /// Parse a property value (integer or NUMCPUS/NUMCORES/NUMSOCKETS)
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        let value = value.trim();
        match value.to_ascii_uppercase().as_str() {
            "NUMCPUS" => return Ok(Self::NumCpus),
            "NUMCORES" => return Ok(Self::NumCores),
            "NUMSOCKETS" => return Ok(Self::NumSockets),
            _ => {}
        }

        let count: usize = value.parse().map_err(|_| ConfigError::InvalidProperty {
            name: Resources::WORKERS_PER_NODE.into(),
            value: value.to_string(),
            reason: "expected an integer or NUMCPUS, NUMCORES, NUMSOCKETS".into(),
        })?;
        if count > MAX_WORKERS {
            return Err(ConfigError::InvalidProperty {
                name: Resources::WORKERS_PER_NODE.into(),
                value: value.to_string(),
                reason: format!("must be at most {}", MAX_WORKERS),
            });
        }
        Ok(Self::Count(count))
    }

    /// Resolve to a concrete count on this machine
    pub fn resolve(self) -> usize {
        match self {
            Self::Count(n) => n,
            Self::NumCpus => num_cpus::get(),
            Self::NumCores => num_cpus::get_physical(),
            Self::NumSockets => count_sockets(),
        }
    }
}

/// Count distinct `physical id` entries in /proc/cpuinfo
fn count_sockets() -> usize {
    std::fs::read_to_string("/proc/cpuinfo")
        .map(|info| count_sockets_in(&info))
        .unwrap_or(1)
}

fn count_sockets_in(cpuinfo: &str) -> usize {
    let ids: HashSet<&str> = cpuinfo
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            (key.trim() == "physical id").then(|| value.trim())
        })
        .collect();
    ids.len().max(1)
}

/// Validated runtime resources for one task
#[derive(Debug, Clone, Serialize)]
pub struct Resources {
    /// Worker setting as written in the properties file
    pub workers_setting: WorkersPerNode,

    /// Resolved number of workers to start on this node
    pub workers_per_node: usize,

    /// Log sheet URL (empty means no log sheet)
    pub logsheet_url: String,

    /// Whether checkpointing is enabled for this run
    pub checkpointing: bool,

    /// Directory holding the checkpoint file
    pub checkpoint_path: Option<PathBuf>,

    /// Maximum records per work package
    pub chunk_size: u64,

    /// Record store to distribute (distributor only)
    pub input_record_store: Option<PathBuf>,

    /// Send record values, not just keys
    pub include_values: bool,

    /// Text file whose lines are the records (distributor only)
    pub input_csv: Option<PathBuf>,

    /// Field separator for CSV processing; empty keeps each line whole
    pub csv_delimiter: String,

    /// Hand out CSV lines in shuffled order
    pub randomize_lines: bool,

    /// Seed for the shuffled order; generated when absent
    pub random_seed: Option<u64>,

    /// Strip leading and trailing whitespace from CSV lines
    pub trim_csv_whitespace: bool,
}

/// Where the distributor reads records from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSource<'a> {
    /// Directory of files, one record per file
    RecordStore(&'a Path),
    /// Text file, one record per line
    Csv(&'a Path),
}

impl Resources {
    pub const WORKERS_PER_NODE: &'static str = "Workers Per Node";
    pub const LOGSHEET_URL: &'static str = "Logsheet URL";
    pub const CHECKPOINT_PATH: &'static str = "Checkpoint Path";
    pub const CHUNK_SIZE: &'static str = "Chunk Size";
    pub const INPUT_RECORD_STORE: &'static str = "Input Record Store";
    pub const INCLUDE_VALUES: &'static str = "Include Values";
    pub const INPUT_CSV: &'static str = "Input CSV";
    pub const CSV_DELIMITER: &'static str = "CSV Delimiter";
    pub const RANDOMIZE_LINES: &'static str = "Randomize Lines";
    pub const RANDOM_SEED: &'static str = "Random Seed";
    pub const TRIM_CSV_WHITESPACE: &'static str = "Trim CSV Whitespace";

    /// Load and validate resources from a properties file
    pub fn load(path: &Path, checkpointing: bool) -> Result<Self, ConfigError> {
        let props = PropertiesFile::open(path).map_err(|e| ConfigError::Unreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_properties(&props, checkpointing)
    }

    /// Validate resources from already-parsed properties
    pub fn from_properties(
        props: &PropertiesFile,
        checkpointing: bool,
    ) -> Result<Self, ConfigError> {
        let workers_setting = WorkersPerNode::parse(required(props, Self::WORKERS_PER_NODE)?)?;

        let logsheet_url = optional(props, Self::LOGSHEET_URL).unwrap_or_default();

        let chunk_value = required(props, Self::CHUNK_SIZE)?;
        let chunk_size = match props.get_property_as_integer(Self::CHUNK_SIZE) {
            Ok(n) if n >= 1 => n as u64,
            _ => {
                return Err(ConfigError::InvalidProperty {
                    name: Self::CHUNK_SIZE.into(),
                    value: chunk_value.to_string(),
                    reason: "must be a positive integer".into(),
                })
            }
        };

        let checkpoint_path = optional(props, Self::CHECKPOINT_PATH).map(PathBuf::from);
        if checkpointing {
            let path = checkpoint_path
                .as_ref()
                .ok_or_else(|| ConfigError::MissingProperty(Self::CHECKPOINT_PATH.into()))?;
            if !path.is_dir() {
                return Err(ConfigError::PathNotAccessible { path: path.clone() });
            }
        }

        let input_record_store = optional(props, Self::INPUT_RECORD_STORE).map(PathBuf::from);

        let include_values = flag(props, Self::INCLUDE_VALUES, true)?;

        let input_csv = optional(props, Self::INPUT_CSV).map(PathBuf::from);
        let csv_delimiter = match props.get_property(Self::CSV_DELIMITER) {
            Ok(value) => delimiter(value)?,
            Err(_) => ",".to_string(),
        };
        let randomize_lines = flag(props, Self::RANDOMIZE_LINES, false)?;
        let random_seed = match optional(props, Self::RANDOM_SEED) {
            Some(value) => Some(value.trim().parse::<u64>().map_err(|_| {
                ConfigError::InvalidProperty {
                    name: Self::RANDOM_SEED.into(),
                    value: value.clone(),
                    reason: "expected an unsigned integer".into(),
                }
            })?),
            None => None,
        };
        let trim_csv_whitespace = flag(props, Self::TRIM_CSV_WHITESPACE, true)?;

        Ok(Self {
            workers_setting,
            workers_per_node: workers_setting.resolve(),
            logsheet_url,
            checkpointing,
            checkpoint_path,
            chunk_size,
            input_record_store,
            include_values,
            input_csv,
            csv_delimiter,
            randomize_lines,
            random_seed,
            trim_csv_whitespace,
        })
    }

    /// Full path of the checkpoint file, when checkpointing is enabled
    pub fn checkpoint_file(&self) -> Option<PathBuf> {
        if !self.checkpointing {
            return None;
        }
        self.checkpoint_path
            .as_ref()
            .map(|dir| dir.join(CHECKPOINT_FILE_NAME))
    }

    /// Record store path, required by the distributor
    pub fn record_store_path(&self) -> Result<&Path, ConfigError> {
        let path = self
            .input_record_store
            .as_deref()
            .ok_or_else(|| ConfigError::MissingProperty(Self::INPUT_RECORD_STORE.into()))?;
        if !path.exists() {
            return Err(ConfigError::PathNotAccessible {
                path: path.to_path_buf(),
            });
        }
        Ok(path)
    }

    /// The distributor's input: exactly one of the record store or the CSV file
    pub fn input_source(&self) -> Result<InputSource<'_>, ConfigError> {
        match (&self.input_record_store, &self.input_csv) {
            (Some(_), Some(_)) => Err(ConfigError::InvalidProperty {
                name: Self::INPUT_CSV.into(),
                value: self
                    .input_csv
                    .as_deref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
                reason: format!("cannot be combined with '{}'", Self::INPUT_RECORD_STORE),
            }),
            (None, Some(csv)) => {
                if !csv.is_file() {
                    return Err(ConfigError::PathNotAccessible { path: csv.clone() });
                }
                Ok(InputSource::Csv(csv))
            }
            _ => self.record_store_path().map(InputSource::RecordStore),
        }
    }
}

/// Boolean property with a default when absent
fn flag(props: &PropertiesFile, key: &str, default: bool) -> Result<bool, ConfigError> {
    match props.get_property_as_bool(key) {
        Ok(v) => Ok(v),
        Err(PropertiesError::NotFound(_)) => Ok(default),
        Err(_) => Err(ConfigError::InvalidProperty {
            name: key.into(),
            value: props.get_property(key).unwrap_or_default().into(),
            reason: "expected true or false".into(),
        }),
    }
}

/// A single delimiter character; `\t` names a tab
fn delimiter(value: &str) -> Result<String, ConfigError> {
    if value == "\\t" {
        return Ok("\t".to_string());
    }
    if value.chars().count() > 1 {
        return Err(ConfigError::InvalidProperty {
            name: Resources::CSV_DELIMITER.into(),
            value: value.to_string(),
            reason: "expected a single character".into(),
        });
    }
    Ok(value.to_string())
}

fn required<'a>(props: &'a PropertiesFile, key: &str) -> Result<&'a str, ConfigError> {
    match props.get_property(key) {
        Ok(v) if !v.is_empty() => Ok(v),
        _ => Err(ConfigError::MissingProperty(key.to_string())),
    }
}

fn optional(props: &PropertiesFile, key: &str) -> Option<String> {
    props
        .get_property(key)
        .ok()
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn props(pairs: &[(&str, &str)]) -> PropertiesFile {
        let mut props = PropertiesFile::new();
        for (k, v) in pairs {
            props.set_property(k, v);
        }
        props
    }

    #[test]
    fn test_workers_per_node_parsing() {
        assert_eq!(WorkersPerNode::parse("4").unwrap(), WorkersPerNode::Count(4));
        assert_eq!(WorkersPerNode::parse("numcpus").unwrap(), WorkersPerNode::NumCpus);
        assert_eq!(WorkersPerNode::parse("NumCores").unwrap(), WorkersPerNode::NumCores);
        assert_eq!(WorkersPerNode::parse(" NUMSOCKETS ").unwrap(), WorkersPerNode::NumSockets);
        assert!(WorkersPerNode::parse("lots").is_err());
        assert!(WorkersPerNode::parse("100000").is_err());
        assert!(WorkersPerNode::NumCpus.resolve() >= 1);
    }

    #[test]
    fn test_count_sockets() {
        let info = "processor : 0\nphysical id : 0\nprocessor : 1\nphysical id : 1\n\
                    processor : 2\nphysical id : 0\n";
        assert_eq!(count_sockets_in(info), 2);
        assert_eq!(count_sockets_in("processor : 0\n"), 1);
    }

    #[test]
    fn test_resources_minimal() {
        let resources = Resources::from_properties(
            &props(&[("Workers Per Node", "3"), ("Chunk Size", "4")]),
            false,
        )
        .unwrap();

        assert_eq!(resources.workers_per_node, 3);
        assert_eq!(resources.chunk_size, 4);
        assert!(resources.logsheet_url.is_empty());
        assert!(resources.include_values);
        assert_eq!(resources.checkpoint_file(), None);
        assert!(resources.record_store_path().is_err());
        assert!(resources.input_source().is_err());

        assert!(resources.input_csv.is_none());
        assert_eq!(resources.csv_delimiter, ",");
        assert!(!resources.randomize_lines);
        assert_eq!(resources.random_seed, None);
        assert!(resources.trim_csv_whitespace);
    }

    #[test]
    fn test_csv_properties() {
        let dir = tempdir().unwrap();
        let csv = dir.path().join("input.csv");
        std::fs::write(&csv, "a;b\n").unwrap();

        let mut base = props(&[
            ("Workers Per Node", "1"),
            ("Chunk Size", "2"),
            ("Input CSV", csv.to_str().unwrap()),
            ("CSV Delimiter", ";"),
            ("Randomize Lines", "true"),
            ("Random Seed", "42"),
            ("Trim CSV Whitespace", "false"),
        ]);
        let resources = Resources::from_properties(&base, false).unwrap();
        assert_eq!(resources.csv_delimiter, ";");
        assert!(resources.randomize_lines);
        assert_eq!(resources.random_seed, Some(42));
        assert!(!resources.trim_csv_whitespace);
        assert_eq!(resources.input_source().unwrap(), InputSource::Csv(csv.as_path()));

        base.set_property("CSV Delimiter", "\\t");
        let resources = Resources::from_properties(&base, false).unwrap();
        assert_eq!(resources.csv_delimiter, "\t");

        base.set_property("CSV Delimiter", "::");
        assert!(Resources::from_properties(&base, false).is_err());
        base.set_property("CSV Delimiter", ",");
        base.set_property("Random Seed", "-1");
        assert!(Resources::from_properties(&base, false).is_err());
        base.set_property("Random Seed", "1");

        // Only one input at a time
        base.set_property("Input Record Store", dir.path().to_str().unwrap());
        let resources = Resources::from_properties(&base, false).unwrap();
        assert!(matches!(
            resources.input_source(),
            Err(ConfigError::InvalidProperty { ref name, .. }) if name == "Input CSV"
        ));
    }

    #[test]
    fn test_resources_missing_and_invalid() {
        let err = Resources::from_properties(&props(&[("Chunk Size", "4")]), false).unwrap_err();
        assert!(matches!(err, ConfigError::MissingProperty(ref k) if k == "Workers Per Node"));

        let err = Resources::from_properties(
            &props(&[("Workers Per Node", "1"), ("Chunk Size", "0")]),
            false,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidProperty { ref name, .. } if name == "Chunk Size"));
    }

    #[test]
    fn test_checkpoint_path_required_only_when_enabled() {
        let base = props(&[("Workers Per Node", "1"), ("Chunk Size", "2")]);
        assert!(Resources::from_properties(&base, false).is_ok());
        assert!(matches!(
            Resources::from_properties(&base, true),
            Err(ConfigError::MissingProperty(_))
        ));

        let dir = tempdir().unwrap();
        let mut with_path = base.clone();
        with_path.set_property("Checkpoint Path", dir.path().to_str().unwrap());
        let resources = Resources::from_properties(&with_path, true).unwrap();
        assert_eq!(
            resources.checkpoint_file().unwrap(),
            dir.path().join("Distributor.chk")
        );
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("job.properties");
        std::fs::write(
            &path,
            "Workers Per Node = 2\nChunk Size = 16\nInclude Values = false\n\
             Logsheet URL = file:///tmp/sheet\n",
        )
        .unwrap();

        let resources = Resources::load(&path, false).unwrap();
        assert_eq!(resources.chunk_size, 16);
        assert!(!resources.include_values);
        assert_eq!(resources.logsheet_url, "file:///tmp/sheet");

        assert!(Resources::load(&dir.path().join("missing"), false).is_err());
    }
}
