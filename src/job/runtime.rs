//! Role wiring for each subcommand
//!
//! `run` puts every rank in this process: the Distributor on the calling
//! thread and one thread per Receiver, joined by a [`LocalTransport`] mesh.
//! `distribute` and `receive` run a single rank over [`TcpTransport`].
//! Worker processes re-execute this binary with the hidden `worker`
//! subcommand.

use super::checkpoint::Checkpoint;
use super::distributor::{DistributionStats, DistributionSummary, Distributor};
use super::package_worker::PackageWorker;
use super::pool::SupervisedPool;
use super::receiver::{Receiver, ReceiverOutcome};
use crate::config::{InputSource, JobArgs, Resources};
use crate::error::{DistError, JobError, Result};
use crate::logsheet::{task_suffix, worker_suffix, LogSheet};
use crate::process::{Supervisor, WorkerContext, WorkerSpec};
use crate::processor::WorkPackageProcessor;
use crate::progress::ProgressReporter;
use crate::protocol::TaskStatus;
use crate::signals::{install_exit_handlers, install_stop_handler, ExitFlags};
use crate::store::{DirectoryRecordStore, LineRecordStore, RecordStore};
use crate::transport::{LocalTransport, TcpTransport, Transport};
use crossbeam_channel::{bounded, select, tick, Sender};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Refresh interval of the progress display
const PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

/// How long a Receiver keeps retrying to reach the Distributor
const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// How worker processes are launched
#[derive(Debug, Clone)]
pub struct WorkerLaunch {
    /// Executable providing the `worker` subcommand
    pub program: PathBuf,
    pub verbose: bool,
}

impl WorkerLaunch {
    /// Launch workers from the running executable
    pub fn current_exe(verbose: bool) -> Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            verbose,
        })
    }

    /// Command line of one worker for `job`
    pub fn spec(&self, job: &JobArgs) -> WorkerSpec {
        let mut spec = WorkerSpec::new(&self.program)
            .arg("worker")
            .arg("--properties")
            .arg(&job.properties)
            .arg("--processor")
            .arg(job.processor.to_string())
            .arg("--output-dir")
            .arg(&job.output_dir);
        if self.verbose {
            spec = spec.arg("--verbose");
        }
        spec
    }
}

/// Outcome of a whole job run in one process
#[derive(Debug, Clone)]
pub struct LocalRun {
    pub summary: DistributionSummary,
    /// Receiver outcomes by rank, starting at rank 1
    pub receivers: Vec<ReceiverOutcome>,
}

/// Install SIGINT/SIGQUIT/SIGTERM handlers for this rank
pub fn install_rank_signals() -> Result<ExitFlags> {
    install_exit_handlers().map_err(|e| DistError::Io(e.into()))
}

/// Open the record source named by `resources`
pub fn open_input(resources: &Resources) -> Result<Box<dyn RecordStore>> {
    match resources.input_source()? {
        InputSource::RecordStore(path) => Ok(Box::new(DirectoryRecordStore::open(path)?)),
        InputSource::Csv(path) => {
            let seed = line_order_seed(resources);
            Ok(Box::new(LineRecordStore::open(
                path,
                resources.trim_csv_whitespace,
                seed,
            )?))
        }
    }
}

/// Seed for shuffled CSV lines
///
/// An explicit `Random Seed` wins. Otherwise a resumed run reuses the seed
/// of its checkpoint so the line order is the same as before, and a fresh
/// run draws a new one.
fn line_order_seed(resources: &Resources) -> Option<u64> {
    if !resources.randomize_lines {
        return None;
    }
    if resources.random_seed.is_some() {
        return resources.random_seed;
    }
    let saved = resources
        .checkpoint_file()
        .filter(|path| path.exists())
        .and_then(|path| match Checkpoint::load(&path) {
            Ok(checkpoint) => checkpoint.random_seed,
            Err(e) => {
                warn!(error = %e, "Cannot read seed from checkpoint");
                None
            }
        });
    let seed = saved.unwrap_or_else(rand::random);
    info!(seed, "Shuffling input lines");
    Some(seed)
}

/// Run the Distributor on rank 0 of `transport`
pub fn run_distributor<T: Transport, S: RecordStore>(
    transport: T,
    store: S,
    resources: &Resources,
    flags: ExitFlags,
    progress: bool,
) -> Result<DistributionSummary> {
    let log = Arc::new(LogSheet::open(&resources.logsheet_url, &task_suffix(0))?);
    log.write_debug(&format!("Distributing {}", store.description()));

    let mut distributor = Distributor::new(transport, store, resources, flags, log);
    let reporter = if progress {
        Some(spawn_progress(distributor.stats())?)
    } else {
        None
    };

    let result = distributor.start();

    if let Some((stop, handle, reporter)) = reporter {
        drop(stop);
        let _ = handle.join();
        match &result {
            Ok(summary) if summary.completed => reporter.finish("Distribution completed"),
            Ok(summary) => reporter.finish(summary.reason),
            Err(_) => reporter.finish_and_clear(),
        }
    }
    result
}

/// Run one Receiver rank with workers spawned from `launch`
pub fn run_receiver<T: Transport>(
    transport: T,
    resources: Resources,
    flags: ExitFlags,
    job: &JobArgs,
    launch: &WorkerLaunch,
) -> Result<ReceiverOutcome> {
    let supervisor = Supervisor::new()?;
    let pool = SupervisedPool::new(supervisor, launch.spec(job));
    let processor = job
        .processor
        .build(job.output_dir.clone(), &resources, flags.clone());

    let outcome = Receiver::new(transport, pool, processor, resources, flags).start()?;
    info!(status = %outcome.status, reason = %outcome.reason, "Receiver finished");
    Ok(outcome)
}

/// Run the whole job in this process
pub fn run_local(
    job: &JobArgs,
    receivers: usize,
    checkpoint: bool,
    progress: bool,
    launch: &WorkerLaunch,
) -> Result<LocalRun> {
    if receivers == 0 {
        return Err(JobError::TooFewRanks(1).into());
    }
    let resources = Resources::load(&job.properties, checkpoint)?;
    let store = open_input(&resources)?;
    let flags = install_rank_signals()?;

    let mut mesh = LocalTransport::mesh(receivers + 1).into_iter();
    let root = mesh.next().ok_or(JobError::TooFewRanks(0))?;

    let mut handles: Vec<JoinHandle<Result<ReceiverOutcome>>> = Vec::with_capacity(receivers);
    for transport in mesh {
        let rank = transport.rank();
        let resources = resources.clone();
        let job = job.clone();
        let launch = launch.clone();
        // Each receiver learns about exits through the protocol
        let receiver_flags = ExitFlags::new();
        let handle = thread::Builder::new()
            .name(format!("receiver-{}", rank))
            .spawn(move || run_receiver(transport, resources, receiver_flags, &job, &launch))?;
        handles.push(handle);
    }

    let summary = run_distributor(root, store, &resources, flags, progress);

    let mut outcomes = Vec::with_capacity(handles.len());
    for (index, handle) in handles.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(outcome)) => outcomes.push(outcome),
            Ok(Err(e)) => {
                error!(rank = index + 1, error = %e, "Receiver failed");
                outcomes.push(ReceiverOutcome {
                    status: TaskStatus::Failed,
                    reason: e.to_string(),
                    packages: 0,
                    workers_started: 0,
                });
            }
            Err(_) => {
                error!(rank = index + 1, "Receiver thread panicked");
                outcomes.push(ReceiverOutcome {
                    status: TaskStatus::Failed,
                    reason: "Receiver thread panicked".into(),
                    packages: 0,
                    workers_started: 0,
                });
            }
        }
    }

    Ok(LocalRun {
        summary: summary?,
        receivers: outcomes,
    })
}

/// Run rank 0 over TCP, waiting for `receivers` to connect on `listen`
pub fn run_tcp_distributor(
    properties: &Path,
    listen: &str,
    receivers: usize,
    checkpoint: bool,
    progress: bool,
) -> Result<DistributionSummary> {
    let resources = Resources::load(properties, checkpoint)?;
    let store = open_input(&resources)?;
    let flags = install_rank_signals()?;

    let transport = TcpTransport::listen(listen, receivers)?;
    run_distributor(transport, store, &resources, flags, progress)
}

/// Run one Receiver rank connected to `connect` over TCP
pub fn run_tcp_receiver(
    job: &JobArgs,
    connect: &str,
    launch: &WorkerLaunch,
) -> Result<ReceiverOutcome> {
    let resources = Resources::load(&job.properties, false)?;
    let flags = install_rank_signals()?;

    let transport = TcpTransport::connect(connect, CONNECT_TIMEOUT)?;
    run_receiver(transport, resources, flags, job, launch)
}

/// Entry point of a spawned worker process
///
/// Talks to the Receiver over stdin/stdout until stopped.
pub fn run_worker(job: &JobArgs) -> Result<TaskStatus> {
    let flags = install_exit_handlers().map_err(|e| DistError::Io(e.into()))?;
    let stop = install_stop_handler().map_err(|e| DistError::Io(e.into()))?;
    let mut ctx = WorkerContext::from_stdio(stop)?;

    let (template, log) = match worker_template(job, &flags) {
        Ok(parts) => parts,
        Err(e) => {
            error!(error = %e, "Worker cannot start");
            ctx.send_message(&TaskStatus::Failed.to_message())?;
            return Ok(TaskStatus::Failed);
        }
    };

    let processor = match template.new_processor(Arc::clone(&log)) {
        Ok(processor) => processor,
        Err(e) => {
            error!(error = %e, "Cannot create worker processor");
            log.write_debug(&format!("newProcessor failed: {}", e));
            ctx.send_message(&TaskStatus::Failed.to_message())?;
            return Ok(TaskStatus::Failed);
        }
    };

    debug!(pid = std::process::id(), "Worker started");
    Ok(PackageWorker::new(processor, flags, log).run(&mut ctx))
}

type WorkerTemplate = (Box<dyn WorkPackageProcessor>, Arc<LogSheet>);

fn worker_template(job: &JobArgs, flags: &ExitFlags) -> Result<WorkerTemplate> {
    job.validate()?;
    let resources = Resources::load(&job.properties, false)?;
    let log = Arc::new(LogSheet::open(&resources.logsheet_url, &worker_suffix())?);
    let template = job
        .processor
        .build(job.output_dir.clone(), &resources, flags.clone());
    Ok((template, log))
}

/// Refresh a progress spinner from `stats` until the returned sender is dropped
fn spawn_progress(
    stats: Arc<DistributionStats>,
) -> std::io::Result<(Sender<()>, JoinHandle<()>, Arc<ProgressReporter>)> {
    let reporter = Arc::new(ProgressReporter::new());
    reporter.set_status("Waiting for receivers...");

    let (stop_tx, stop_rx) = bounded::<()>(0);
    let thread_reporter = Arc::clone(&reporter);
    let handle = thread::Builder::new()
        .name("progress".into())
        .spawn(move || {
            let ticker = tick(PROGRESS_INTERVAL);
            loop {
                select! {
                    recv(stop_rx) -> _ => break,
                    recv(ticker) -> _ => thread_reporter.update(&stats),
                }
            }
        })?;
    Ok((stop_tx, handle, reporter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::ProcessorKind;

    #[test]
    fn test_worker_command_line() {
        let job = JobArgs {
            properties: PathBuf::from("/etc/job.properties"),
            processor: ProcessorKind::Null,
            output_dir: PathBuf::from("/tmp/out"),
        };
        let launch = WorkerLaunch {
            program: PathBuf::from("/usr/bin/biodist"),
            verbose: true,
        };

        let spec = launch.spec(&job);
        assert_eq!(spec.program(), Path::new("/usr/bin/biodist"));
        let args: Vec<String> = spec
            .arguments()
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "worker",
                "--properties",
                "/etc/job.properties",
                "--processor",
                "null",
                "--output-dir",
                "/tmp/out",
                "--verbose"
            ]
        );
    }

    fn csv_resources(dir: &Path, extra: &str) -> Resources {
        let csv = dir.join("input.csv");
        std::fs::write(&csv, "x,1\ny,2\nz,3\n").unwrap();
        let properties = dir.join("job.properties");
        std::fs::write(
            &properties,
            format!(
                "Workers Per Node = 1\nChunk Size = 2\nInput CSV = {}\nCheckpoint Path = {}\n{}",
                csv.display(),
                dir.display(),
                extra
            ),
        )
        .unwrap();
        Resources::load(&properties, true).unwrap()
    }

    #[test]
    fn test_open_csv_input() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_input(&csv_resources(dir.path(), "")).unwrap();
        assert_eq!(store.count(), 3);
        assert_eq!(store.random_seed(), None);
        assert_eq!(store.sequence().unwrap(), ("1".to_string(), b"x,1".to_vec()));
    }

    #[test]
    fn test_resumed_shuffle_reuses_checkpoint_seed() {
        let dir = tempfile::tempdir().unwrap();
        let resources = csv_resources(dir.path(), "Randomize Lines = true\n");
        Checkpoint::new("Exit signal", "2", 1, 0)
            .with_random_seed(Some(99))
            .save(&resources.checkpoint_file().unwrap())
            .unwrap();
        assert_eq!(open_input(&resources).unwrap().random_seed(), Some(99));

        let explicit = csv_resources(dir.path(), "Randomize Lines = true\nRandom Seed = 5\n");
        assert_eq!(open_input(&explicit).unwrap().random_seed(), Some(5));
    }

    #[test]
    fn test_run_local_needs_a_receiver() {
        let job = JobArgs {
            properties: PathBuf::from("/nonexistent.properties"),
            processor: ProcessorKind::Null,
            output_dir: PathBuf::from("."),
        };
        let launch = WorkerLaunch {
            program: PathBuf::from("/bin/false"),
            verbose: false,
        };
        assert!(matches!(
            run_local(&job, 0, false, false, &launch),
            Err(DistError::Job(JobError::TooFewRanks(1)))
        ));
    }
}
