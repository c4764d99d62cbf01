//! Receiver role (one per node)
//!
//! A Receiver asks the Distributor for work packages and hands each one to
//! an idle local worker. It only asks for a package once a worker has
//! reported `OK`, so a package is never taken from the store while no
//! worker is ready for it.
//!
//! ```text
//!   Distributor            Receiver                 Worker
//!       │                     │ ◄──── status OK ──────│
//!       │ ◄──── status OK ────│                       │
//!       │ ──── Continue ────► │                       │
//!       │ ──── payload ─────► │                       │
//!       │ ──── count ───────► │ ──── Continue ──────► │
//!       │                     │ ──── count ─────────► │
//!       │                     │ ──── payload ───────► │
//! ```

use super::pool::WorkerPool;
use crate::config::Resources;
use crate::error::{DistError, JobError, Result, SupervisorError};
use crate::logsheet::{task_suffix, LogSheet};
use crate::package::WorkPackage;
use crate::process::WorkerHandle;
use crate::processor::WorkPackageProcessor;
use crate::protocol::{decode_count, encode_count, TaskCommand, TaskStatus};
use crate::signals::ExitFlags;
use crate::transport::{Source, Tag, Transport};
use nix::sys::signal::Signal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Wait for a worker status before checking exit flags again
const DISPATCH_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Wait for a worker status during shutdown
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How a Receiver ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverOutcome {
    /// Final status sent to the Distributor
    pub status: TaskStatus,
    pub reason: String,
    pub packages: u64,
    pub workers_started: usize,
}

/// Why no worker could be reserved
enum ReserveError {
    NoWorkers,
    TerminateJob(WorkerHandle),
    Supervisor(SupervisorError),
    Job(DistError),
}

impl From<DistError> for ReserveError {
    fn from(e: DistError) -> Self {
        ReserveError::Job(e)
    }
}

/// One Receiver rank
pub struct Receiver<T: Transport, P: WorkerPool> {
    transport: T,
    pool: P,
    processor: Box<dyn WorkPackageProcessor>,
    resources: Resources,
    flags: ExitFlags,
    log: Arc<LogSheet>,
    /// Worker whose `OK` was consumed but has no package yet
    reserved: Option<WorkerHandle>,
    packages: u64,
    workers_started: usize,
}

impl<T: Transport, P: WorkerPool> Receiver<T, P> {
    pub fn new(
        transport: T,
        pool: P,
        processor: Box<dyn WorkPackageProcessor>,
        resources: Resources,
        flags: ExitFlags,
    ) -> Self {
        Self {
            transport,
            pool,
            processor,
            resources,
            flags,
            log: Arc::new(LogSheet::disabled()),
            reserved: None,
            packages: 0,
            workers_started: 0,
        }
    }

    /// Run the Receiver until the Distributor ends the job
    pub fn start(mut self) -> Result<ReceiverOutcome> {
        let rank = self.transport.rank();
        self.transport.barrier()?;

        let ready = self.transport.recv(Source::Rank(0), Tag::Control)?;
        if TaskStatus::from_wire(&ready.payload)? != TaskStatus::Ok {
            self.send_status(TaskStatus::Ok)?;
            return self.shutdown(TaskStatus::Ok, "Distributor says abort");
        }

        match LogSheet::open(&self.resources.logsheet_url, &task_suffix(rank)) {
            Ok(log) => self.log = Arc::new(log),
            Err(e) => {
                error!(rank, error = %e, "Cannot open log sheet");
                self.send_status(TaskStatus::Failed)?;
                return self.shutdown(TaskStatus::Failed, "Failed to open log sheet");
            }
        }

        if let Err(e) = self.processor.perform_initialization(&self.log) {
            error!(rank, error = %e, "Processor initialization failed");
            self.log
                .write_debug(&format!("performInitialization failed: {}", e));
            self.send_status(TaskStatus::Failed)?;
            return self.shutdown(TaskStatus::Failed, "Failed performInitialization");
        }

        self.workers_started = self.pool.start_workers(self.resources.workers_per_node);
        if self.workers_started == 0 {
            error!(rank, "{}", JobError::NoWorkers);
            self.send_status(TaskStatus::Failed)?;
            return self.shutdown(TaskStatus::Failed, "No workers");
        }
        info!(rank, workers = self.workers_started, "Workers started");
        self.log
            .write_debug(&format!("Started {} workers", self.workers_started));

        self.send_status(TaskStatus::Ok)?;
        let (status, reason) = self.request_work_packages()?;
        self.shutdown(status, reason)
    }

    fn send_status(&self, status: TaskStatus) -> Result<()> {
        self.transport.send(0, Tag::Control, &status.to_wire())?;
        Ok(())
    }

    fn request_work_packages(&mut self) -> Result<(TaskStatus, &'static str)> {
        loop {
            self.poll_out_of_band()?;
            if let Some(end) = self.check_local_exit()? {
                return Ok(end);
            }

            let worker = match self.reserve_worker() {
                Ok(Some(worker)) => worker,
                Ok(None) => continue,
                Err(ReserveError::Job(e)) => return Err(e),
                Err(ReserveError::TerminateJob(worker)) => {
                    warn!(%worker, "Worker requested job termination");
                    self.log
                        .write_debug(&format!("{} requested job termination", worker));
                    self.flags.raise_term_exit();
                    self.broadcast(Signal::SIGKILL);
                    self.send_status(TaskStatus::RequestJobTermination)?;
                    return Ok((TaskStatus::RequestJobTermination, "Job termination requested"));
                }
                Err(ReserveError::NoWorkers) => {
                    error!("No workers remain");
                    self.log.write_debug("No workers remain");
                    self.send_status(TaskStatus::Failed)?;
                    return Ok((TaskStatus::Failed, "No workers"));
                }
                Err(ReserveError::Supervisor(e)) => {
                    error!(error = %e, "Worker communication failed");
                    self.log
                        .write_debug(&format!("Worker communication failed: {}", e));
                    self.send_status(TaskStatus::Failed)?;
                    return Ok((TaskStatus::Failed, "Failed"));
                }
            };

            self.send_status(TaskStatus::Ok)?;
            let reply = self.transport.recv(Source::Rank(0), Tag::Control)?;
            let command = TaskCommand::from_wire(&reply.payload)?;
            if command.is_exit() {
                return Ok(self.leave_on(command));
            }
            if command == TaskCommand::Ignore {
                continue;
            }

            let data = self.transport.recv(Source::Rank(0), Tag::Data)?.payload;
            let count = decode_count(&self.transport.recv(Source::Rank(0), Tag::Data)?.payload)?;
            let package = WorkPackage::from_parts(data, count);
            self.dispatch(worker, &package);
        }
    }

    /// End the request loop on an exit command from the Distributor
    fn leave_on(&mut self, command: TaskCommand) -> (TaskStatus, &'static str) {
        match command {
            TaskCommand::QuickExit => {
                self.flags.raise_quick_exit();
                self.broadcast(Signal::SIGINT);
                (TaskStatus::Exit, "Early exit (Quick Exit command)")
            }
            TaskCommand::TermExit => {
                self.flags.raise_term_exit();
                self.broadcast(Signal::SIGKILL);
                (TaskStatus::Exit, "Early exit (Term Exit command)")
            }
            _ => (TaskStatus::Ok, "Normal end"),
        }
    }

    /// Pick up a quick or forced exit pushed by the Distributor
    fn poll_out_of_band(&mut self) -> Result<()> {
        while let Some(message) = self.transport.try_recv(Source::Rank(0), Tag::OutOfBand)? {
            let command = TaskCommand::from_wire(&message.payload)?;
            info!(%command, "Out-of-band command from distributor");
            self.log
                .write_debug(&format!("Out-of-band command: {}", command));
            self.flags.raise_for(command);
        }
        Ok(())
    }

    /// Leave the request loop if an exit flag is raised
    fn check_local_exit(&mut self) -> Result<Option<(TaskStatus, &'static str)>> {
        let reason = if self.flags.term_exit() {
            self.broadcast(Signal::SIGKILL);
            "Early exit (Term Exit signal)"
        } else if self.flags.quick_exit() {
            self.broadcast(Signal::SIGINT);
            "Early exit (Quick Exit signal)"
        } else if self.flags.exit() {
            "Early exit (Exit signal)"
        } else {
            return Ok(None);
        };
        self.send_status(TaskStatus::Exit)?;
        Ok(Some((TaskStatus::Exit, reason)))
    }

    fn broadcast(&mut self, signal: Signal) {
        if let Err(e) = self.pool.broadcast_signal(signal) {
            warn!(signal = ?signal, error = %e, "Broadcast to workers failed");
        }
    }

    /// Wait for a worker reporting `OK`
    ///
    /// Workers reporting anything else are stopped and the search moves on
    /// to the next one. Returns `Ok(None)` when an exit flag interrupted
    /// the wait.
    fn reserve_worker(&mut self) -> std::result::Result<Option<WorkerHandle>, ReserveError> {
        if let Some(worker) = self.reserved {
            return Ok(Some(worker));
        }

        loop {
            if self.pool.active_workers() == 0 {
                return Err(ReserveError::NoWorkers);
            }
            self.poll_out_of_band()?;
            if self.flags.any() {
                return Ok(None);
            }

            let (worker, message) = match self.pool.next_message(DISPATCH_POLL_INTERVAL) {
                Ok(Some(next)) => next,
                Ok(None) => continue,
                Err(e) => return Err(ReserveError::Supervisor(e)),
            };

            match TaskStatus::from_message(&message) {
                Ok(TaskStatus::Ok) => {
                    self.reserved = Some(worker);
                    return Ok(Some(worker));
                }
                Ok(TaskStatus::RequestJobTermination) => {
                    self.stop(worker);
                    return Err(ReserveError::TerminateJob(worker));
                }
                Ok(status) => {
                    warn!(%worker, %status, "Worker is done, stopping it");
                    self.log
                        .write_debug(&format!("{} reported {}", worker, status));
                    self.stop(worker);
                }
                Err(e) => {
                    warn!(%worker, error = %e, "Unreadable worker status, stopping it");
                    self.stop(worker);
                }
            }
        }
    }

    fn stop(&mut self, worker: WorkerHandle) {
        if let Err(e) = self.pool.stop_worker(worker) {
            debug!(%worker, error = %e, "Stop request failed");
        }
    }

    /// Hand a package to the reserved worker: command, count, payload
    fn dispatch(&mut self, worker: WorkerHandle, package: &WorkPackage) {
        self.reserved = None;

        match self.send_package(worker, package) {
            Ok(()) => {
                self.packages += 1;
                debug!(%worker, records = package.num_elements(), "Dispatched work package");
            }
            Err(e) => {
                warn!(%worker, records = package.num_elements(), error = %e, "Work package lost");
                self.log.write_debug(&format!(
                    "Lost work package of {} records: {}",
                    package.num_elements(),
                    e
                ));
                self.stop(worker);
            }
        }
    }

    fn send_package(
        &mut self,
        worker: WorkerHandle,
        package: &WorkPackage,
    ) -> std::result::Result<(), SupervisorError> {
        self.pool
            .send_message(worker, &TaskCommand::Continue.to_message())?;
        self.pool
            .send_message(worker, &encode_count(package.num_elements()))?;
        self.pool.send_message(worker, package.data())
    }

    /// Stop workers, clean up and report the final status
    fn shutdown(mut self, status: TaskStatus, reason: &str) -> Result<ReceiverOutcome> {
        info!(rank = self.transport.rank(), %status, reason, "Receiver shutting down");
        self.log
            .write_debug(&format!("Shutdown: {} ({})", reason, status));

        if !self.flags.term_exit() {
            if let Some(worker) = self.reserved.take() {
                self.stop(worker);
            }
            while self.pool.active_workers() > 0 {
                self.poll_out_of_band()?;
                if self.flags.term_exit() {
                    self.broadcast(Signal::SIGKILL);
                    break;
                }
                match self.pool.next_message(SHUTDOWN_POLL_INTERVAL) {
                    Ok(Some((worker, _))) => self.stop(worker),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(error = %e, "Lost contact with workers");
                        break;
                    }
                }
            }
        }
        if !self.pool.wait_for_exit(SHUTDOWN_POLL_INTERVAL) {
            debug!("Workers still exiting");
        }

        if let Err(e) = self.processor.perform_shutdown() {
            warn!(error = %e, "Processor shutdown failed");
            self.log
                .write_debug(&format!("performShutdown failed: {}", e));
        }

        self.transport.barrier()?;
        self.send_status(status)?;

        Ok(ReceiverOutcome {
            status,
            reason: reason.to_string(),
            packages: self.packages,
            workers_started: self.workers_started,
        })
    }
}
