//! The Receiver's view of its local workers

use crate::error::SupervisorError;
use crate::process::{Supervisor, WorkerHandle, WorkerSpec};
use nix::sys::signal::Signal;
use std::time::Duration;
use tracing::warn;

/// Local worker pool owned by one Receiver
pub trait WorkerPool {
    /// Start `count` workers; returns how many are running afterwards
    fn start_workers(&mut self, count: usize) -> usize;

    /// Number of workers still running
    fn active_workers(&self) -> usize;

    /// Next message from any worker, waiting at most `timeout`
    fn next_message(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<(WorkerHandle, Vec<u8>)>, SupervisorError>;

    fn send_message(&mut self, worker: WorkerHandle, payload: &[u8]) -> Result<(), SupervisorError>;

    /// Ask one worker to exit; no further messages may be exchanged with it
    fn stop_worker(&mut self, worker: WorkerHandle) -> Result<(), SupervisorError>;

    fn broadcast_signal(&mut self, signal: Signal) -> Result<(), SupervisorError>;

    /// Wait for every worker to exit; true if they all did
    fn wait_for_exit(&mut self, timeout: Duration) -> bool;
}

/// Worker pool of spawned processes
pub struct SupervisedPool {
    supervisor: Supervisor,
    spec: WorkerSpec,
}

impl SupervisedPool {
    pub fn new(supervisor: Supervisor, spec: WorkerSpec) -> Self {
        Self { supervisor, spec }
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }
}

impl WorkerPool for SupervisedPool {
    fn start_workers(&mut self, count: usize) -> usize {
        self.supervisor.add_workers(&self.spec, count);
        if let Err(e) = self.supervisor.start_workers(false, true) {
            warn!(error = %e, "Not all workers started");
        }
        self.supervisor.num_active_workers()
    }

    fn active_workers(&self) -> usize {
        self.supervisor.num_active_workers()
    }

    fn next_message(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<(WorkerHandle, Vec<u8>)>, SupervisorError> {
        self.supervisor.get_next_message(Some(timeout))
    }

    fn send_message(&mut self, worker: WorkerHandle, payload: &[u8]) -> Result<(), SupervisorError> {
        self.supervisor.send_message_to_worker(worker, payload)
    }

    fn stop_worker(&mut self, worker: WorkerHandle) -> Result<(), SupervisorError> {
        self.supervisor.stop_worker(worker)
    }

    fn broadcast_signal(&mut self, signal: Signal) -> Result<(), SupervisorError> {
        self.supervisor.broadcast_signal(signal)
    }

    fn wait_for_exit(&mut self, timeout: Duration) -> bool {
        self.supervisor.wait_for_worker_exit(Some(timeout))
    }
}
