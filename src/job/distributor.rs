//! Distributor role (rank 0)
//!
//! Owns the record store cursor and hands out work packages to Receivers
//! on request. All packages are produced sequentially on this thread.

use super::checkpoint::Checkpoint;
use crate::config::Resources;
use crate::error::{
    CheckpointError, DistError, JobError, RecordStoreError, Result, TransportError,
    TransportResult,
};
use crate::logsheet::LogSheet;
use crate::package::WorkPackage;
use crate::protocol::{encode_count, TaskCommand, TaskStatus};
use crate::signals::ExitFlags;
use crate::store::RecordStore;
use crate::transport::{Source, Tag, Transport};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long one wait for a request may block before exit flags are rechecked
const REQUEST_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Live counters shared with the progress reporter
#[derive(Debug)]
pub struct DistributionStats {
    packages: AtomicU64,
    records: AtomicU64,
    bytes: AtomicU64,
    read_failures: AtomicU64,
    remaining: AtomicU64,
    active_tasks: AtomicU64,
    start_time: Instant,
}

impl Default for DistributionStats {
    fn default() -> Self {
        Self::new()
    }
}

impl DistributionStats {
    pub fn new() -> Self {
        Self {
            packages: AtomicU64::new(0),
            records: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            read_failures: AtomicU64::new(0),
            remaining: AtomicU64::new(0),
            active_tasks: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_package(&self, records: u64, bytes: u64) {
        self.packages.fetch_add(1, Ordering::Relaxed);
        self.records.fetch_add(records, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_read_failure(&self) {
        self.read_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_remaining(&self, remaining: u64) {
        self.remaining.store(remaining, Ordering::Relaxed);
    }

    pub fn set_active_tasks(&self, tasks: usize) {
        self.active_tasks.store(tasks as u64, Ordering::Relaxed);
    }

    pub fn packages(&self) -> u64 {
        self.packages.load(Ordering::Relaxed)
    }

    pub fn records(&self) -> u64 {
        self.records.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn read_failures(&self) -> u64 {
        self.read_failures.load(Ordering::Relaxed)
    }

    pub fn remaining(&self) -> u64 {
        self.remaining.load(Ordering::Relaxed)
    }

    pub fn active_tasks(&self) -> u64 {
        self.active_tasks.load(Ordering::Relaxed)
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Records distributed per second
    pub fn rate(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs > 0.0 {
            self.records() as f64 / secs
        } else {
            0.0
        }
    }
}

/// Result of one distribution run
#[derive(Debug, Clone)]
pub struct DistributionSummary {
    /// Why distribution ended
    pub reason: &'static str,
    /// True when every record was handed out and no exit flag was raised
    pub completed: bool,
    pub packages: u64,
    pub records: u64,
    pub bytes: u64,
    pub read_failures: u64,
    pub remaining: u64,
    /// Final status reported by each Receiver, by rank
    pub task_statuses: Vec<(usize, TaskStatus)>,
    pub duration: Duration,
}

/// Rank 0 of a job
pub struct Distributor<T: Transport, S: RecordStore> {
    transport: T,
    store: S,
    chunk_size: u64,
    include_values: bool,
    checkpoint_file: Option<PathBuf>,
    flags: ExitFlags,
    log: Arc<LogSheet>,
    total: u64,
    remaining: u64,
    last_key: Option<String>,
    skipped_after_last_key: u64,
    active: BTreeSet<usize>,
    /// Tasks whose connection went away while they still had a part in the run
    lost: BTreeSet<usize>,
    stats: Arc<DistributionStats>,
}

impl<T: Transport, S: RecordStore> Distributor<T, S> {
    pub fn new(
        transport: T,
        store: S,
        resources: &Resources,
        flags: ExitFlags,
        log: Arc<LogSheet>,
    ) -> Self {
        let total = store.count();
        let stats = Arc::new(DistributionStats::new());
        stats.set_remaining(total);
        Self {
            transport,
            store,
            chunk_size: resources.chunk_size.max(1),
            include_values: resources.include_values,
            checkpoint_file: resources.checkpoint_file(),
            flags,
            log,
            total,
            remaining: total,
            last_key: None,
            skipped_after_last_key: 0,
            active: BTreeSet::new(),
            lost: BTreeSet::new(),
            stats,
        }
    }

    pub fn stats(&self) -> Arc<DistributionStats> {
        Arc::clone(&self.stats)
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn last_key(&self) -> Option<&str> {
        self.last_key.as_deref()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Pull up to one chunk of records from the store
    ///
    /// Unreadable records are skipped, so a package may hold fewer records
    /// than the chunk size. Returns an empty package once the store is
    /// exhausted.
    pub fn create_work_package(&mut self) -> WorkPackage {
        let mut package = WorkPackage::new();
        if self.remaining == 0 {
            return package;
        }

        let target = self.remaining.min(self.chunk_size);
        self.remaining -= target;
        self.stats.set_remaining(self.remaining);

        for _ in 0..target {
            let next = if self.include_values {
                self.store.sequence()
            } else {
                self.store.sequence_key().map(|key| (key, Vec::new()))
            };
            match next {
                Ok((key, value)) => {
                    package.push_record(&key, &value);
                    self.last_key = Some(key);
                    self.skipped_after_last_key = 0;
                }
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable record");
                    self.log.write_debug(&format!("Skipping record: {}", e));
                    self.stats.record_read_failure();
                    self.skipped_after_last_key += 1;
                }
            }
        }
        package
    }

    /// Next package worth sending: skips packages where every read failed
    fn next_package(&mut self) -> WorkPackage {
        loop {
            let package = self.create_work_package();
            if !package.is_empty() || self.remaining == 0 {
                return package;
            }
        }
    }

    /// Persist distribution progress; failures are logged only
    pub fn checkpoint_save(&self, reason: &str) {
        let Some(path) = self.checkpoint_file.as_deref() else {
            return;
        };
        let Some(last_key) = self.last_key.as_deref() else {
            debug!("Nothing distributed yet, checkpoint not written");
            return;
        };

        let checkpoint = Checkpoint::new(
            reason,
            last_key,
            self.total - self.remaining,
            self.skipped_after_last_key,
        )
        .with_random_seed(self.store.random_seed());
        match checkpoint.save(path) {
            Ok(()) => debug!(path = %path.display(), last_key, reason, "Checkpoint saved"),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Checkpoint save failed");
                self.log
                    .write_debug(&format!("Checkpoint save failed: {}", e));
            }
        }
    }

    /// Resume from the checkpoint file
    ///
    /// Positions the store just past the recorded last key. Restoring the
    /// same checkpoint again gives the same cursor and remaining count.
    pub fn checkpoint_restore(&mut self) -> std::result::Result<(), CheckpointError> {
        let path = self
            .checkpoint_file
            .clone()
            .ok_or(CheckpointError::NotConfigured)?;
        let checkpoint = Checkpoint::load(&path)?;

        // Same seed on both sides, or neither side shuffled
        if checkpoint.random_seed != self.store.random_seed() {
            return Err(CheckpointError::SeedMismatch {
                saved: checkpoint.random_seed,
                current: self.store.random_seed(),
            });
        }
        if checkpoint.num_keys > self.total {
            return Err(CheckpointError::CountOutOfRange {
                distributed: checkpoint.num_keys,
                total: self.total,
            });
        }

        let reposition = |source| CheckpointError::Reposition {
            key: checkpoint.last_key.clone(),
            source,
        };
        self.store
            .set_cursor_at_key(&checkpoint.last_key)
            .map_err(reposition)?;
        for _ in 0..=checkpoint.skipped_after_last_key {
            match self.store.sequence_key() {
                Ok(_) => {}
                Err(e) if e.is_recoverable() => {}
                Err(RecordStoreError::NotFound(_)) => break,
                Err(e) => return Err(reposition(e)),
            }
        }

        self.remaining = self.total - checkpoint.num_keys;
        self.last_key = Some(checkpoint.last_key.clone());
        self.skipped_after_last_key = checkpoint.skipped_after_last_key;
        self.stats.set_remaining(self.remaining);

        info!(
            last_key = %checkpoint.last_key,
            distributed = checkpoint.num_keys,
            remaining = self.remaining,
            saved_reason = %checkpoint.reason,
            "Resuming from checkpoint"
        );
        self.log.write_debug(&format!(
            "Resumed after key {} ({} of {} keys already distributed)",
            checkpoint.last_key, checkpoint.num_keys, self.total
        ));
        Ok(())
    }

    /// Run the whole distribution: handshake, package loop, shutdown
    pub fn start(&mut self) -> Result<DistributionSummary> {
        let size = self.transport.size();
        if size < 2 {
            return Err(JobError::TooFewRanks(size).into());
        }
        let started = Instant::now();

        let resume = self.checkpoint_file.as_deref().is_some_and(Path::exists);
        let restored = if resume {
            self.checkpoint_restore()
        } else {
            Ok(())
        };

        self.transport.barrier()?;

        let ready = if restored.is_ok() {
            TaskStatus::Ok
        } else {
            TaskStatus::Failed
        };
        for task in 1..size {
            let status = match self.exchange_readiness(task, ready) {
                Ok(status) => status,
                Err(TransportError::Disconnected(_)) => {
                    self.lost.insert(task);
                    TaskStatus::Failed
                }
                Err(e) => return Err(e.into()),
            };
            debug!(task, %status, "Task ready");
            if ready == TaskStatus::Ok && status == TaskStatus::Ok {
                self.active.insert(task);
            } else if status != TaskStatus::Ok {
                warn!(task, %status, "Task failed to start");
                self.log
                    .write_debug(&format!("Task-{} failed to start: {}", task, status));
            }
        }
        self.stats.set_active_tasks(self.active.len());
        info!(tasks = self.active.len(), records = self.remaining, "Distribution started");

        if let Err(e) = restored {
            warn!(error = %e, "Checkpoint restore failed, aborting run");
            self.log
                .write_debug(&format!("Checkpoint restore failed: {}", e));
            self.shutdown(Some("Checkpoint restore failed"), started)?;
            return Err(DistError::Checkpoint(e));
        }

        self.distribute_work()?;
        self.shutdown(None, started)
    }

    fn exchange_readiness(&self, task: usize, ready: TaskStatus) -> TransportResult<TaskStatus> {
        self.transport.send(task, Tag::Control, &ready.to_wire())?;
        let reply = self.transport.recv(Source::Rank(task), Tag::Control)?;
        TaskStatus::from_wire(&reply.payload)
    }

    fn distribute_work(&mut self) -> Result<()> {
        let mut have_work = true;

        while have_work && !self.active.is_empty() {
            if self.flags.any() {
                break;
            }

            let request = match self.transport.recv_timeout(
                Source::Any,
                Tag::Control,
                Some(REQUEST_POLL_INTERVAL),
            ) {
                Ok(Some(request)) => request,
                Ok(None) => continue,
                Err(TransportError::Disconnected(task)) => {
                    self.task_lost(task);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let task = request.source;
            if !self.active.contains(&task) {
                warn!(task, "Ignoring request from inactive task");
                continue;
            }

            match TaskStatus::from_wire(&request.payload)? {
                TaskStatus::Ok => {
                    if self.flags.any() {
                        self.command_or_lose(task, TaskCommand::Ignore)?;
                        break;
                    }
                    let package = self.next_package();
                    if package.is_empty() {
                        self.command_or_lose(task, TaskCommand::Ignore)?;
                        have_work = false;
                    } else {
                        let records = package.num_elements();
                        match self.send_package(task, package) {
                            Ok(()) => self.checkpoint_save("Work package distributed"),
                            Err(DistError::Transport(TransportError::Disconnected(_))) => {
                                warn!(task, records, "Work package lost");
                                self.log.write_debug(&format!(
                                    "Work package of {} records lost with Task-{}",
                                    records, task
                                ));
                                self.task_lost(task);
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }
                TaskStatus::RequestJobTermination => {
                    self.active.remove(&task);
                    self.job_termination_requested(task);
                }
                status => {
                    info!(task, %status, "Task left the run");
                    self.log
                        .write_debug(&format!("Task-{} reported {}", task, status));
                    self.active.remove(&task);
                }
            }
            self.stats.set_active_tasks(self.active.len());
        }

        if self.flags.exit() {
            self.checkpoint_save("Exit signal");
        }

        // Receivers may be blocked waiting on workers; tell them now
        if let Some(command) = self.flags.exit_command().filter(|c| *c != TaskCommand::Exit) {
            self.send_out_of_band(command)?;
        }
        Ok(())
    }

    /// Send `command` on the out-of-band channel to every active task
    fn send_out_of_band(&mut self, command: TaskCommand) -> Result<()> {
        let tasks: Vec<usize> = self.active.iter().copied().collect();
        for task in tasks {
            match self.transport.send(task, Tag::OutOfBand, &command.to_wire()) {
                Ok(()) => {}
                Err(TransportError::Disconnected(_)) => self.task_lost(task),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// A task asked for the whole job to stop
    fn job_termination_requested(&mut self, task: usize) {
        warn!(task, "Task requested job termination");
        self.log
            .write_debug(&format!("Task-{} requested job termination", task));
        self.flags.raise_term_exit();
    }

    /// Forget a task whose connection closed
    fn task_lost(&mut self, task: usize) {
        if !self.active.remove(&task) {
            return;
        }
        warn!(task, "Lost connection to task");
        self.log
            .write_debug(&format!("Task-{} lost its connection", task));
        self.lost.insert(task);
        self.stats.set_active_tasks(self.active.len());
    }

    fn send_command(&self, task: usize, command: TaskCommand) -> Result<()> {
        self.transport
            .send(task, Tag::Control, &command.to_wire())?;
        Ok(())
    }

    /// Send a command, treating a vanished task as lost rather than fatal
    fn command_or_lose(&mut self, task: usize, command: TaskCommand) -> Result<()> {
        match self.send_command(task, command) {
            Err(DistError::Transport(TransportError::Disconnected(_))) => {
                self.task_lost(task);
                Ok(())
            }
            other => other,
        }
    }

    fn send_package(&self, task: usize, package: WorkPackage) -> Result<()> {
        let (data, count) = package.into_parts();
        self.send_command(task, TaskCommand::Continue)?;
        self.transport.send(task, Tag::Data, &data)?;
        self.transport.send(task, Tag::Data, &encode_count(count))?;
        self.stats.record_package(count, data.len() as u64);
        debug!(task, records = count, bytes = data.len(), "Sent work package");
        Ok(())
    }

    fn end_reason(&self) -> &'static str {
        match self.flags.exit_command() {
            Some(TaskCommand::TermExit) => "Termination Exit signal",
            Some(TaskCommand::QuickExit) => "Quick Exit signal",
            Some(_) => "Exit signal",
            None if self.remaining == 0 && self.lost.is_empty() => "Work completed",
            None if self.remaining == 0 => "Task lost",
            None => "No active tasks",
        }
    }

    /// Answer every active task's last request, then collect final statuses
    ///
    /// `fixed_reason` overrides the reason derived from the run's state.
    fn shutdown(
        &mut self,
        fixed_reason: Option<&'static str>,
        started: Instant,
    ) -> Result<DistributionSummary> {
        while !self.active.is_empty() {
            let request = match self.transport.recv(Source::Any, Tag::Control) {
                Ok(request) => request,
                Err(TransportError::Disconnected(task)) => {
                    self.task_lost(task);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let task = request.source;
            if !self.active.remove(&task) {
                continue;
            }
            match TaskStatus::from_wire(&request.payload)? {
                TaskStatus::Ok => {
                    let command = self.flags.exit_command().unwrap_or(TaskCommand::Exit);
                    self.command_or_lose(task, command)?;
                }
                TaskStatus::RequestJobTermination => {
                    let already = self.flags.term_exit();
                    self.job_termination_requested(task);
                    if !already {
                        self.send_out_of_band(TaskCommand::TermExit)?;
                    }
                }
                status => debug!(task, %status, "Task finished during shutdown"),
            }
        }
        self.stats.set_active_tasks(0);

        self.transport.barrier()?;

        let mut task_statuses = Vec::with_capacity(self.transport.size() - 1);
        for task in 1..self.transport.size() {
            let status = match self.transport.recv(Source::Rank(task), Tag::Control) {
                Ok(reply) => TaskStatus::from_wire(&reply.payload)?,
                Err(TransportError::Disconnected(_)) => {
                    self.lost.insert(task);
                    TaskStatus::Failed
                }
                Err(e) => return Err(e.into()),
            };
            info!(task, %status, "Final task status");
            self.log
                .write_debug(&format!("Task-{} final status: {}", task, status));
            task_statuses.push((task, status));
        }

        let reason = fixed_reason.unwrap_or_else(|| self.end_reason());
        info!(reason, "Distribution end");
        self.log.write_debug(&format!("Distribution end: {}", reason));

        let completed = self.remaining == 0 && !self.flags.any() && self.lost.is_empty();
        if completed {
            if let Some(path) = self.checkpoint_file.as_deref() {
                match fs::remove_file(path) {
                    Ok(()) => debug!(path = %path.display(), "Checkpoint removed"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!(path = %path.display(), error = %e, "Cannot remove checkpoint"),
                }
            }
        }

        Ok(DistributionSummary {
            reason,
            completed,
            packages: self.stats.packages(),
            records: self.stats.records(),
            bytes: self.stats.bytes(),
            read_failures: self.stats.read_failures(),
            remaining: self.remaining,
            task_statuses,
            duration: started.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkersPerNode;
    use crate::properties::PropertiesFile;
    use crate::store::{LineRecordStore, MemoryRecordStore};
    use crate::transport::LocalTransport;
    use std::thread;
    use tempfile::tempdir;

    fn resources(chunk: u64, checkpoint_dir: Option<&Path>) -> Resources {
        Resources {
            workers_setting: WorkersPerNode::Count(1),
            workers_per_node: 1,
            logsheet_url: String::new(),
            checkpointing: checkpoint_dir.is_some(),
            checkpoint_path: checkpoint_dir.map(Path::to_path_buf),
            chunk_size: chunk,
            input_record_store: None,
            include_values: true,
            input_csv: None,
            csv_delimiter: ",".into(),
            randomize_lines: false,
            random_seed: None,
            trim_csv_whitespace: true,
        }
    }

    fn distributor(
        store: MemoryRecordStore,
        chunk: u64,
        checkpoint_dir: Option<&Path>,
    ) -> Distributor<LocalTransport, MemoryRecordStore> {
        let transport = LocalTransport::mesh(2).remove(0);
        Distributor::new(
            transport,
            store,
            &resources(chunk, checkpoint_dir),
            ExitFlags::new(),
            Arc::new(LogSheet::disabled()),
        )
    }

    /// Startup handshake of a Receiver that is ready to work
    fn join_run(transport: &LocalTransport) {
        transport.barrier().unwrap();
        let ready = transport.recv(Source::Rank(0), Tag::Control).unwrap();
        assert_eq!(TaskStatus::from_wire(&ready.payload).unwrap(), TaskStatus::Ok);
        transport
            .send(0, Tag::Control, &TaskStatus::Ok.to_wire())
            .unwrap();
    }

    fn command_from(transport: &LocalTransport, tag: Tag) -> TaskCommand {
        let reply = transport.recv(Source::Rank(0), tag).unwrap();
        TaskCommand::from_wire(&reply.payload).unwrap()
    }

    /// A Receiver stand-in that takes packages until told to stop
    fn scripted_receiver(transport: LocalTransport, max_packages: usize) -> Vec<u64> {
        join_run(&transport);

        let mut sizes = Vec::new();
        let final_status = loop {
            if sizes.len() == max_packages {
                transport
                    .send(0, Tag::Control, &TaskStatus::Exit.to_wire())
                    .unwrap();
                break TaskStatus::Exit;
            }
            transport
                .send(0, Tag::Control, &TaskStatus::Ok.to_wire())
                .unwrap();
            let reply = transport.recv(Source::Rank(0), Tag::Control).unwrap();
            match TaskCommand::from_wire(&reply.payload).unwrap() {
                TaskCommand::Continue => {
                    let data = transport.recv(Source::Rank(0), Tag::Data).unwrap().payload;
                    let count = transport.recv(Source::Rank(0), Tag::Data).unwrap().payload;
                    let package = WorkPackage::from_parts(
                        data,
                        crate::protocol::decode_count(&count).unwrap(),
                    );
                    package.validate().unwrap();
                    sizes.push(package.num_elements());
                }
                TaskCommand::Ignore => continue,
                _ => break TaskStatus::Ok,
            }
        };

        transport.barrier().unwrap();
        transport
            .send(0, Tag::Control, &final_status.to_wire())
            .unwrap();
        sizes
    }

    #[test]
    fn test_package_sizes_follow_chunks() {
        let mut dist = distributor(MemoryRecordStore::with_keys("k", 10), 4, None);

        let sizes: Vec<u64> = (0..4)
            .map(|_| dist.create_work_package().num_elements())
            .collect();
        assert_eq!(sizes, vec![4, 4, 2, 0]);
        assert_eq!(dist.remaining(), 0);

        let empty = dist.create_work_package();
        assert!(empty.is_empty());
        assert!(empty.data().is_empty());
    }

    #[test]
    fn test_checkpoint_after_second_package() {
        let dir = tempdir().unwrap();
        let mut dist = distributor(MemoryRecordStore::with_keys("k", 10), 4, Some(dir.path()));

        dist.create_work_package();
        dist.create_work_package();
        dist.checkpoint_save("Work package distributed");

        let props = PropertiesFile::open(&dir.path().join("Distributor.chk")).unwrap();
        assert_eq!(props.get_property("Num Keys").unwrap(), "8");
        assert_eq!(props.get_property("Last Key").unwrap(), "k0007");
    }

    #[test]
    fn test_unreadable_record_is_skipped() {
        let dir = tempdir().unwrap();
        let mut store = MemoryRecordStore::with_keys("k", 10);
        store.mark_unreadable("k0003");
        let mut dist = distributor(store, 4, Some(dir.path()));

        let package = dist.create_work_package();
        assert_eq!(package.num_elements(), 3);
        let keys: Vec<String> = package
            .records()
            .map(|r| r.unwrap().key.to_string())
            .collect();
        assert_eq!(keys, vec!["k0000", "k0001", "k0002"]);
        assert_eq!(dist.last_key(), Some("k0002"));
        assert_eq!(dist.stats().read_failures(), 1);

        dist.checkpoint_save("test");
        let checkpoint = Checkpoint::load(&dir.path().join("Distributor.chk")).unwrap();
        assert_eq!(checkpoint.last_key, "k0002");
        assert_eq!(checkpoint.num_keys, 4);
        assert_eq!(checkpoint.skipped_after_last_key, 1);
    }

    #[test]
    fn test_keys_only_packages() {
        let transport = LocalTransport::mesh(2).remove(0);
        let mut res = resources(3, None);
        res.include_values = false;
        let mut dist = Distributor::new(
            transport,
            MemoryRecordStore::with_keys("k", 2),
            &res,
            ExitFlags::new(),
            Arc::new(LogSheet::disabled()),
        );

        let package = dist.create_work_package();
        for record in package.records() {
            assert!(record.unwrap().value.is_empty());
        }
    }

    #[test]
    fn test_restore_is_idempotent() {
        let dir = tempdir().unwrap();
        {
            let mut dist =
                distributor(MemoryRecordStore::with_keys("k", 10), 4, Some(dir.path()));
            dist.create_work_package();
            dist.create_work_package();
            dist.checkpoint_save("test");
        }

        let mut dist = distributor(MemoryRecordStore::with_keys("k", 10), 4, Some(dir.path()));
        dist.checkpoint_restore().unwrap();
        let first = (dist.store().position(), dist.remaining());
        dist.checkpoint_restore().unwrap();
        let second = (dist.store().position(), dist.remaining());

        assert_eq!(first, (8, 2));
        assert_eq!(first, second);

        let package = dist.create_work_package();
        let keys: Vec<String> = package
            .records()
            .map(|r| r.unwrap().key.to_string())
            .collect();
        assert_eq!(keys, vec!["k0008", "k0009"]);
    }

    #[test]
    fn test_restore_skips_trailing_unreadable_keys() {
        let dir = tempdir().unwrap();
        let mut store = MemoryRecordStore::with_keys("k", 6);
        store.mark_unreadable("k0003");
        {
            let mut dist = distributor(store.clone(), 4, Some(dir.path()));
            dist.create_work_package();
            dist.checkpoint_save("test");
        }

        let mut dist = distributor(store, 4, Some(dir.path()));
        dist.checkpoint_restore().unwrap();
        assert_eq!(dist.store().position(), 4);
        assert_eq!(dist.remaining(), 2);
    }

    #[test]
    fn test_restore_requires_matching_seed() {
        let dir = tempdir().unwrap();
        let csv = dir.path().join("input.csv");
        fs::write(&csv, "a\nb\nc\nd\n").unwrap();
        let over_lines = |seed| {
            Distributor::new(
                LocalTransport::mesh(2).remove(0),
                LineRecordStore::open(&csv, true, seed).unwrap(),
                &resources(2, Some(dir.path())),
                ExitFlags::new(),
                Arc::new(LogSheet::disabled()),
            )
        };

        let first_keys: Vec<String> = {
            let mut dist = over_lines(Some(8));
            let package = dist.create_work_package();
            dist.checkpoint_save("test");
            package.records().map(|r| r.unwrap().key.to_string()).collect()
        };

        let mut resumed = over_lines(Some(8));
        resumed.checkpoint_restore().unwrap();
        assert_eq!(resumed.remaining(), 2);
        let package = resumed.create_work_package();
        for record in package.records() {
            assert!(!first_keys.contains(&record.unwrap().key.to_string()));
        }

        for seed in [None, Some(9)] {
            assert!(matches!(
                over_lines(seed).checkpoint_restore(),
                Err(CheckpointError::SeedMismatch { .. })
            ));
        }
    }

    #[test]
    fn test_restore_with_unknown_key_fails() {
        let dir = tempdir().unwrap();
        Checkpoint::new("test", "missing", 2, 0)
            .save(&dir.path().join("Distributor.chk"))
            .unwrap();

        let mut dist = distributor(MemoryRecordStore::with_keys("k", 10), 4, Some(dir.path()));
        assert!(matches!(
            dist.checkpoint_restore(),
            Err(CheckpointError::Reposition { .. })
        ));
    }

    #[test]
    fn test_restore_count_out_of_range() {
        let dir = tempdir().unwrap();
        Checkpoint::new("test", "k0001", 50, 0)
            .save(&dir.path().join("Distributor.chk"))
            .unwrap();

        let mut dist = distributor(MemoryRecordStore::with_keys("k", 10), 4, Some(dir.path()));
        assert!(matches!(
            dist.checkpoint_restore(),
            Err(CheckpointError::CountOutOfRange { .. })
        ));
    }

    #[test]
    fn test_full_distribution_removes_checkpoint() {
        let dir = tempdir().unwrap();
        let mut mesh = LocalTransport::mesh(3);
        let second = mesh.pop().unwrap();
        let first = mesh.pop().unwrap();
        let root = mesh.pop().unwrap();

        let a = thread::spawn(move || scripted_receiver(first, usize::MAX));
        let b = thread::spawn(move || scripted_receiver(second, usize::MAX));

        let mut dist = Distributor::new(
            root,
            MemoryRecordStore::with_keys("k", 25),
            &resources(4, Some(dir.path())),
            ExitFlags::new(),
            Arc::new(LogSheet::disabled()),
        );
        let summary = dist.start().unwrap();

        let mut sizes = a.join().unwrap();
        sizes.extend(b.join().unwrap());
        assert_eq!(sizes.iter().sum::<u64>(), 25);

        assert!(summary.completed);
        assert_eq!(summary.reason, "Work completed");
        assert_eq!(summary.records, 25);
        assert_eq!(summary.packages, 7);
        assert_eq!(summary.task_statuses, vec![(1, TaskStatus::Ok), (2, TaskStatus::Ok)]);
        assert!(!dir.path().join("Distributor.chk").exists());
    }

    #[test]
    fn test_early_leave_keeps_checkpoint() {
        let dir = tempdir().unwrap();
        let mut mesh = LocalTransport::mesh(2);
        let receiver = mesh.pop().unwrap();
        let root = mesh.pop().unwrap();

        let handle = thread::spawn(move || scripted_receiver(receiver, 2));

        let mut dist = Distributor::new(
            root,
            MemoryRecordStore::with_keys("k", 40),
            &resources(4, Some(dir.path())),
            ExitFlags::new(),
            Arc::new(LogSheet::disabled()),
        );
        let summary = dist.start().unwrap();
        assert_eq!(handle.join().unwrap(), vec![4, 4]);

        // The receiver left after two packages, so the work never finished
        assert!(!summary.completed);
        assert_eq!(summary.reason, "No active tasks");
        assert_eq!(summary.task_statuses, vec![(1, TaskStatus::Exit)]);

        let checkpoint = Checkpoint::load(&dir.path().join("Distributor.chk")).unwrap();
        assert_eq!(checkpoint.num_keys, 8);
    }

    #[test]
    fn test_corrupt_checkpoint_aborts_receivers() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("Distributor.chk"), "Reason = x\n").unwrap();

        let mut mesh = LocalTransport::mesh(2);
        let receiver = mesh.pop().unwrap();
        let root = mesh.pop().unwrap();

        let handle = thread::spawn(move || {
            receiver.barrier().unwrap();
            let ready = receiver.recv(Source::Rank(0), Tag::Control).unwrap();
            receiver
                .send(0, Tag::Control, &TaskStatus::Ok.to_wire())
                .unwrap();
            receiver.barrier().unwrap();
            receiver
                .send(0, Tag::Control, &TaskStatus::Ok.to_wire())
                .unwrap();
            TaskStatus::from_wire(&ready.payload).unwrap()
        });

        let mut dist = Distributor::new(
            root,
            MemoryRecordStore::with_keys("k", 10),
            &resources(4, Some(dir.path())),
            ExitFlags::new(),
            Arc::new(LogSheet::disabled()),
        );
        assert!(matches!(dist.start(), Err(DistError::Checkpoint(_))));
        assert_eq!(handle.join().unwrap(), TaskStatus::Failed);
    }

    #[test]
    fn test_every_readable_record_is_distributed_once() {
        for records in [0usize, 1, 7, 16, 33] {
            for chunk in [1u64, 3, 16, 50] {
                let mut store = MemoryRecordStore::with_keys("k", records);
                let unreadable: Vec<String> =
                    (0..records).step_by(5).map(|i| format!("k{:04}", i)).collect();
                for key in &unreadable {
                    store.mark_unreadable(key);
                }
                let mut dist = distributor(store, chunk, None);

                let mut keys = Vec::new();
                while dist.remaining() > 0 {
                    let package = dist.create_work_package();
                    assert!(package.num_elements() <= chunk);
                    package.validate().unwrap();
                    keys.extend(package.records().map(|r| r.unwrap().key.to_string()));
                }
                assert!(dist.create_work_package().is_empty());

                let expected: Vec<String> = (0..records)
                    .map(|i| format!("k{:04}", i))
                    .filter(|k| !unreadable.contains(k))
                    .collect();
                assert_eq!(keys, expected, "{} records, chunk {}", records, chunk);
                assert_eq!(dist.stats().read_failures(), unreadable.len() as u64);
            }
        }
    }

    #[test]
    fn test_lost_receiver_does_not_stall_distribution() {
        let mut mesh = LocalTransport::mesh(3);
        let vanishing = mesh.pop().unwrap();
        let steady = mesh.pop().unwrap();
        let root = mesh.pop().unwrap();

        let a = thread::spawn(move || scripted_receiver(steady, usize::MAX));
        // Joins the run, then its connection closes without another word
        let b = thread::spawn(move || join_run(&vanishing));

        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        thread::spawn(move || {
            let mut dist = Distributor::new(
                root,
                MemoryRecordStore::with_keys("k", 10),
                &resources(4, None),
                ExitFlags::new(),
                Arc::new(LogSheet::disabled()),
            );
            let _ = done_tx.send(dist.start());
        });

        let summary = done_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("distribution stalled on a lost receiver")
            .unwrap();
        b.join().unwrap();
        assert_eq!(a.join().unwrap().iter().sum::<u64>(), 10);

        assert_eq!(
            summary.task_statuses,
            vec![(1, TaskStatus::Ok), (2, TaskStatus::Failed)]
        );
        assert!(!summary.completed);
        assert_eq!(summary.reason, "Task lost");
    }

    #[test]
    fn test_termination_request_during_shutdown() {
        let dir = tempdir().unwrap();
        let mut mesh = LocalTransport::mesh(3);
        let second = mesh.pop().unwrap();
        let first = mesh.pop().unwrap();
        let root = mesh.pop().unwrap();
        let (asked_tx, asked_rx) = crossbeam_channel::bounded::<()>(1);
        let (ignored_tx, ignored_rx) = crossbeam_channel::bounded::<()>(1);

        // Takes the only package, then asks for the job to end
        let a = thread::spawn(move || {
            join_run(&first);
            first
                .send(0, Tag::Control, &TaskStatus::Ok.to_wire())
                .unwrap();
            asked_tx.send(()).unwrap();
            assert_eq!(command_from(&first, Tag::Control), TaskCommand::Continue);
            first.recv(Source::Rank(0), Tag::Data).unwrap();
            first.recv(Source::Rank(0), Tag::Data).unwrap();

            ignored_rx.recv().unwrap();
            let terminate = TaskStatus::RequestJobTermination.to_wire();
            first.send(0, Tag::Control, &terminate).unwrap();
            first.barrier().unwrap();
            first.send(0, Tag::Control, &terminate).unwrap();
        });

        // Finds no work left, then still has a request pending at shutdown
        let b = thread::spawn(move || {
            join_run(&second);
            asked_rx.recv().unwrap();
            second
                .send(0, Tag::Control, &TaskStatus::Ok.to_wire())
                .unwrap();
            assert_eq!(command_from(&second, Tag::Control), TaskCommand::Ignore);
            ignored_tx.send(()).unwrap();

            let out_of_band = command_from(&second, Tag::OutOfBand);
            second
                .send(0, Tag::Control, &TaskStatus::Ok.to_wire())
                .unwrap();
            let last = command_from(&second, Tag::Control);
            second.barrier().unwrap();
            second
                .send(0, Tag::Control, &TaskStatus::Exit.to_wire())
                .unwrap();
            (out_of_band, last)
        });

        let mut dist = Distributor::new(
            root,
            MemoryRecordStore::with_keys("k", 2),
            &resources(4, Some(dir.path())),
            ExitFlags::new(),
            Arc::new(LogSheet::disabled()),
        );
        let summary = dist.start().unwrap();
        a.join().unwrap();
        assert_eq!(
            b.join().unwrap(),
            (TaskCommand::TermExit, TaskCommand::TermExit)
        );

        assert_eq!(summary.reason, "Termination Exit signal");
        assert!(!summary.completed);
        assert_eq!(
            summary.task_statuses,
            vec![
                (1, TaskStatus::RequestJobTermination),
                (2, TaskStatus::Exit)
            ]
        );
        let checkpoint = Checkpoint::load(&dir.path().join("Distributor.chk")).unwrap();
        assert_eq!(checkpoint.num_keys, 2);
    }

    #[test]
    fn test_single_rank_is_rejected() {
        let transport = LocalTransport::mesh(1).remove(0);
        let mut dist = Distributor::new(
            transport,
            MemoryRecordStore::with_keys("k", 1),
            &resources(1, None),
            ExitFlags::new(),
            Arc::new(LogSheet::disabled()),
        );
        assert!(matches!(
            dist.start(),
            Err(DistError::Job(JobError::TooFewRanks(1)))
        ));
    }
}
