//! Worker process supervisor
//!
//! The supervisor owns a table of worker slots. Each slot holds:
//! - the spec used to spawn the worker
//! - the current pid and whether the worker is still working
//! - the last exit status
//! - the parent side of the message pipes
//!
//! Slots persist after a worker exits so the worker can be restarted.
//!
//! A background reaper thread collects exited children with
//! `waitpid(WNOHANG)`, restricted to pids this supervisor spawned, so
//! several supervisors can coexist in one process. The reaper only ever
//! flips `working` from true to false, and only after the exit callback
//! for that worker has returned, so anyone waiting on `working` also sees
//! the callback's effects.

use crate::error::{SupervisorError, SupervisorResult};
use crate::process::pipe::{poll_readable, read_message, write_message};
use crate::signals::{child_events, install_child_handler};
use crossbeam_channel::{bounded, select, tick, Sender};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use parking_lot::{Mutex, RwLock};
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How often the reaper checks for SIGCHLD deliveries
const REAP_TICK: Duration = Duration::from_millis(20);

/// Reap even without a SIGCHLD after this long
const REAP_FALLBACK: Duration = Duration::from_millis(500);

/// Definition of a worker process
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl WorkerSpec {
    pub fn new(program: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn arguments(&self) -> &[OsString] {
        &self.args
    }

    fn command(&self, communicate: bool) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stderr(Stdio::inherit())
            // Own process group: terminal signals reach only the ranks
            .process_group(0);
        if communicate {
            command.stdin(Stdio::piped()).stdout(Stdio::piped());
        } else {
            command.stdin(Stdio::null()).stdout(Stdio::inherit());
        }
        command
    }
}

/// Opaque handle to a registered worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerHandle(usize);

impl WorkerHandle {
    pub(crate) fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// How a worker process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Exited normally with a status code
    Exited(i32),
    /// Terminated by a signal
    Signaled(i32),
    /// Collected elsewhere; status unknown
    Unknown,
}

impl WorkerExit {
    pub fn success(self) -> bool {
        self == WorkerExit::Exited(0)
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerExit::Exited(code) => write!(f, "exited with status {}", code),
            WorkerExit::Signaled(signo) => match Signal::try_from(*signo) {
                Ok(signal) => write!(f, "killed by {}", signal),
                Err(_) => write!(f, "killed by signal {}", signo),
            },
            WorkerExit::Unknown => write!(f, "exited (status unknown)"),
        }
    }
}

/// Called by the reaper after a worker exits
pub type ExitCallback = Arc<dyn Fn(WorkerHandle, i32, WorkerExit) + Send + Sync>;

struct Channel {
    to_child: ChildStdin,
    from_child: ChildStdout,
}

struct WorkerSlot {
    spec: Arc<WorkerSpec>,
    pid: AtomicI32,
    working: AtomicBool,
    stop_sent: AtomicBool,
    exit: Mutex<Option<WorkerExit>>,
    channel: Mutex<Option<Channel>>,
}

impl WorkerSlot {
    fn new(spec: Arc<WorkerSpec>) -> Self {
        Self {
            spec,
            pid: AtomicI32::new(0),
            working: AtomicBool::new(false),
            stop_sent: AtomicBool::new(false),
            exit: Mutex::new(None),
            channel: Mutex::new(None),
        }
    }

    fn pid(&self) -> Option<i32> {
        match self.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    fn is_working(&self) -> bool {
        self.working.load(Ordering::SeqCst)
    }
}

struct Shared {
    slots: RwLock<Vec<Arc<WorkerSlot>>>,
    callback: RwLock<ExitCallback>,
    reap_lock: Mutex<()>,
}

impl Shared {
    /// Collect every exited child of this supervisor
    fn reap(&self) -> usize {
        let _guard = self.reap_lock.lock();
        let slots: Vec<(usize, Arc<WorkerSlot>)> = self
            .slots
            .read()
            .iter()
            .cloned()
            .enumerate()
            .filter(|(_, s)| s.is_working())
            .collect();

        let callback = Arc::clone(&self.callback.read());
        let mut reaped = 0;
        for (index, slot) in slots {
            let Some(pid) = slot.pid() else { continue };
            let exit = match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(_, code)) => WorkerExit::Exited(code),
                Ok(WaitStatus::Signaled(_, signal, _)) => WorkerExit::Signaled(signal as i32),
                Ok(_) => continue,
                Err(Errno::ECHILD) => WorkerExit::Unknown,
                Err(e) => {
                    warn!(pid, error = %e, "waitpid failed");
                    continue;
                }
            };

            *slot.exit.lock() = Some(exit);
            if slot.is_working() {
                callback(WorkerHandle(index), pid, exit);
                slot.working.store(false, Ordering::SeqCst);
                reaped += 1;
            }
        }
        reaped
    }

    fn slot(&self, handle: WorkerHandle) -> SupervisorResult<Arc<WorkerSlot>> {
        self.slots
            .read()
            .get(handle.0)
            .cloned()
            .ok_or(SupervisorError::UnknownWorker(handle.0))
    }

    fn slot_by_pid(&self, pid: i32) -> SupervisorResult<Arc<WorkerSlot>> {
        self.slots
            .read()
            .iter()
            .find(|s| s.pid() == Some(pid))
            .cloned()
            .ok_or(SupervisorError::NotFound { pid })
    }
}

struct Reaper {
    shutdown: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

/// Starts, signals, talks to and reaps worker processes
pub struct Supervisor {
    shared: Arc<Shared>,
    reaper: Reaper,
    /// Where the next message poll starts, for fairness between workers
    poll_offset: usize,
}

impl Supervisor {
    /// Create an empty supervisor and start its reaper thread
    pub fn new() -> SupervisorResult<Self> {
        install_child_handler();

        let default_callback: ExitCallback = Arc::new(|handle, pid, exit| {
            info!(worker = %handle, pid, "PID {}: {}", pid, exit);
        });
        let shared = Arc::new(Shared {
            slots: RwLock::new(Vec::new()),
            callback: RwLock::new(default_callback),
            reap_lock: Mutex::new(()),
        });

        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let reaper_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("supervisor-reaper".into())
            .spawn(move || {
                let ticker = tick(REAP_TICK);
                let mut seen = child_events();
                let mut last_reap = Instant::now();
                loop {
                    select! {
                        recv(shutdown_rx) -> _ => break,
                        recv(ticker) -> _ => {
                            let events = child_events();
                            if events != seen || last_reap.elapsed() >= REAP_FALLBACK {
                                seen = events;
                                last_reap = Instant::now();
                                reaper_shared.reap();
                            }
                        }
                    }
                }
            })
            .map_err(|e| SupervisorError::Strategy(format!("reaper thread: {}", e)))?;

        Ok(Self {
            shared,
            reaper: Reaper {
                shutdown: shutdown_tx,
                handle: Some(handle),
            },
            poll_offset: 0,
        })
    }

    /// Register a worker definition
    ///
    /// The same `Arc` cannot be registered twice.
    pub fn add_worker(&mut self, spec: Arc<WorkerSpec>) -> SupervisorResult<WorkerHandle> {
        let mut slots = self.shared.slots.write();
        if slots.iter().any(|s| Arc::ptr_eq(&s.spec, &spec)) {
            return Err(SupervisorError::AlreadyExists(format!(
                "{} is already registered",
                spec.program.display()
            )));
        }
        slots.push(Arc::new(WorkerSlot::new(spec)));
        Ok(WorkerHandle(slots.len() - 1))
    }

    /// Register `count` workers sharing one definition
    pub fn add_workers(&mut self, spec: &WorkerSpec, count: usize) -> Vec<WorkerHandle> {
        let mut slots = self.shared.slots.write();
        (0..count)
            .map(|_| {
                slots.push(Arc::new(WorkerSlot::new(Arc::new(spec.clone()))));
                WorkerHandle(slots.len() - 1)
            })
            .collect()
    }

    /// Replace the callback invoked when a worker exits
    pub fn set_exit_callback<F>(&self, callback: F)
    where
        F: Fn(WorkerHandle, i32, WorkerExit) + Send + Sync + 'static,
    {
        *self.shared.callback.write() = Arc::new(callback);
    }

    pub fn num_workers(&self) -> usize {
        self.shared.slots.read().len()
    }

    /// Number of workers still running
    pub fn num_active_workers(&self) -> usize {
        self.shared
            .slots
            .read()
            .iter()
            .filter(|s| s.is_working())
            .count()
    }

    pub fn handles(&self) -> Vec<WorkerHandle> {
        (0..self.num_workers()).map(WorkerHandle).collect()
    }

    /// Start one registered worker
    pub fn start_worker(
        &mut self,
        handle: WorkerHandle,
        wait: bool,
        communicate: bool,
    ) -> SupervisorResult<()> {
        let slot = self.shared.slot(handle)?;
        if slot.is_working() {
            return Err(SupervisorError::AlreadyExists(format!(
                "{} is still running as pid {}",
                handle,
                slot.pid().unwrap_or_default()
            )));
        }

        // Collect a previous run before the slot is reused
        self.shared.reap();

        let mut child = slot
            .spec
            .command(communicate)
            .spawn()
            .map_err(|e| SupervisorError::Strategy(format!("{}: {}", slot.spec.program.display(), e)))?;
        let pid = child.id() as i32;

        let channel = match (child.stdin.take(), child.stdout.take()) {
            (Some(to_child), Some(from_child)) => Some(Channel {
                to_child,
                from_child,
            }),
            _ => None,
        };
        *slot.channel.lock() = channel;
        *slot.exit.lock() = None;
        slot.stop_sent.store(false, Ordering::SeqCst);
        slot.pid.store(pid, Ordering::SeqCst);
        slot.working.store(true, Ordering::SeqCst);
        // The reaper owns collection from here on
        drop(child);

        debug!(worker = %handle, pid, "Started worker");
        if wait {
            while slot.is_working() {
                self.shared.reap();
                thread::sleep(REAP_TICK);
            }
        }
        Ok(())
    }

    /// Start every registered worker that is not running
    ///
    /// Returns the number started. A spawn failure stops the loop and is
    /// returned; workers started before it keep running.
    pub fn start_workers(&mut self, wait: bool, communicate: bool) -> SupervisorResult<usize> {
        let mut started = 0;
        for handle in self.handles() {
            if self.is_working(handle) {
                continue;
            }
            self.start_worker(handle, false, communicate)?;
            started += 1;
        }
        if wait {
            self.wait_for_worker_exit(None);
        }
        Ok(started)
    }

    /// Ask one worker to exit (SIGUSR1)
    ///
    /// Do not exchange further messages with the worker afterwards.
    pub fn stop_worker(&mut self, handle: WorkerHandle) -> SupervisorResult<()> {
        let slot = self.shared.slot(handle)?;
        let Some(pid) = slot.pid().filter(|_| slot.is_working()) else {
            return Ok(());
        };
        slot.stop_sent.store(true, Ordering::SeqCst);
        match kill(Pid::from_raw(pid), Signal::SIGUSR1) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(SupervisorError::Signal {
                pid,
                reason: e.to_string(),
            }),
        }
    }

    /// Send `signal` to every running worker
    pub fn broadcast_signal(&self, signal: Signal) -> SupervisorResult<()> {
        let mut first_error = None;
        for slot in self.shared.slots.read().iter().filter(|s| s.is_working()) {
            let Some(pid) = slot.pid() else { continue };
            match kill(Pid::from_raw(pid), signal) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => {
                    warn!(pid, signal = %signal, error = %e, "Failed to signal worker");
                    first_error.get_or_insert(SupervisorError::Signal {
                        pid,
                        reason: e.to_string(),
                    });
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Send one message to a worker
    pub fn send_message_to_worker(
        &mut self,
        handle: WorkerHandle,
        payload: &[u8],
    ) -> SupervisorResult<()> {
        let slot = self.shared.slot(handle)?;
        let mut channel = slot.channel.lock();
        let channel = channel
            .as_mut()
            .ok_or(SupervisorError::NoChannel(handle.0))?;
        write_message(&mut channel.to_child, payload)?;
        Ok(())
    }

    /// Read the next message from any running worker
    ///
    /// Waits at most `timeout` (forever when `None`) and returns `None`
    /// when nothing arrived. Workers that were asked to stop are skipped.
    pub fn get_next_message(
        &mut self,
        timeout: Option<Duration>,
    ) -> SupervisorResult<Option<(WorkerHandle, Vec<u8>)>> {
        let candidates: Vec<(WorkerHandle, Arc<WorkerSlot>, i32)> = {
            let slots = self.shared.slots.read();
            let count = slots.len();
            (0..count)
                .map(|i| (i + self.poll_offset) % count)
                .filter_map(|i| {
                    let slot = &slots[i];
                    if slot.stop_sent.load(Ordering::SeqCst) {
                        return None;
                    }
                    let fd = slot.channel.lock().as_ref()?.from_child.as_raw_fd();
                    Some((WorkerHandle(i), Arc::clone(slot), fd))
                })
                .collect()
        };

        let fds: Vec<_> = candidates.iter().map(|(_, _, fd)| *fd).collect();
        let ready = poll_readable(&fds, timeout)?;

        for index in ready {
            let (handle, slot, _) = &candidates[index];
            let mut guard = slot.channel.lock();
            let Some(channel) = guard.as_mut() else { continue };
            match read_message(&mut channel.from_child) {
                Ok(message) => {
                    self.poll_offset = handle.0 + 1;
                    return Ok(Some((*handle, message)));
                }
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    debug!(worker = %handle, "Worker closed its channel");
                    *guard = None;
                }
                Err(e) => return Err(SupervisorError::Channel(e)),
            }
        }
        Ok(None)
    }

    /// Wait until no worker is running, or until `timeout` elapses
    ///
    /// Returns true when all workers have exited.
    pub fn wait_for_worker_exit(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            self.shared.reap();
            if self.num_active_workers() == 0 {
                return true;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return false;
            }
            thread::sleep(REAP_TICK);
        }
    }

    /// Check if `pid` was started by this supervisor
    pub fn responsible_for(&self, pid: i32) -> bool {
        self.shared.slot_by_pid(pid).is_ok()
    }

    pub fn set_not_working(&self, pid: i32) -> SupervisorResult<()> {
        let slot = self.shared.slot_by_pid(pid)?;
        slot.working.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn set_exit_status(&self, pid: i32, exit: WorkerExit) -> SupervisorResult<()> {
        let slot = self.shared.slot_by_pid(pid)?;
        *slot.exit.lock() = Some(exit);
        Ok(())
    }

    pub fn get_is_working_status(&self, pid: i32) -> SupervisorResult<bool> {
        Ok(self.shared.slot_by_pid(pid)?.is_working())
    }

    pub fn is_working(&self, handle: WorkerHandle) -> bool {
        self.shared
            .slot(handle)
            .map(|s| s.is_working())
            .unwrap_or(false)
    }

    pub fn pid(&self, handle: WorkerHandle) -> Option<i32> {
        self.shared.slot(handle).ok()?.pid()
    }

    pub fn exit_status(&self, handle: WorkerHandle) -> Option<WorkerExit> {
        *self.shared.slot(handle).ok()?.exit.lock()
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        let _ = self.reaper.shutdown.try_send(());
        if let Some(handle) = self.reaper.handle.take() {
            let _ = handle.join();
        }
    }
}
