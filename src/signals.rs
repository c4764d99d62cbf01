//! Process-wide exit flags and signal handlers
//!
//! Three escalating shutdown levels are tracked as monotonic flags:
//!
//! | Signal  | Flag      | Meaning                                    |
//! |---------|-----------|--------------------------------------------|
//! | SIGINT  | Exit      | finish in-flight work, stop asking for more |
//! | SIGQUIT | QuickExit | interrupt workers, stop immediately        |
//! | SIGTERM | TermExit  | kill workers, no further communication     |
//!
//! Handlers only touch atomics reachable through a `OnceLock`, so they
//! never take a lock. Worker processes additionally map SIGUSR1 to their
//! "stop requested" flag, and every supervisor watches a SIGCHLD counter.

use crate::protocol::TaskCommand;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::os::raw::c_int;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Once, OnceLock};

#[derive(Debug, Default)]
struct ExitState {
    exit: AtomicBool,
    quick_exit: AtomicBool,
    term_exit: AtomicBool,
}

/// Handle to a set of exit flags
///
/// Clones share state. Flags can only be raised, never cleared.
#[derive(Debug, Clone, Default)]
pub struct ExitFlags {
    state: Arc<ExitState>,
}

static PROCESS_FLAGS: OnceLock<ExitFlags> = OnceLock::new();
static STOP_REQUESTED: OnceLock<Arc<AtomicBool>> = OnceLock::new();
static CHILD_EVENTS: AtomicU64 = AtomicU64::new(0);
static CHILD_HANDLER: Once = Once::new();

impl ExitFlags {
    /// Create an independent set of flags, all clear
    pub fn new() -> Self {
        Self::default()
    }

    /// The flags raised by this process's signal handlers
    pub fn process() -> Self {
        PROCESS_FLAGS.get_or_init(ExitFlags::new).clone()
    }

    pub fn raise_exit(&self) {
        self.state.exit.store(true, Ordering::SeqCst);
    }

    pub fn raise_quick_exit(&self) {
        self.state.quick_exit.store(true, Ordering::SeqCst);
    }

    pub fn raise_term_exit(&self) {
        self.state.term_exit.store(true, Ordering::SeqCst);
    }

    /// Raise the flag matching an exit command; other commands are ignored
    pub fn raise_for(&self, command: TaskCommand) {
        match command {
            TaskCommand::Exit => self.raise_exit(),
            TaskCommand::QuickExit => self.raise_quick_exit(),
            TaskCommand::TermExit => self.raise_term_exit(),
            TaskCommand::Continue | TaskCommand::Ignore => {}
        }
    }

    pub fn exit(&self) -> bool {
        self.state.exit.load(Ordering::SeqCst)
    }

    pub fn quick_exit(&self) -> bool {
        self.state.quick_exit.load(Ordering::SeqCst)
    }

    pub fn term_exit(&self) -> bool {
        self.state.term_exit.load(Ordering::SeqCst)
    }

    pub fn any(&self) -> bool {
        self.exit() || self.quick_exit() || self.term_exit()
    }

    /// The strongest exit command implied by the raised flags
    pub fn exit_command(&self) -> Option<TaskCommand> {
        if self.term_exit() {
            Some(TaskCommand::TermExit)
        } else if self.quick_exit() {
            Some(TaskCommand::QuickExit)
        } else if self.exit() {
            Some(TaskCommand::Exit)
        } else {
            None
        }
    }
}

extern "C" fn handle_exit_signal(signo: c_int) {
    if let Some(flags) = PROCESS_FLAGS.get() {
        match signo {
            libc::SIGINT => flags.raise_exit(),
            libc::SIGQUIT => flags.raise_quick_exit(),
            libc::SIGTERM => flags.raise_term_exit(),
            _ => {}
        }
    }
}

extern "C" fn handle_stop_signal(_signo: c_int) {
    if let Some(stop) = STOP_REQUESTED.get() {
        stop.store(true, Ordering::SeqCst);
    }
}

extern "C" fn handle_child_signal(_signo: c_int) {
    CHILD_EVENTS.fetch_add(1, Ordering::SeqCst);
}

fn install(signal: Signal, handler: extern "C" fn(c_int), flags: SaFlags) -> nix::Result<()> {
    let action = SigAction::new(SigHandler::Handler(handler), flags, SigSet::empty());
    // SAFETY: the handlers only perform atomic stores/loads on statics
    unsafe { sigaction(signal, &action) }.map(|_| ())
}

/// Route SIGINT/SIGQUIT/SIGTERM to the process exit flags
pub fn install_exit_handlers() -> nix::Result<ExitFlags> {
    let flags = ExitFlags::process();
    for signal in [Signal::SIGINT, Signal::SIGQUIT, Signal::SIGTERM] {
        install(signal, handle_exit_signal, SaFlags::SA_RESTART)?;
    }
    Ok(flags)
}

/// Route SIGUSR1 to the worker's "stop requested" flag
pub fn install_stop_handler() -> nix::Result<Arc<AtomicBool>> {
    let stop = Arc::clone(STOP_REQUESTED.get_or_init(|| Arc::new(AtomicBool::new(false))));
    install(Signal::SIGUSR1, handle_stop_signal, SaFlags::SA_RESTART)?;
    Ok(stop)
}

/// Count SIGCHLD deliveries; installed once per process
pub fn install_child_handler() {
    CHILD_HANDLER.call_once(|| {
        if let Err(e) = install(
            Signal::SIGCHLD,
            handle_child_signal,
            SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
        ) {
            tracing::warn!(error = %e, "Failed to install SIGCHLD handler, reaping on timer only");
        }
    });
}

/// Number of SIGCHLD deliveries seen so far
pub fn child_events() -> u64 {
    CHILD_EVENTS.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_start_clear() {
        let flags = ExitFlags::new();
        assert!(!flags.any());
        assert_eq!(flags.exit_command(), None);
    }

    #[test]
    fn test_flags_are_shared_and_monotonic() {
        let flags = ExitFlags::new();
        let clone = flags.clone();

        clone.raise_exit();
        assert!(flags.exit());
        assert_eq!(flags.exit_command(), Some(TaskCommand::Exit));

        flags.raise_quick_exit();
        assert_eq!(clone.exit_command(), Some(TaskCommand::QuickExit));

        flags.raise_term_exit();
        assert_eq!(clone.exit_command(), Some(TaskCommand::TermExit));
        assert!(clone.exit() && clone.quick_exit() && clone.term_exit());
    }

    #[test]
    fn test_independent_flags() {
        let a = ExitFlags::new();
        let b = ExitFlags::new();
        a.raise_term_exit();
        assert!(!b.any());
    }

    #[test]
    fn test_raise_for_command() {
        let flags = ExitFlags::new();
        flags.raise_for(TaskCommand::Ignore);
        flags.raise_for(TaskCommand::Continue);
        assert!(!flags.any());
        flags.raise_for(TaskCommand::QuickExit);
        assert!(flags.quick_exit());
        assert!(!flags.exit());
    }
}
