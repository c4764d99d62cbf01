//! Child-side worker context
//!
//! A spawned worker talks to its supervisor over stdin/stdout. The
//! [`WorkerContext`] is handed to the worker's entry point explicitly and
//! holds both pipe ends plus the "stop requested" flag raised by SIGUSR1.

use crate::process::pipe::{poll_readable, read_message, write_message};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Longest single wait before the stop flag is checked again
const STOP_CHECK_INTERVAL: Duration = Duration::from_secs(3);

/// Channel and control state of one worker process
pub struct WorkerContext<R, W> {
    input: R,
    output: W,
    stop: Arc<AtomicBool>,
}

impl WorkerContext<File, File> {
    /// Take over this process's stdin/stdout as the supervisor channel
    ///
    /// Stdout is redirected to stderr afterwards so stray prints cannot
    /// corrupt the message stream.
    pub fn from_stdio(stop: Arc<AtomicBool>) -> io::Result<Self> {
        let input = File::from(io::stdin().as_fd().try_clone_to_owned()?);
        let output = File::from(io::stdout().as_fd().try_clone_to_owned()?);

        // SAFETY: dup2 on valid descriptors; fd 1 is replaced atomically
        if unsafe { libc::dup2(libc::STDERR_FILENO, libc::STDOUT_FILENO) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self::new(input, output, stop))
    }
}

impl<R: Read + AsFd, W: Write> WorkerContext<R, W> {
    pub fn new(input: R, output: W, stop: Arc<AtomicBool>) -> Self {
        Self {
            input,
            output,
            stop,
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn send_message(&mut self, payload: &[u8]) -> io::Result<()> {
        write_message(&mut self.output, payload)
    }

    /// Wait until a message can be read
    ///
    /// Returns false when the stop flag was raised or `timeout` elapsed.
    /// `None` waits until a message or a stop request arrives.
    pub fn wait_for_message(&mut self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let fd = self.input.as_fd().as_raw_fd();
        loop {
            if self.stop_requested() {
                return false;
            }
            let slice = match deadline {
                Some(d) => {
                    let left = d.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return false;
                    }
                    left.min(STOP_CHECK_INTERVAL)
                }
                None => STOP_CHECK_INTERVAL,
            };
            match poll_readable(&[fd], Some(slice)) {
                Ok(ready) if !ready.is_empty() => return !self.stop_requested(),
                Ok(_) => continue,
                Err(_) => return false,
            }
        }
    }

    pub fn receive_message(&mut self) -> io::Result<Vec<u8>> {
        read_message(&mut self.input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    fn pair() -> (WorkerContext<UnixStream, UnixStream>, UnixStream, Arc<AtomicBool>) {
        let (parent, child) = UnixStream::pair().unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let output = child.try_clone().unwrap();
        (WorkerContext::new(child, output, Arc::clone(&stop)), parent, stop)
    }

    #[test]
    fn test_send_and_receive() {
        let (mut ctx, mut parent, _) = pair();
        ctx.send_message(b"0").unwrap();
        assert_eq!(read_message(&mut parent).unwrap(), b"0");

        write_message(&mut parent, b"1").unwrap();
        assert!(ctx.wait_for_message(Some(Duration::from_secs(5))));
        assert_eq!(ctx.receive_message().unwrap(), b"1");
    }

    #[test]
    fn test_wait_times_out() {
        let (mut ctx, _parent, _) = pair();
        assert!(!ctx.wait_for_message(Some(Duration::from_millis(20))));
    }

    #[test]
    fn test_stop_request_ends_wait() {
        let (mut ctx, _parent, stop) = pair();
        stop.store(true, Ordering::SeqCst);
        assert!(ctx.stop_requested());
        assert!(!ctx.wait_for_message(None));
    }
}
