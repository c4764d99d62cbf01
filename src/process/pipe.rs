//! Framed messages over worker pipes
//!
//! Every message is a `u64` little-endian length followed by that many
//! bytes. Readiness is checked with `poll(2)` so callers can wait on
//! several workers at once with a bounded timeout.

use std::io::{self, Read, Write};
use std::os::fd::RawFd;
use std::time::Duration;

/// Largest message a worker channel or rank connection accepts
pub(crate) const MAX_MESSAGE_SIZE: u64 = 1 << 36;

/// Write one framed message and flush
pub fn write_message<W: Write + ?Sized>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    writer.write_all(&(payload.len() as u64).to_le_bytes())?;
    writer.write_all(payload)?;
    writer.flush()
}

/// Read one framed message
pub fn read_message<R: Read + ?Sized>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len = [0u8; 8];
    reader.read_exact(&mut len)?;
    let len = u64::from_le_bytes(len);
    if len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message of {} bytes exceeds limit", len),
        ));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

/// Wait until any of `fds` is readable (or hung up)
///
/// Returns the indices of ready descriptors; empty on timeout or when
/// interrupted by a signal. `None` waits forever.
pub fn poll_readable(fds: &[RawFd], timeout: Option<Duration>) -> io::Result<Vec<usize>> {
    if fds.is_empty() {
        if let Some(t) = timeout {
            std::thread::sleep(t);
        }
        return Ok(Vec::new());
    }

    let mut pollfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();

    let timeout_ms: libc::c_int = match timeout {
        None => -1,
        Some(t) => t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
    };

    // SAFETY: pollfds is a valid, exclusively borrowed array of fds.len() entries
    let ret = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(Vec::new());
        }
        return Err(err);
    }

    Ok(pollfds
        .iter()
        .enumerate()
        .filter(|(_, p)| p.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0)
        .map(|(i, _)| i)
        .collect())
}
