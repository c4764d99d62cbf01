//! TCP transport
//!
//! Star topology: rank 0 listens and assigns ranks `1..=N` in accept order.
//! Each connection has a reader thread that decodes frames into the local
//! mailbox. Non-root ranks can only address rank 0.
//!
//! A connecting rank first sends `magic | version`. Rank 0 answers with
//! `magic | version | rank | size`. A connection that does not open with
//! a matching hello in time is dropped without using up a rank.
//!
//! Frame layout (little-endian):
//!
//! ```text
//! ┌─────────┬──────────┬─────────────┐
//! │ tag: u8 │ len: u64 │ payload ... │
//! └─────────┴──────────┴─────────────┘
//! ```
//!
//! The sender of a frame is the rank bound to the connection it arrived on.

use super::{star_barrier, Envelope, Mailbox, Source, Tag, Transport};
use crate::error::{TransportError, TransportResult};
use crate::process::pipe::MAX_MESSAGE_SIZE;
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const FRAME_HEADER_SIZE: usize = 1 + 8;

const MAGIC: [u8; 4] = *b"BDST";
const PROTOCOL_VERSION: u32 = 1;
const HELLO_SIZE: usize = 8;
const WELCOME_SIZE: usize = 16;

/// How long rank 0 waits for a new connection's hello
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay between connection attempts while the distributor starts
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(250);

fn hello() -> [u8; HELLO_SIZE] {
    let mut hello = [0u8; HELLO_SIZE];
    hello[..4].copy_from_slice(&MAGIC);
    hello[4..].copy_from_slice(&PROTOCOL_VERSION.to_le_bytes());
    hello
}

fn u32_at(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(word)
}

/// Check `magic | version` at the start of `bytes`
fn check_hello(bytes: &[u8]) -> TransportResult<()> {
    if bytes[..4] != MAGIC {
        return Err(TransportError::Handshake("not a biodist peer".into()));
    }
    let version = u32_at(bytes, 4);
    if version != PROTOCOL_VERSION {
        return Err(TransportError::Handshake(format!(
            "protocol version {} (expected {})",
            version, PROTOCOL_VERSION
        )));
    }
    Ok(())
}

/// Read and check a connecting rank's hello
fn read_hello(stream: &mut TcpStream) -> TransportResult<()> {
    stream.set_read_timeout(Some(HELLO_TIMEOUT))?;
    let mut hello = [0u8; HELLO_SIZE];
    stream
        .read_exact(&mut hello)
        .map_err(|e| TransportError::Handshake(e.to_string()))?;
    check_hello(&hello)?;
    stream.set_read_timeout(None)?;
    Ok(())
}

struct Peer {
    writer: Mutex<TcpStream>,
    reader: Option<JoinHandle<()>>,
}

/// One rank of a job connected over TCP
pub struct TcpTransport {
    rank: usize,
    size: usize,
    mailbox: Arc<Mailbox>,
    /// Indexed by rank; only reachable peers are present
    peers: Vec<Option<Peer>>,
}

impl TcpTransport {
    /// Become rank 0: listen on `addr` and wait for `receivers` ranks to connect
    pub fn listen(addr: &str, receivers: usize) -> TransportResult<Self> {
        let listener = TcpListener::bind(addr)?;
        info!(addr = %listener.local_addr()?, receivers, "Waiting for receivers");
        Self::accept_on(listener, receivers)
    }

    /// Become rank 0 on an already bound listener
    pub fn accept_on(listener: TcpListener, receivers: usize) -> TransportResult<Self> {
        let size = receivers + 1;
        let mailbox = Arc::new(Mailbox::new(receivers));
        let mut peers: Vec<Option<Peer>> = (0..size).map(|_| None).collect();

        let mut rank = 1;
        while rank < size {
            let (mut stream, remote) = listener.accept()?;
            if let Err(e) = read_hello(&mut stream) {
                warn!(remote = %remote, error = %e, "Rejected connection");
                continue;
            }
            stream.set_nodelay(true)?;

            let mut welcome = [0u8; WELCOME_SIZE];
            welcome[..HELLO_SIZE].copy_from_slice(&hello());
            welcome[8..12].copy_from_slice(&(rank as u32).to_le_bytes());
            welcome[12..].copy_from_slice(&(size as u32).to_le_bytes());
            stream.write_all(&welcome)?;

            debug!(rank, remote = %remote, "Receiver connected");
            peers[rank] = Some(Peer::start(stream, rank, Arc::clone(&mailbox))?);
            rank += 1;
        }

        Ok(Self {
            rank: 0,
            size,
            mailbox,
            peers,
        })
    }

    /// Connect to the distributor at `addr`, retrying until `timeout` elapses
    pub fn connect(addr: &str, timeout: Duration) -> TransportResult<Self> {
        let deadline = Instant::now() + timeout;
        let mut stream = loop {
            match TcpStream::connect(addr) {
                Ok(stream) => break stream,
                Err(e) if Instant::now() < deadline => {
                    debug!(addr, error = %e, "Distributor not reachable yet");
                    thread::sleep(CONNECT_RETRY_INTERVAL);
                }
                Err(e) => return Err(TransportError::Io(e)),
            }
        };
        stream.set_nodelay(true)?;
        stream.write_all(&hello())?;

        let mut welcome = [0u8; WELCOME_SIZE];
        stream
            .read_exact(&mut welcome)
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        check_hello(&welcome)?;
        let rank = u32_at(&welcome, 8) as usize;
        let size = u32_at(&welcome, 12) as usize;
        if rank == 0 || rank >= size {
            return Err(TransportError::Handshake(format!(
                "assigned rank {} of {}",
                rank, size
            )));
        }

        info!(rank, size, "Connected to distributor");
        let mailbox = Arc::new(Mailbox::new(1));
        let mut peers: Vec<Option<Peer>> = (0..size).map(|_| None).collect();
        peers[0] = Some(Peer::start(stream, 0, Arc::clone(&mailbox))?);

        Ok(Self {
            rank,
            size,
            mailbox,
            peers,
        })
    }

    fn peer(&self, dest: usize) -> TransportResult<&Peer> {
        if dest >= self.size {
            return Err(TransportError::InvalidRank {
                rank: dest,
                size: self.size,
            });
        }
        self.peers[dest].as_ref().ok_or(TransportError::Unroutable {
            from: self.rank,
            to: dest,
        })
    }
}

impl Peer {
    fn start(stream: TcpStream, rank: usize, mailbox: Arc<Mailbox>) -> TransportResult<Self> {
        let read_half = stream.try_clone()?;
        let reader = thread::Builder::new()
            .name(format!("transport-rank-{}", rank))
            .spawn(move || reader_loop(read_half, rank, mailbox))?;
        Ok(Self {
            writer: Mutex::new(stream),
            reader: Some(reader),
        })
    }
}

fn reader_loop(mut stream: TcpStream, peer: usize, mailbox: Arc<Mailbox>) {
    loop {
        match read_frame(&mut stream) {
            Ok((tag, payload)) => mailbox.deliver(Envelope {
                source: peer,
                tag,
                payload,
            }),
            Err(e) => {
                if e.kind() != io::ErrorKind::UnexpectedEof {
                    warn!(peer, error = %e, "Connection lost");
                }
                mailbox.disconnect(peer);
                return;
            }
        }
    }
}

fn read_frame<R: Read>(stream: &mut R) -> io::Result<(Tag, Vec<u8>)> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    stream.read_exact(&mut header)?;

    let tag = Tag::from_u8(header[0])
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    let mut len = [0u8; 8];
    len.copy_from_slice(&header[1..]);
    let len = u64::from_le_bytes(len);
    if len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }

    // Grows with the data actually received
    let mut payload = Vec::new();
    stream.take(len).read_to_end(&mut payload)?;
    if payload.len() as u64 != len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed inside a frame",
        ));
    }
    Ok((tag, payload))
}

fn write_frame<W: Write>(stream: &mut W, tag: Tag, payload: &[u8]) -> io::Result<()> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.push(tag as u8);
    frame.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    frame.extend_from_slice(payload);
    stream.write_all(&frame)
}

impl Transport for TcpTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn send(&self, dest: usize, tag: Tag, payload: &[u8]) -> TransportResult<()> {
        if dest == self.rank {
            self.mailbox.deliver(Envelope {
                source: self.rank,
                tag,
                payload: payload.to_vec(),
            });
            return Ok(());
        }
        let peer = self.peer(dest)?;
        let mut writer = peer.writer.lock();
        write_frame(&mut *writer, tag, payload).map_err(|e| match e.kind() {
            io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => {
                TransportError::Disconnected(dest)
            }
            _ => TransportError::Io(e),
        })
    }

    fn recv_timeout(
        &self,
        source: Source,
        tag: Tag,
        timeout: Option<Duration>,
    ) -> TransportResult<Option<Envelope>> {
        self.mailbox.take(source, tag, timeout)
    }

    fn barrier(&self) -> TransportResult<()> {
        star_barrier(self)
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        for peer in self.peers.iter_mut().flatten() {
            let _ = peer.writer.lock().shutdown(Shutdown::Both);
            if let Some(reader) = peer.reader.take() {
                let _ = reader.join();
            }
        }
    }
}
