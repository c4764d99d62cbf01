//! Message passing between ranks
//!
//! Ranks exchange tagged byte messages. Rank 0 is the Distributor; every
//! other rank is a Receiver. Delivery is ordered per (source, tag): two
//! messages sent by one rank on one tag are received in send order, which
//! the two-part package transmission relies on.
//!
//! ```text
//!            ┌──────────────┐
//!            │   Rank 0     │
//!            │ Distributor  │
//!            └──┬────┬────┬─┘
//!     Control   │    │    │   Data / OutOfBand
//!         ┌─────┘    │    └─────┐
//!         ▼          ▼          ▼
//!     ┌───────┐  ┌───────┐  ┌───────┐
//!     │Rank 1 │  │Rank 2 │  │Rank N │   Receivers
//!     └───────┘  └───────┘  └───────┘
//! ```

pub mod local;
pub mod tcp;

pub use local::LocalTransport;
pub use tcp::TcpTransport;

use crate::error::{TransportError, TransportResult};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};
use tracing::debug;

/// Logical channel of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    /// Status requests and commands
    Control = 0,
    /// Work package payloads and element counts
    Data = 1,
    /// Exit commands that may arrive at any time
    OutOfBand = 2,
    /// Barrier rendezvous, used by transports internally
    Sync = 3,
}

impl Tag {
    pub fn from_u8(value: u8) -> TransportResult<Self> {
        match value {
            0 => Ok(Tag::Control),
            1 => Ok(Tag::Data),
            2 => Ok(Tag::OutOfBand),
            3 => Ok(Tag::Sync),
            other => Err(TransportError::UnknownCode {
                what: "tag",
                code: other as i64,
            }),
        }
    }
}

/// Which sender a receive accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Any,
    Rank(usize),
}

impl Source {
    fn matches(self, rank: usize) -> bool {
        match self {
            Source::Any => true,
            Source::Rank(r) => r == rank,
        }
    }
}

/// A received message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub source: usize,
    pub tag: Tag,
    pub payload: Vec<u8>,
}

/// Tagged point-to-point messaging between the ranks of one job
pub trait Transport: Send {
    /// This process's rank
    fn rank(&self) -> usize;

    /// Number of ranks in the job
    fn size(&self) -> usize;

    /// Queue a message for `dest`; never waits for the receiver
    fn send(&self, dest: usize, tag: Tag, payload: &[u8]) -> TransportResult<()>;

    /// Wait up to `timeout` (forever when `None`) for a matching message
    fn recv_timeout(
        &self,
        source: Source,
        tag: Tag,
        timeout: Option<Duration>,
    ) -> TransportResult<Option<Envelope>>;

    /// Block until all ranks reach the barrier
    fn barrier(&self) -> TransportResult<()>;

    /// Wait for a matching message
    fn recv(&self, source: Source, tag: Tag) -> TransportResult<Envelope> {
        loop {
            if let Some(envelope) = self.recv_timeout(source, tag, None)? {
                return Ok(envelope);
            }
        }
    }

    /// Take a matching message if one is already queued
    fn try_recv(&self, source: Source, tag: Tag) -> TransportResult<Option<Envelope>> {
        self.recv_timeout(source, tag, Some(Duration::ZERO))
    }
}

/// Message-based barrier through rank 0, shared by the transports
///
/// Rank 0 collects a `Sync` message from every other rank, then releases
/// them all. A rank that already disconnected cannot take part and is left
/// out, so one lost rank never holds up the rest.
pub(crate) fn star_barrier<T: Transport + ?Sized>(transport: &T) -> TransportResult<()> {
    if transport.rank() != 0 {
        transport.send(0, Tag::Sync, &[])?;
        transport.recv(Source::Rank(0), Tag::Sync)?;
        return Ok(());
    }

    let mut present = Vec::with_capacity(transport.size().saturating_sub(1));
    for rank in 1..transport.size() {
        match transport.recv(Source::Rank(rank), Tag::Sync) {
            Ok(_) => present.push(rank),
            Err(TransportError::Disconnected(_)) => {
                debug!(rank, "Rank left before the barrier");
            }
            Err(e) => return Err(e),
        }
    }
    for rank in present {
        match transport.send(rank, Tag::Sync, &[]) {
            Ok(()) | Err(TransportError::Disconnected(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[derive(Debug, Default)]
struct MailboxState {
    messages: VecDeque<Envelope>,
    disconnected: HashSet<usize>,
    /// Disconnects already reported to a `Source::Any` receive, per tag
    reported: HashSet<(usize, Tag)>,
}

/// Inbound message queue of one rank
///
/// Messages are kept in arrival order; a receive takes the oldest message
/// matching its source and tag. Messages queued before a peer disconnected
/// are still delivered. After that, a `Source::Any` receive reports each
/// lost peer once per tag, so a caller waiting on several peers learns
/// about every one that went away.
#[derive(Debug)]
pub(crate) struct Mailbox {
    state: Mutex<MailboxState>,
    arrived: Condvar,
    peers: usize,
}

impl Mailbox {
    /// Mailbox expecting messages from `peers` other ranks
    pub(crate) fn new(peers: usize) -> Self {
        Self {
            state: Mutex::new(MailboxState::default()),
            arrived: Condvar::new(),
            peers,
        }
    }

    pub(crate) fn deliver(&self, envelope: Envelope) {
        self.state.lock().messages.push_back(envelope);
        self.arrived.notify_all();
    }

    /// Mark `rank` as gone; pending receives that can no longer match fail
    pub(crate) fn disconnect(&self, rank: usize) {
        self.state.lock().disconnected.insert(rank);
        self.arrived.notify_all();
    }

    pub(crate) fn take(
        &self,
        source: Source,
        tag: Tag,
        timeout: Option<Duration>,
    ) -> TransportResult<Option<Envelope>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if let Some(pos) = state
                .messages
                .iter()
                .position(|m| m.tag == tag && source.matches(m.source))
            {
                return Ok(state.messages.remove(pos));
            }

            match source {
                Source::Rank(r) if state.disconnected.contains(&r) => {
                    return Err(TransportError::Disconnected(r));
                }
                Source::Any => {
                    let unreported = state
                        .disconnected
                        .iter()
                        .copied()
                        .filter(|r| !state.reported.contains(&(*r, tag)))
                        .min();
                    if let Some(r) = unreported {
                        state.reported.insert((r, tag));
                        return Err(TransportError::Disconnected(r));
                    }
                    if self.peers > 0 && state.disconnected.len() >= self.peers {
                        let any = state.disconnected.iter().copied().min().unwrap_or_default();
                        return Err(TransportError::Disconnected(any));
                    }
                }
                _ => {}
            }

            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                    self.arrived.wait_until(&mut state, deadline);
                }
                None => self.arrived.wait(&mut state),
            }
        }
    }
}
