//! In-process transport
//!
//! All ranks live in one process, typically one thread each. Used by the
//! `run` subcommand and by tests. The barrier is message based like the
//! TCP one, so a rank that went away is left out instead of hanging it.

use super::{star_barrier, Envelope, Mailbox, Source, Tag, Transport};
use crate::error::{TransportError, TransportResult};
use std::sync::Arc;
use std::time::Duration;

/// One rank of an in-process job
pub struct LocalTransport {
    rank: usize,
    mailboxes: Arc<Vec<Mailbox>>,
}

impl LocalTransport {
    /// Create a fully connected job of `size` ranks, indexed by rank
    pub fn mesh(size: usize) -> Vec<Self> {
        let peers = size.saturating_sub(1);
        let mailboxes: Arc<Vec<Mailbox>> =
            Arc::new((0..size).map(|_| Mailbox::new(peers)).collect());

        (0..size)
            .map(|rank| Self {
                rank,
                mailboxes: Arc::clone(&mailboxes),
            })
            .collect()
    }
}

impl Transport for LocalTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.mailboxes.len()
    }

    fn send(&self, dest: usize, tag: Tag, payload: &[u8]) -> TransportResult<()> {
        let mailbox = self.mailboxes.get(dest).ok_or(TransportError::InvalidRank {
            rank: dest,
            size: self.mailboxes.len(),
        })?;
        mailbox.deliver(Envelope {
            source: self.rank,
            tag,
            payload: payload.to_vec(),
        });
        Ok(())
    }

    fn recv_timeout(
        &self,
        source: Source,
        tag: Tag,
        timeout: Option<Duration>,
    ) -> TransportResult<Option<Envelope>> {
        self.mailboxes[self.rank].take(source, tag, timeout)
    }

    fn barrier(&self) -> TransportResult<()> {
        star_barrier(self)
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        for (rank, mailbox) in self.mailboxes.iter().enumerate() {
            if rank != self.rank {
                mailbox.disconnect(self.rank);
            }
        }
    }
}
