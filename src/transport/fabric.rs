//! Point-to-Point Substrate
//!
//! The raw transport underneath [`NetworkThread`](super::network::NetworkThread).
//! A substrate only has to deliver messages reliably and in order per `(source, tag)`;
//! everything else (demultiplexing, buffering, barriers) lives in the network thread.

use super::types::{Message, Rank};
use crate::error::{Error, Result};

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Incoming side of a substrate. `try_recv` answers "is anything available" without blocking.
pub type Inbox = mpsc::UnboundedReceiver<Message>;

pub type SendFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

pub trait Fabric: Send + Sync + 'static {
    fn rank(&self) -> Rank;

    fn size(&self) -> usize;

    /// Delivers `msg` to `dst`. Resolves once the substrate has accepted the message.
    fn send(&self, dst: Rank, msg: Message) -> SendFuture<'_>;
}

/// In-process mesh: every rank owns an unbounded inbox and holds senders to all peers.
pub struct MemoryFabric {
    rank: Rank,
    peers: Vec<mpsc::UnboundedSender<Message>>,
}

impl MemoryFabric {
    /// Builds a fully connected mesh of `size` ranks, returned in rank order.
    pub fn mesh(size: usize) -> Vec<(Arc<dyn Fabric>, Inbox)> {
        let (senders, inboxes): (Vec<_>, Vec<_>) =
            (0..size).map(|_| mpsc::unbounded_channel()).unzip();

        inboxes
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| {
                let fabric: Arc<dyn Fabric> = Arc::new(MemoryFabric {
                    rank,
                    peers: senders.clone(),
                });
                (fabric, inbox)
            })
            .collect()
    }
}

impl Fabric for MemoryFabric {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, dst: Rank, msg: Message) -> SendFuture<'_> {
        let result = match self.peers.get(dst) {
            Some(peer) => peer
                .send(msg)
                .map_err(|_| Error::Transport(format!("inbox of rank {} is closed", dst))),
            None => Err(Error::Transport(format!("no such rank {}", dst))),
        };
        Box::pin(async move { result })
    }
}
