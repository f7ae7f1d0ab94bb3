//! Network Thread
//!
//! One background pump per process moves messages in both directions:
//! - **Outgoing**: `send` only enqueues; the pump hands each message to the substrate in
//!   order and tracks how many sends are still outstanding (see [`NetworkThread::flush`]).
//! - **Incoming**: messages are demultiplexed by tag. Tags with a registered callback are
//!   handled immediately, request-class tags go to the request sink (the dispatcher), and
//!   everything else is buffered per `(tag, source)` until a caller reads it.
//!
//! Readers block on a [`Notify`] rather than polling on a timer.

use super::fabric::{Fabric, Inbox};
use super::types::{Message, Rank, Tag};
use crate::error::{Error, Result};

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::{Mutex, Notify, mpsc};

/// Handler for urgent tags. Runs on the pump, so it must not block.
pub type Callback = Arc<dyn Fn(Message) + Send + Sync>;

/// Receiver of request-class messages.
pub trait RequestSink: Send + Sync {
    fn submit(&self, msg: Message) -> Result<()>;
}

pub struct NetworkThread {
    rank: Rank,
    size: usize,
    fabric: Arc<dyn Fabric>,
    outgoing: mpsc::UnboundedSender<(Rank, Message)>,
    /// Taken by `start`.
    pump_io: Mutex<Option<(Inbox, mpsc::UnboundedReceiver<(Rank, Message)>)>>,
    pending_sends: AtomicUsize,
    sent: Notify,
    responses: DashMap<(Tag, Rank), VecDeque<Message>>,
    arrivals: Notify,
    callbacks: DashMap<Tag, Callback>,
    sink: OnceLock<Arc<dyn RequestSink>>,
    running: AtomicBool,
    stop: Notify,
}

impl NetworkThread {
    pub fn new(fabric: Arc<dyn Fabric>, inbox: Inbox) -> Arc<Self> {
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            rank: fabric.rank(),
            size: fabric.size(),
            fabric,
            outgoing,
            pump_io: Mutex::new(Some((inbox, outgoing_rx))),
            pending_sends: AtomicUsize::new(0),
            sent: Notify::new(),
            responses: DashMap::new(),
            arrivals: Notify::new(),
            callbacks: DashMap::new(),
            sink: OnceLock::new(),
            running: AtomicBool::new(true),
            stop: Notify::new(),
        })
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of messages accepted by `send` but not yet handed to the substrate.
    pub fn pending_sends(&self) -> usize {
        self.pending_sends.load(Ordering::SeqCst)
    }

    /// Installs the receiver of request-class messages. Only the first call has effect.
    pub fn set_request_sink(&self, sink: Arc<dyn RequestSink>) {
        if self.sink.set(sink).is_err() {
            tracing::warn!("Request sink already installed on rank {}", self.rank);
        }
    }

    /// Routes every incoming `tag` message to `callback` instead of any queue.
    pub fn register_callback<F>(&self, tag: Tag, callback: F)
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.callbacks.insert(tag, Arc::new(callback));
        tracing::debug!("Rank {} registered callback for {:?}", self.rank, tag);
    }

    /// Spawns the pump. Calling it twice is a no-op.
    pub async fn start(self: Arc<Self>) {
        let Some((inbox, outgoing_rx)) = self.pump_io.lock().await.take() else {
            tracing::warn!("Network thread on rank {} already started", self.rank);
            return;
        };

        let network = self.clone();
        tokio::spawn(async move {
            network.pump_loop(inbox, outgoing_rx).await;
        });

        tracing::info!("Network thread started on rank {} of {}", self.rank, self.size);
    }

    async fn pump_loop(
        self: Arc<Self>,
        mut inbox: Inbox,
        mut outgoing: mpsc::UnboundedReceiver<(Rank, Message)>,
    ) {
        loop {
            tokio::select! {
                _ = self.stop.notified() => break,
                Some((dst, msg)) = outgoing.recv() => self.transmit(dst, msg).await,
                incoming = inbox.recv() => match incoming {
                    Some(msg) => self.deliver(msg),
                    None => {
                        tracing::info!("Inbox of rank {} closed", self.rank);
                        break;
                    }
                },
            }
        }

        self.running.store(false, Ordering::SeqCst);
        self.arrivals.notify_waiters();
        self.sent.notify_waiters();
        tracing::info!("Network thread on rank {} stopped", self.rank);
    }

    async fn transmit(&self, dst: Rank, msg: Message) {
        let tag = msg.tag;
        if dst == self.rank {
            self.deliver(msg);
        } else if let Err(e) = self.fabric.send(dst, msg).await {
            tracing::error!("Rank {} failed to send {:?} to {}: {}", self.rank, tag, dst, e);
        }

        self.pending_sends.fetch_sub(1, Ordering::SeqCst);
        self.sent.notify_waiters();
    }

    fn deliver(&self, msg: Message) {
        tracing::trace!(
            "Rank {} received {:?} from {} (table {}, shard {})",
            self.rank,
            msg.tag,
            msg.source,
            msg.table,
            msg.shard
        );

        let callback = self.callbacks.get(&msg.tag).map(|entry| entry.value().clone());
        if let Some(callback) = callback {
            callback(msg);
            return;
        }

        if msg.tag.is_request() {
            if let Some(sink) = self.sink.get() {
                if let Err(e) = sink.submit(msg) {
                    tracing::error!("Rank {} rejected request: {}", self.rank, e);
                    self.shutdown_now();
                }
                return;
            }
            tracing::warn!("Rank {} has no request sink, buffering {:?}", self.rank, msg.tag);
        }

        self.responses
            .entry((msg.tag, msg.source))
            .or_default()
            .push_back(msg);
        self.arrivals.notify_waiters();
    }

    /// Queues `msg` for `dst`, stamping this process as its source. Never blocks.
    pub fn send(&self, dst: Rank, mut msg: Message) -> Result<()> {
        if dst >= self.size {
            return Err(Error::Transport(format!("no such rank {}", dst)));
        }
        msg.source = self.rank;
        self.pending_sends.fetch_add(1, Ordering::SeqCst);
        self.outgoing.send((dst, msg)).map_err(|_| {
            self.pending_sends.fetch_sub(1, Ordering::SeqCst);
            Error::ShutDown
        })
    }

    /// Sends a copy of `msg` to every rank except this one.
    pub fn broadcast(&self, msg: Message) -> Result<()> {
        for dst in (0..self.size).filter(|&dst| dst != self.rank) {
            self.send(dst, msg.clone())?;
        }
        Ok(())
    }

    /// Broadcasts `msg`, then waits for one `reply` from every other rank.
    pub async fn sync_broadcast(&self, msg: Message, reply: Tag) -> Result<()> {
        let tag = msg.tag;
        self.broadcast(msg)?;

        for _ in 0..self.size.saturating_sub(1) {
            self.read(None, reply).await?;
        }

        tracing::debug!("Rank {} completed sync broadcast of {:?}", self.rank, tag);
        Ok(())
    }

    /// Pops a buffered `tag` message, from `src` or from the lowest rank that has one.
    pub fn try_read(&self, src: Option<Rank>, tag: Tag) -> Option<Message> {
        match src {
            Some(src) => self
                .responses
                .get_mut(&(tag, src))
                .and_then(|mut queue| queue.pop_front()),
            None => (0..self.size).find_map(|src| self.try_read(Some(src), tag)),
        }
    }

    /// Blocks until a `tag` message (from `src`, if given) is available.
    pub async fn read(&self, src: Option<Rank>, tag: Tag) -> Result<Message> {
        self.wait_arrival(|| self.try_read(src, tag)).await
    }

    /// Re-runs `probe` after every arrival until it yields a value.
    ///
    /// Fails with [`Error::ShutDown`] once the pump has stopped and `probe` still
    /// finds nothing.
    pub async fn wait_arrival<T>(&self, mut probe: impl FnMut() -> Option<T>) -> Result<T> {
        loop {
            let notified = self.arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(found) = probe() {
                return Ok(found);
            }
            if !self.is_running() {
                return Err(Error::ShutDown);
            }

            notified.await;
        }
    }

    /// Wakes every `wait_arrival` caller so it re-runs its probe.
    pub fn notify_arrivals(&self) {
        self.arrivals.notify_waiters();
    }

    /// Waits until every queued send has been handed to the substrate.
    pub async fn flush(&self) -> Result<()> {
        loop {
            let notified = self.sent.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.pending_sends() == 0 {
                return Ok(());
            }
            if !self.is_running() {
                return Err(Error::ShutDown);
            }

            notified.await;
        }
    }

    /// Stops the pump. The caller must have flushed first.
    pub fn shutdown(&self) -> Result<()> {
        let pending = self.pending_sends();
        if pending > 0 {
            return Err(Error::ProtocolViolation(format!(
                "shutdown requested with {} sends outstanding",
                pending
            )));
        }
        self.shutdown_now();
        Ok(())
    }

    fn shutdown_now(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            tracing::info!("Shutting down network thread on rank {}", self.rank);
        }
        self.stop.notify_one();
        self.arrivals.notify_waiters();
        self.sent.notify_waiters();
    }
}
