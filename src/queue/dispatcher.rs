//! Request Dispatcher
//!
//! Pulls requests from the consistency queue and runs the handler registered for each
//! request's tag. The dispatcher is the only writer of local partitions.
//!
//! ## Responsibilities
//! - **Routing**: table requests go through the consistency queue; table-data requests
//!   (disk blocks and their end marker) run on a separate FIFO lane in arrival order.
//! - **Retry**: a handler returning `Ok(false)` means "not ready"; the request goes back
//!   to the tail of its key's sub-queue and other keys keep progressing.
//! - **Failure**: a handler error is fatal and stops the loop.

use super::consistency::RequestQueue;
use crate::error::{Error, Result};
use crate::transport::network::RequestSink;
use crate::transport::types::{Message, Tag};

use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, mpsc};

/// Handler for one request tag. `Ok(true)` served, `Ok(false)` retry later.
pub type RequestHandlerFn = Arc<dyn Fn(&Message) -> Result<bool> + Send + Sync>;

pub struct Dispatcher {
    queue: Box<dyn RequestQueue>,
    handlers: DashMap<Tag, RequestHandlerFn>,
    disk_lane: mpsc::UnboundedSender<Message>,
    disk_lane_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    wakeup: Notify,
    running: AtomicBool,
    /// Sleep after a full round of requeues.
    backoff: Duration,
}

impl Dispatcher {
    pub fn new(queue: Box<dyn RequestQueue>, backoff: Duration) -> Arc<Self> {
        let (disk_lane, disk_lane_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            queue,
            handlers: DashMap::new(),
            disk_lane,
            disk_lane_rx: Mutex::new(Some(disk_lane_rx)),
            wakeup: Notify::new(),
            running: AtomicBool::new(true),
            backoff,
        })
    }

    /// Registers the handler for `tag`, replacing any previous one.
    pub fn register<F>(&self, tag: Tag, handler: F)
    where
        F: Fn(&Message) -> Result<bool> + Send + Sync + 'static,
    {
        self.handlers.insert(tag, Arc::new(handler));
        tracing::info!("Registered request handler for {:?}", tag);
    }

    pub fn has_handler(&self, tag: Tag) -> bool {
        self.handlers.contains_key(&tag)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn queue(&self) -> &dyn RequestQueue {
        self.queue.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Runs the handler for `msg` once.
    pub fn invoke(&self, msg: &Message) -> Result<bool> {
        let handler = self
            .handlers
            .get(&msg.tag)
            .map(|entry| entry.value().clone())
            .ok_or(Error::UnknownHandler(msg.tag))?;
        handler(msg)
    }

    /// Spawns the dispatch loop and the table-data lane.
    pub async fn start(self: Arc<Self>) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            if let Err(e) = dispatcher.dispatch_loop().await {
                tracing::error!("Dispatcher stopped on fatal error: {}", e);
                dispatcher.stop();
            }
        });

        if let Some(rx) = self.disk_lane_rx.lock().await.take() {
            let dispatcher = self.clone();
            tokio::spawn(async move {
                if let Err(e) = dispatcher.disk_loop(rx).await {
                    tracing::error!("Table-data lane stopped on fatal error: {}", e);
                    dispatcher.stop();
                }
            });
        }

        tracing::info!("Dispatcher started with {} handlers", self.handler_count());
    }

    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            tracing::info!("Stopping dispatcher");
        }
        self.wakeup.notify_one();
    }

    async fn dispatch_loop(&self) -> Result<()> {
        let mut requeued_in_row = 0usize;

        while self.is_running() {
            let Some(msg) = self.queue.next_request() else {
                self.wakeup.notified().await;
                continue;
            };

            let served = self.invoke(&msg)?;
            if served {
                requeued_in_row = 0;
            } else {
                tracing::trace!(
                    "{:?} for table {} not ready, requeueing",
                    msg.tag,
                    msg.table
                );
                requeued_in_row += 1;
            }
            self.queue.complete(msg, served);

            // Every waiting request was tried once without progress.
            if requeued_in_row > 0 && requeued_in_row >= self.queue.len() {
                tokio::time::sleep(self.backoff).await;
                requeued_in_row = 0;
            } else {
                tokio::task::yield_now().await;
            }
        }
        Ok(())
    }

    async fn disk_loop(&self, mut rx: mpsc::UnboundedReceiver<Message>) -> Result<()> {
        while let Some(msg) = rx.recv().await {
            if !self.is_running() {
                break;
            }
            if !self.invoke(&msg)? {
                return Err(Error::ProtocolViolation(format!(
                    "table-data request {:?} cannot be retried",
                    msg.tag
                )));
            }
        }
        Ok(())
    }
}

impl RequestSink for Dispatcher {
    fn submit(&self, msg: Message) -> Result<()> {
        if msg.tag.is_table_data() {
            return self.disk_lane.send(msg).map_err(|_| Error::ShutDown);
        }

        self.queue.enqueue(msg)?;
        self.wakeup.notify_one();
        Ok(())
    }
}
