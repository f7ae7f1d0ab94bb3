//! Response Collector
//!
//! GET_RESPONSE, KEY_MISSING and CONTAINS_RESPONSE messages from every table arrive in
//! the same per-`(tag, source)` transport buffers. The collector drains those buffers
//! and files each response under `(tag, table, key)`, so concurrent waiters on different
//! keys or tables never consume each other's replies.

use crate::error::Result;
use crate::transport::network::NetworkThread;
use crate::transport::types::{Message, TableId, Tag};

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;

type SlotKey = (Tag, TableId, Vec<u8>);

pub struct Collector {
    net: Arc<NetworkThread>,
    collected: DashMap<SlotKey, VecDeque<Message>>,
}

impl Collector {
    pub fn new(net: Arc<NetworkThread>) -> Arc<Self> {
        Arc::new(Self {
            net,
            collected: DashMap::new(),
        })
    }

    fn drain(&self, tag: Tag) {
        let mut filed = false;
        while let Some(msg) = self.net.try_read(None, tag) {
            self.collected
                .entry((tag, msg.table, msg.key.clone()))
                .or_default()
                .push_back(msg);
            filed = true;
        }
        // A waiter may have probed between our read and the insert.
        if filed {
            self.net.notify_arrivals();
        }
    }

    /// Takes a response for `key` if one has arrived.
    pub fn try_take(&self, tag: Tag, table: TableId, key: &[u8]) -> Option<Message> {
        self.drain(tag);
        let slot = (tag, table, key.to_vec());
        let msg = self.collected.get_mut(&slot)?.pop_front();
        self.collected.remove_if(&slot, |_, queue| queue.is_empty());
        msg
    }

    /// Waits for a response for `key`.
    pub async fn take(&self, tag: Tag, table: TableId, key: &[u8]) -> Result<Message> {
        self.net
            .wait_arrival(|| self.try_take(tag, table, key))
            .await
    }

    /// Waits until `probe` succeeds; `probe` is re-run after every arrival.
    pub async fn wait<T>(&self, probe: impl FnMut() -> Option<T>) -> Result<T> {
        self.net.wait_arrival(probe).await
    }

    /// Number of responses filed but not yet taken.
    pub fn pending(&self) -> usize {
        self.collected.iter().map(|entry| entry.value().len()).sum()
    }
}
