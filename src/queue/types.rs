use crate::transport::types::{Message, TableId, Tag};

/// Requests are ordered per `(table, marshalled key)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueKey {
    pub table: TableId,
    pub key: Vec<u8>,
}

impl QueueKey {
    pub fn of(msg: &Message) -> Self {
        Self {
            table: msg.table,
            key: msg.key.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Put,
    Get,
}

impl Phase {
    /// Sub-queue a request waits in: gets in the get queue, writes in the put queue.
    pub fn of(tag: Tag) -> Self {
        match tag {
            Tag::GetRequest => Phase::Get,
            _ => Phase::Put,
        }
    }
}
