use crate::error::Result;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Index of a process in the job, `[0, size)`.
pub type Rank = usize;
pub type TableId = u32;
pub type ShardId = u32;

/// Message tags carried by every envelope.
///
/// Request-class tags are handed to the dispatcher; everything else is either routed
/// to a registered callback or buffered per `(tag, source)` for explicit reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tag {
    RegisterWorker,
    ShardAssignment,
    ShardAssignmentDone,
    PutRequest,
    UpdateRequest,
    GetRequest,
    GetResponse,
    /// Reply to a GET for a key its owner does not hold.
    KeyMissing,
    ContainsRequest,
    ContainsResponse,
    DataPutRequest,
    DataPutRequestFinish,
    DataPutRequestDone,
    BarrierRequest,
    BarrierReply,
    BarrierReady,
    WorkerShutdown,
    WorkerEnd,
}

impl Tag {
    /// Tags served by the dispatcher loop rather than read by callers.
    pub fn is_request(self) -> bool {
        matches!(
            self,
            Tag::PutRequest
                | Tag::UpdateRequest
                | Tag::GetRequest
                | Tag::ContainsRequest
                | Tag::DataPutRequest
                | Tag::DataPutRequestFinish
        )
    }

    /// Table-data tags, served on the dispatcher's disk lane in arrival order.
    pub fn is_table_data(self) -> bool {
        matches!(self, Tag::DataPutRequest | Tag::DataPutRequestFinish)
    }
}

/// The wire envelope.
///
/// `key` and `value` hold marshalled bytes; control messages carry a bincode payload
/// in `value` (see [`Message::with_payload`]). `threshold` is only meaningful for
/// synchronous puts/updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub tag: Tag,
    pub source: Rank,
    pub table: TableId,
    pub shard: ShardId,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub version: u64,
    pub threshold: u32,
}

impl Message {
    pub fn new(tag: Tag) -> Self {
        Self {
            tag,
            source: 0,
            table: 0,
            shard: 0,
            key: Vec::new(),
            value: Vec::new(),
            version: 0,
            threshold: 1,
        }
    }

    pub fn with_table(mut self, table: TableId, shard: ShardId) -> Self {
        self.table = table;
        self.shard = shard;
        self
    }

    pub fn with_key(mut self, key: Vec<u8>) -> Self {
        self.key = key;
        self
    }

    pub fn with_value(mut self, value: Vec<u8>) -> Self {
        self.value = value;
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Stores a bincode-encoded control payload in `value`.
    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Result<Self> {
        self.value = bincode::serialize(payload)?;
        Ok(self)
    }

    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(bincode::deserialize(&self.value)?)
    }

    /// Builds the reply to `self` with the same table, shard and key.
    pub fn reply(&self, tag: Tag) -> Self {
        Message::new(tag)
            .with_table(self.table, self.shard)
            .with_key(self.key.clone())
            .with_version(self.version)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
