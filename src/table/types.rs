use super::handler::MergeHandler;
use super::marshal::{BincodeMarshal, HashSharder, Marshal, Sharder};
use super::partition::LocalPartition;
use crate::error::{Error, Result};
use crate::transport::types::{Rank, ShardId, TableId};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::hash::Hash;
use std::sync::Arc;

pub const DEFAULT_PARTITION_CAPACITY: usize = 64;

/// Builds the empty partition for a shard.
pub type PartitionFactory<K, V> = Arc<dyn Fn(ShardId) -> LocalPartition<K, V> + Send + Sync>;

/// Everything needed to host or address one table. Fixed for the table's lifetime.
pub struct TableDescriptor<K, V> {
    pub id: TableId,
    pub num_shards: usize,
    pub key_marshal: Arc<dyn Marshal<K>>,
    pub value_marshal: Arc<dyn Marshal<V>>,
    pub sharder: Arc<dyn Sharder<K>>,
    pub handler: Arc<dyn MergeHandler<K, V>>,
    pub partition_factory: PartitionFactory<K, V>,
}

impl<K, V> TableDescriptor<K, V>
where
    K: Hash + Eq + Clone + Serialize + DeserializeOwned + 'static,
    V: Clone + Serialize + DeserializeOwned + 'static,
{
    /// Bincode codecs, hash sharding and partitions of [`DEFAULT_PARTITION_CAPACITY`].
    pub fn new(id: TableId, num_shards: usize, handler: Arc<dyn MergeHandler<K, V>>) -> Self {
        Self {
            id,
            num_shards,
            key_marshal: Arc::new(BincodeMarshal),
            value_marshal: Arc::new(BincodeMarshal),
            sharder: Arc::new(HashSharder),
            partition_factory: capacity_factory(handler.clone(), DEFAULT_PARTITION_CAPACITY),
            handler,
        }
    }
}

impl<K, V> TableDescriptor<K, V>
where
    K: Hash + Eq + Clone + 'static,
    V: Clone + 'static,
{
    pub fn with_sharder(mut self, sharder: Arc<dyn Sharder<K>>) -> Self {
        self.sharder = sharder;
        self
    }

    pub fn with_partition_capacity(mut self, capacity: usize) -> Self {
        self.partition_factory = capacity_factory(self.handler.clone(), capacity);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_shards == 0 {
            return Err(Error::Config(format!("table {} has no shards", self.id)));
        }
        Ok(())
    }
}

fn capacity_factory<K, V>(
    handler: Arc<dyn MergeHandler<K, V>>,
    capacity: usize,
) -> PartitionFactory<K, V>
where
    K: Hash + Eq + Clone + 'static,
    V: Clone + 'static,
{
    Arc::new(move |shard| LocalPartition::new(shard, capacity, handler.clone()))
}

/// One `(table, shard) -> owner` decision, as broadcast by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardAssignment {
    pub table: TableId,
    pub shard: ShardId,
    pub owner: Rank,
}

/// Shard ownership of one table. Each shard is assigned once and never moves.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartitionInfo {
    owners: Vec<Option<Rank>>,
}

impl PartitionInfo {
    pub fn new(num_shards: usize) -> Self {
        Self {
            owners: vec![None; num_shards],
        }
    }

    pub fn owner(&self, shard: ShardId) -> Option<Rank> {
        self.owners.get(shard as usize).copied().flatten()
    }

    /// Records `owner` for `shard`. Reassigning to a different owner is rejected.
    pub fn assign(&mut self, shard: ShardId, owner: Rank) -> Result<()> {
        let slot = self.owners.get_mut(shard as usize).ok_or_else(|| {
            Error::ProtocolViolation(format!("assignment for shard {} out of range", shard))
        })?;

        match *slot {
            Some(current) if current != owner => Err(Error::ProtocolViolation(format!(
                "shard {} already owned by {}, cannot move to {}",
                shard, current, owner
            ))),
            _ => {
                *slot = Some(owner);
                Ok(())
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.owners.iter().all(Option::is_some)
    }

    pub fn shards_of(&self, rank: Rank) -> Vec<ShardId> {
        self.owners
            .iter()
            .enumerate()
            .filter(|(_, owner)| **owner == Some(rank))
            .map(|(shard, _)| shard as ShardId)
            .collect()
    }
}
