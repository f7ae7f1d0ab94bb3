//! Global Table
//!
//! Client and server side of one sharded table. The table owns its partitions and the
//! shard ownership map; clients address it through typed `put`/`update`/`get`/`contains`
//! and the dispatcher reaches it through [`UntypedTable`].
//!
//! Writes to a local shard are pushed through the dispatcher's consistency queue just
//! like remote traffic, so local and remote requests for one key share one ordering.

use super::collector::Collector;
use super::registry::UntypedTable;
use super::types::{PartitionInfo, TableDescriptor};
use crate::disk::checkpoint::CheckpointLog;
use crate::error::{Error, Result};
use crate::sync::{lock, read, write};
use crate::table::partition::LocalPartition;
use crate::transport::network::{NetworkThread, RequestSink};
use crate::transport::types::{Message, Rank, ShardId, TableId, Tag};

use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

pub struct GlobalTable<K, V> {
    descriptor: TableDescriptor<K, V>,
    partitions: Vec<Mutex<LocalPartition<K, V>>>,
    ownership: RwLock<PartitionInfo>,
    checkpoints: Vec<Mutex<Option<CheckpointLog>>>,
    net: Arc<NetworkThread>,
    requests: Arc<dyn RequestSink>,
    collector: Arc<Collector>,
    /// Stamped on puts/updates: the group count in synchronous mode, else 1.
    threshold: u32,
}

impl<K, V> GlobalTable<K, V>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    pub fn new(
        descriptor: TableDescriptor<K, V>,
        net: Arc<NetworkThread>,
        requests: Arc<dyn RequestSink>,
        collector: Arc<Collector>,
        threshold: u32,
    ) -> Result<Arc<Self>> {
        if descriptor.num_shards == 0 {
            return Err(Error::Config(format!("table {} has no shards", descriptor.id)));
        }

        let partitions = (0..descriptor.num_shards)
            .map(|shard| Mutex::new((descriptor.partition_factory)(shard as ShardId)))
            .collect();
        let checkpoints = (0..descriptor.num_shards).map(|_| Mutex::new(None)).collect();

        Ok(Arc::new(Self {
            ownership: RwLock::new(PartitionInfo::new(descriptor.num_shards)),
            descriptor,
            partitions,
            checkpoints,
            net,
            requests,
            collector,
            threshold,
        }))
    }

    pub fn id(&self) -> TableId {
        self.descriptor.id
    }

    pub fn shard_for(&self, key: &K) -> ShardId {
        self.descriptor.sharder.shard(key, self.descriptor.num_shards) as ShardId
    }

    pub fn owner_of(&self, shard: ShardId) -> Option<Rank> {
        read(&self.ownership).owner(shard)
    }

    pub fn is_local(&self, shard: ShardId) -> bool {
        self.owner_of(shard) == Some(self.net.rank())
    }

    pub fn local_shards(&self) -> Vec<ShardId> {
        read(&self.ownership).shards_of(self.net.rank())
    }

    fn envelope(&self, tag: Tag, key: &K, version: u64) -> Result<Message> {
        let shard = self.shard_for(key);
        let key = self.descriptor.key_marshal.marshal(key)?;
        Ok(Message::new(tag)
            .with_table(self.id(), shard)
            .with_key(key)
            .with_version(version))
    }

    /// Local shard: into the dispatcher's queue. Remote shard: to the owner.
    fn route(&self, mut msg: Message) -> Result<()> {
        let owner = self.owner_of(msg.shard).ok_or_else(|| {
            Error::ProtocolViolation(format!(
                "shard {} of table {} has no owner yet",
                msg.shard,
                self.id()
            ))
        })?;

        if owner == self.net.rank() {
            msg.source = owner;
            self.requests.submit(msg)
        } else {
            self.net.send(owner, msg)
        }
    }

    pub fn put(&self, key: &K, value: &V) -> Result<()> {
        self.put_at(key, value, 0)
    }

    pub fn put_at(&self, key: &K, value: &V, version: u64) -> Result<()> {
        let msg = self
            .envelope(Tag::PutRequest, key, version)?
            .with_value(self.descriptor.value_marshal.marshal(value)?)
            .with_threshold(self.threshold);
        self.route(msg)
    }

    /// Routes an update to the shard owner. `true` once the update has been accepted
    /// for application; the merge itself happens on the owner's dispatcher.
    pub fn update(&self, key: &K, value: &V) -> Result<bool> {
        self.update_at(key, value, 0)
    }

    pub fn update_at(&self, key: &K, value: &V, version: u64) -> Result<bool> {
        let msg = self
            .envelope(Tag::UpdateRequest, key, version)?
            .with_value(self.descriptor.value_marshal.marshal(value)?)
            .with_threshold(self.threshold);
        self.route(msg)?;
        Ok(true)
    }

    /// Issues a get without waiting; pair with [`Self::async_get_collect`].
    pub fn async_get(&self, key: &K) -> Result<()> {
        self.async_get_at(key, 0)
    }

    pub fn async_get_at(&self, key: &K, version: u64) -> Result<()> {
        let msg = self.envelope(Tag::GetRequest, key, version)?;
        self.route(msg)
    }

    /// GET reply for marshalled `key`, if one has been filed.
    fn take_reply(&self, key: &[u8]) -> Option<Result<V>> {
        if let Some(msg) = self.collector.try_take(Tag::GetResponse, self.id(), key) {
            return Some(self.descriptor.value_marshal.unmarshal(&msg.value));
        }
        self.collector
            .try_take(Tag::KeyMissing, self.id(), key)
            .map(|_| Err(Error::MissingKey))
    }

    /// Takes the response for `key` if it has already arrived. A key its owner does
    /// not hold is [`Error::MissingKey`].
    pub fn try_collect(&self, key: &K) -> Result<Option<V>> {
        let key = self.descriptor.key_marshal.marshal(key)?;
        self.take_reply(&key).transpose()
    }

    /// Blocks the calling task until the response for `key` arrives.
    pub async fn async_get_collect(&self, key: &K) -> Result<V> {
        let key = self.descriptor.key_marshal.marshal(key)?;
        self.collector.wait(|| self.take_reply(&key)).await?
    }

    pub async fn get(&self, key: &K) -> Result<V> {
        self.get_at(key, 0).await
    }

    pub async fn get_at(&self, key: &K, version: u64) -> Result<V> {
        self.async_get_at(key, version)?;
        self.async_get_collect(key).await
    }

    /// Queued behind every earlier write of `key`, so a caller sees its own puts.
    pub async fn contains(&self, key: &K) -> Result<bool> {
        let msg = self.envelope(Tag::ContainsRequest, key, 0)?;
        let key = msg.key.clone();
        self.route(msg)?;
        let reply = self.collector.take(Tag::ContainsResponse, self.id(), &key).await?;
        reply.payload()
    }

    /// Waits until `probe` yields, re-running it whenever a message arrives.
    pub async fn wait_for<T>(&self, probe: impl FnMut() -> Option<T>) -> Result<T> {
        self.collector.wait(probe).await
    }

    /// Copy of the entries stored for a local shard.
    pub fn snapshot(&self, shard: ShardId) -> Vec<(K, V)> {
        match self.partitions.get(shard as usize) {
            Some(partition) => lock(partition)
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            None => Vec::new(),
        }
    }

    fn local_shard(&self, msg: &Message) -> Result<usize> {
        let shard = msg.shard as usize;
        if shard >= self.partitions.len() {
            return Err(Error::ProtocolViolation(format!(
                "shard {} out of range for table {}",
                msg.shard,
                self.id()
            )));
        }
        if !self.is_local(msg.shard) {
            return Err(Error::ProtocolViolation(format!(
                "rank {} does not own shard {} of table {}",
                self.net.rank(),
                msg.shard,
                self.id()
            )));
        }
        Ok(shard)
    }

    /// Appends the current value of `key` to the shard log if the handler asks for it.
    fn checkpoint(
        &self,
        shard: usize,
        partition: &LocalPartition<K, V>,
        key: &K,
        key_bytes: &[u8],
    ) -> Result<()> {
        let stored = partition.get(key)?;
        if !partition.handler().is_checkpointable(key, stored) {
            return Ok(());
        }

        let mut log = lock(&self.checkpoints[shard]);
        if let Some(log) = log.as_mut() {
            let value = self.descriptor.value_marshal.marshal(stored)?;
            log.append(key_bytes, &value, partition.len())?;
        }
        Ok(())
    }

    fn checkpoint_path(&self, dir: &Path, shard: ShardId) -> PathBuf {
        dir.join(format!("table_{}_shard_{}.ckpt", self.id(), shard))
    }

    fn restore_shard(&self, shard: ShardId, log: &mut CheckpointLog) -> Result<()> {
        let header = log.read_shard_id()?;
        if header != shard {
            return Err(Error::Corrupt(format!(
                "{} belongs to shard {}, expected {}",
                log.path().display(),
                header,
                shard
            )));
        }

        let Some(desired) = log.read_latest_table_size()? else {
            return Ok(());
        };

        let key_marshal = self.descriptor.key_marshal.clone();
        let value_marshal = self.descriptor.value_marshal.clone();
        log.rewind_to_end()?;
        let entries = log.backward().map(|entry| -> Result<(K, V)> {
            let entry = entry?;
            Ok((
                key_marshal.unmarshal(&entry.key)?,
                value_marshal.unmarshal(&entry.value)?,
            ))
        });

        lock(&self.partitions[shard as usize]).restore(entries, desired as usize)?;
        Ok(())
    }
}

impl<K, V> UntypedTable for GlobalTable<K, V>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    fn id(&self) -> TableId {
        self.descriptor.id
    }

    fn num_shards(&self) -> usize {
        self.descriptor.num_shards
    }

    fn apply_put(&self, msg: &Message) -> Result<()> {
        let shard = self.local_shard(msg)?;
        let key = self.descriptor.key_marshal.unmarshal(&msg.key)?;
        let value = self.descriptor.value_marshal.unmarshal(&msg.value)?;

        let mut partition = lock(&self.partitions[shard]);
        partition.put(key.clone(), value);
        self.checkpoint(shard, &partition, &key, &msg.key)
    }

    fn apply_update(&self, msg: &Message) -> Result<bool> {
        let shard = self.local_shard(msg)?;
        let key = self.descriptor.key_marshal.unmarshal(&msg.key)?;
        let value = self.descriptor.value_marshal.unmarshal(&msg.value)?;

        let mut partition = lock(&self.partitions[shard]);
        if !partition.update(key.clone(), value)? {
            return Ok(false);
        }
        self.checkpoint(shard, &partition, &key, &msg.key)?;
        Ok(true)
    }

    fn handle_get(&self, msg: &Message) -> Result<Option<Vec<u8>>> {
        let shard = self.local_shard(msg)?;
        let key = self.descriptor.key_marshal.unmarshal(&msg.key)?;

        let partition = lock(&self.partitions[shard]);
        match partition.get_ready(&key, msg.version)? {
            Some(value) => Ok(Some(self.descriptor.value_marshal.marshal(&value)?)),
            None => Ok(None),
        }
    }

    fn handle_contains(&self, msg: &Message) -> Result<bool> {
        let shard = self.local_shard(msg)?;
        let key = self.descriptor.key_marshal.unmarshal(&msg.key)?;
        Ok(lock(&self.partitions[shard]).contains(&key))
    }

    fn assign_owner(&self, shard: ShardId, owner: Rank) -> Result<()> {
        write(&self.ownership).assign(shard, owner)
    }

    fn owner(&self, shard: ShardId) -> Option<Rank> {
        self.owner_of(shard)
    }

    fn is_assigned(&self) -> bool {
        read(&self.ownership).is_complete()
    }

    fn enable_checkpoints(&self, dir: &Path, restore: bool) -> Result<()> {
        std::fs::create_dir_all(dir)?;

        for shard in self.local_shards() {
            let path = self.checkpoint_path(dir, shard);
            let log = if restore && path.exists() {
                let mut log = CheckpointLog::open(&path)?;
                self.restore_shard(shard, &mut log)?;
                log
            } else {
                CheckpointLog::create(&path, shard)?
            };

            tracing::info!("Checkpointing table {} shard {} to {}", self.id(), shard, path.display());
            *lock(&self.checkpoints[shard as usize]) = Some(log);
        }
        Ok(())
    }

    fn sync_checkpoints(&self) -> Result<()> {
        for slot in &self.checkpoints {
            if let Some(log) = lock(slot).as_mut() {
                log.sync()?;
            }
        }
        Ok(())
    }

    fn local_entries(&self) -> usize {
        self.local_shards()
            .into_iter()
            .map(|shard| lock(&self.partitions[shard as usize]).len())
            .sum()
    }
}
