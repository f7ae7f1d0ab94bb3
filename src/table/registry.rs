//! Table Registry
//!
//! Maps table ids to type-erased tables so the dispatcher, the shard-assignment
//! callback and the disk lane can reach a table from nothing but a message.

use crate::disk::block::BlockStore;
use crate::error::{Error, Result};
use crate::transport::types::{Message, Rank, ShardId, TableId};

use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;

/// Server-side view of a table: every operation takes marshalled bytes.
pub trait UntypedTable: Send + Sync {
    fn id(&self) -> TableId;

    fn num_shards(&self) -> usize;

    /// Unconditional overwrite. Always succeeds unless the message is malformed.
    fn apply_put(&self, msg: &Message) -> Result<()>;

    /// Merge through the handler; `Ok(false)` asks for a retry, an update the handler
    /// rejects outright is an error.
    fn apply_update(&self, msg: &Message) -> Result<bool>;

    /// Marshalled value for the requester, or `Ok(None)` while not ready. A key the
    /// shard does not hold is [`Error::MissingKey`].
    fn handle_get(&self, msg: &Message) -> Result<Option<Vec<u8>>>;

    fn handle_contains(&self, msg: &Message) -> Result<bool>;

    fn assign_owner(&self, shard: ShardId, owner: Rank) -> Result<()>;

    fn owner(&self, shard: ShardId) -> Option<Rank>;

    fn is_assigned(&self) -> bool;

    /// Opens one checkpoint log per local shard under `dir`, restoring from existing
    /// logs first when `restore` is set.
    fn enable_checkpoints(&self, dir: &Path, restore: bool) -> Result<()>;

    fn sync_checkpoints(&self) -> Result<()>;

    /// Live entries across this process's shards.
    fn local_entries(&self) -> usize;
}

#[derive(Default)]
pub struct TableRegistry {
    tables: DashMap<TableId, Arc<dyn UntypedTable>>,
    disk_tables: DashMap<TableId, Arc<BlockStore>>,
}

impl TableRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, table: Arc<dyn UntypedTable>) -> Result<()> {
        let id = table.id();
        if self.tables.contains_key(&id) || self.disk_tables.contains_key(&id) {
            return Err(Error::Config(format!("table id {} registered twice", id)));
        }
        self.tables.insert(id, table);
        tracing::info!("Registered table {}", id);
        Ok(())
    }

    pub fn table(&self, id: TableId) -> Result<Arc<dyn UntypedTable>> {
        self.tables
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(Error::UnknownTable(id))
    }

    /// `(id, shard count)` of every in-memory table, ordered by id.
    pub fn shard_layout(&self) -> Vec<(TableId, usize)> {
        let mut layout: Vec<_> = self
            .tables
            .iter()
            .map(|entry| (*entry.key(), entry.value().num_shards()))
            .collect();
        layout.sort_unstable();
        layout
    }

    pub fn tables(&self) -> Vec<Arc<dyn UntypedTable>> {
        let mut tables: Vec<_> = self.tables.iter().map(|e| e.value().clone()).collect();
        tables.sort_by_key(|table| table.id());
        tables
    }

    pub fn register_disk(&self, store: Arc<BlockStore>) -> Result<()> {
        let id = store.id();
        if self.tables.contains_key(&id) || self.disk_tables.contains_key(&id) {
            return Err(Error::Config(format!("table id {} registered twice", id)));
        }
        self.disk_tables.insert(id, store);
        tracing::info!("Registered disk table {}", id);
        Ok(())
    }

    pub fn disk_table(&self, id: TableId) -> Result<Arc<BlockStore>> {
        self.disk_tables
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(Error::UnknownTable(id))
    }

    pub fn disk_tables(&self) -> Vec<Arc<BlockStore>> {
        self.disk_tables.iter().map(|e| e.value().clone()).collect()
    }

    pub fn all_assigned(&self) -> bool {
        self.tables.iter().all(|entry| entry.value().is_assigned())
    }

    pub fn len(&self) -> usize {
        self.tables.len() + self.disk_tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
