//! Per-Process Context
//!
//! Built once at startup and handed to every component that needs the network thread,
//! the dispatcher, the table registry or the response collector. Nothing in the crate
//! reaches these through global state.

use crate::config::Config;
use crate::disk::block::{BlockStore, DiskTableDescriptor};
use crate::disk::disk_table::DiskTable;
use crate::error::{Error, Result};
use crate::queue::consistency::{AsyncQueue, RequestQueue, SyncQueue};
use crate::queue::dispatcher::Dispatcher;
use crate::table::collector::Collector;
use crate::table::global::GlobalTable;
use crate::table::registry::TableRegistry;
use crate::table::types::TableDescriptor;
use crate::transport::fabric::{Fabric, Inbox, MemoryFabric};
use crate::transport::network::NetworkThread;
use crate::transport::types::{Rank, TableId};

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::hash::Hash;
use std::sync::Arc;

pub struct ProcessContext {
    config: Arc<Config>,
    net: Arc<NetworkThread>,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<TableRegistry>,
    collector: Arc<Collector>,
}

impl ProcessContext {
    /// Wires the process together and starts the network and dispatcher loops.
    pub async fn start(config: Config, fabric: Arc<dyn Fabric>, inbox: Inbox) -> Result<Arc<Self>> {
        config.validate()?;
        if fabric.rank() != config.rank || fabric.size() != config.size {
            return Err(Error::Config(format!(
                "substrate is rank {} of {}, config says rank {} of {}",
                fabric.rank(),
                fabric.size(),
                config.rank,
                config.size
            )));
        }

        let queue: Box<dyn RequestQueue> = if config.synchronous {
            Box::new(SyncQueue::new(config.num_groups))
        } else {
            Box::new(AsyncQueue::fifo())
        };
        let dispatcher = Dispatcher::new(queue, config.requeue_backoff());

        let net = NetworkThread::new(fabric, inbox);
        net.set_request_sink(dispatcher.clone());
        let collector = Collector::new(net.clone());

        net.clone().start().await;
        dispatcher.clone().start().await;

        tracing::info!(
            "Process {} of {} up ({} mode, {} table servers)",
            config.rank,
            config.size,
            if config.synchronous { "sync" } else { "async" },
            config.num_table_servers
        );

        Ok(Arc::new(Self {
            config: Arc::new(config),
            net,
            dispatcher,
            registry: TableRegistry::new(),
            collector,
        }))
    }

    /// Starts every rank of `config.size` in this runtime over an in-process mesh.
    pub async fn local_cluster(config: &Config) -> Result<Vec<Arc<Self>>> {
        let mut contexts = Vec::with_capacity(config.size);
        for (rank, (fabric, inbox)) in MemoryFabric::mesh(config.size).into_iter().enumerate() {
            contexts.push(Self::start(config.for_rank(rank), fabric, inbox).await?);
        }
        Ok(contexts)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn rank(&self) -> Rank {
        self.net.rank()
    }

    pub fn net(&self) -> &Arc<NetworkThread> {
        &self.net
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn registry(&self) -> &Arc<TableRegistry> {
        &self.registry
    }

    pub fn collector(&self) -> &Arc<Collector> {
        &self.collector
    }

    /// Creates and registers an in-memory table. Every process must create the same
    /// tables before the coordinator assigns shards.
    pub fn create_table<K, V>(&self, descriptor: TableDescriptor<K, V>) -> Result<Arc<GlobalTable<K, V>>>
    where
        K: Hash + Eq + Clone + Send + 'static,
        V: Clone + Send + 'static,
    {
        descriptor.validate()?;
        let table = GlobalTable::new(
            descriptor,
            self.net.clone(),
            self.dispatcher.clone(),
            self.collector.clone(),
            self.config.update_threshold(),
        )?;
        self.registry.register(table.clone())?;
        Ok(table)
    }

    /// Disk table descriptor with this process's data directory and buffer sizes.
    pub fn disk_descriptor(&self, id: TableId, name_prefix: &str) -> DiskTableDescriptor {
        DiskTableDescriptor {
            block_records: self.config.block_records,
            buffer_records: self.config.table_buffer,
            prefetch_blocks: self.config.prefetch_blocks,
            ..DiskTableDescriptor::new(id, name_prefix, &self.config.data_dir)
        }
    }

    /// Registers the receiving side of a disk table and returns its client.
    pub fn create_disk_table<K, V>(&self, descriptor: DiskTableDescriptor) -> Result<DiskTable<K, V>>
    where
        K: Serialize + DeserializeOwned + 'static,
        V: Serialize + DeserializeOwned + 'static,
    {
        self.registry
            .register_disk(Arc::new(BlockStore::new(descriptor.clone())))?;
        DiskTable::new(descriptor, self.net.clone(), self.config.table_servers())
    }
}
