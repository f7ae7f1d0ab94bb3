//! Table Server
//!
//! Connects a process's tables to the dispatcher and the network thread.
//!
//! ## Responsibilities
//! - **Requests**: PUT (always succeeds), UPDATE and GET (handler-gated, may ask for a
//!   retry), CONTAINS and the disk-table data lane. Nothing is served before the shard
//!   assignment, checkpoint restore included, has been applied.
//! - **Bootstrap**: registers with the coordinator, applies the shard assignment, opens
//!   checkpoint logs for local shards and acknowledges. The assignment callback only
//!   hands the work to a blocking task, since a restore reads whole logs.
//! - **Shutdown**: reports WORKER_END and stops once the coordinator says so.

use crate::context::ProcessContext;
use crate::disk::block::DiskBlock;
use crate::error::{Error, Result};
use crate::table::types::ShardAssignment;
use crate::transport::types::{Message, Tag};

use std::sync::{Arc, Weak};
use tokio::sync::watch;

pub struct TableServer {
    ctx: Arc<ProcessContext>,
    assigned: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
}

impl TableServer {
    pub fn new(ctx: Arc<ProcessContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            assigned: watch::channel(false).0,
            shutdown: watch::channel(false).0,
        })
    }

    pub fn context(&self) -> &Arc<ProcessContext> {
        &self.ctx
    }

    /// Installs handlers and callbacks, then registers with the coordinator.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let dispatcher = self.ctx.dispatcher();
        let net = self.ctx.net();

        let server = Arc::downgrade(self);
        dispatcher.register(Tag::PutRequest, with_server(&server, Self::handle_put));
        dispatcher.register(Tag::UpdateRequest, with_server(&server, Self::handle_update));
        dispatcher.register(Tag::GetRequest, with_server(&server, Self::handle_get));
        dispatcher.register(Tag::ContainsRequest, with_server(&server, Self::handle_contains));
        dispatcher.register(Tag::DataPutRequest, with_server(&server, Self::handle_data_put));
        dispatcher.register(
            Tag::DataPutRequestFinish,
            with_server(&server, Self::handle_data_put_finish),
        );

        let weak = server.clone();
        net.register_callback(Tag::ShardAssignment, move |msg| {
            if let Some(server) = weak.upgrade() {
                tokio::spawn(server.on_shard_assignment(msg));
            }
        });
        let weak = server;
        net.register_callback(Tag::WorkerShutdown, move |_msg| {
            if let Some(server) = weak.upgrade() {
                server.shutdown.send_replace(true);
            }
        });

        let coordinator = self.ctx.config().coordinator();
        net.send(coordinator, Message::new(Tag::RegisterWorker))?;
        tracing::info!("Rank {} registered with coordinator {}", self.ctx.rank(), coordinator);
        Ok(())
    }

    fn is_assigned(&self) -> bool {
        *self.assigned.borrow()
    }

    fn handle_put(&self, msg: &Message) -> Result<bool> {
        // A peer may address us before our own assignment has been applied.
        if !self.is_assigned() {
            return Ok(false);
        }
        self.ctx.registry().table(msg.table)?.apply_put(msg)?;
        Ok(true)
    }

    fn handle_update(&self, msg: &Message) -> Result<bool> {
        if !self.is_assigned() {
            return Ok(false);
        }
        self.ctx.registry().table(msg.table)?.apply_update(msg)
    }

    fn handle_get(&self, msg: &Message) -> Result<bool> {
        if !self.is_assigned() {
            return Ok(false);
        }
        let table = self.ctx.registry().table(msg.table)?;
        let reply = match table.handle_get(msg) {
            Ok(Some(value)) => msg.reply(Tag::GetResponse).with_value(value),
            Ok(None) => return Ok(false),
            Err(Error::MissingKey) => {
                tracing::error!(
                    "Rank {} asked table {} shard {} for a key it does not hold",
                    msg.source,
                    msg.table,
                    msg.shard
                );
                msg.reply(Tag::KeyMissing)
            }
            Err(e) => return Err(e),
        };
        self.ctx.net().send(msg.source, reply)?;
        Ok(true)
    }

    fn handle_contains(&self, msg: &Message) -> Result<bool> {
        if !self.is_assigned() {
            return Ok(false);
        }
        let found = self.ctx.registry().table(msg.table)?.handle_contains(msg)?;
        let reply = msg.reply(Tag::ContainsResponse).with_payload(&found)?;
        self.ctx.net().send(msg.source, reply)?;
        Ok(true)
    }

    fn handle_data_put(&self, msg: &Message) -> Result<bool> {
        let block: DiskBlock = msg.payload()?;
        self.ctx.registry().disk_table(block.table)?.dump(&block)?;
        Ok(true)
    }

    fn handle_data_put_finish(&self, msg: &Message) -> Result<bool> {
        self.ctx.registry().disk_table(msg.table)?.finish()?;
        self.ctx
            .net()
            .send(msg.source, msg.reply(Tag::DataPutRequestDone))?;
        Ok(true)
    }

    async fn on_shard_assignment(self: Arc<Self>, msg: Message) {
        let server = self.clone();
        let source = msg.source;
        let applied = tokio::task::spawn_blocking(move || server.apply_assignment(&msg))
            .await
            .unwrap_or_else(|e| {
                Err(Error::ProtocolViolation(format!(
                    "shard assignment task failed: {}",
                    e
                )))
            });

        if let Err(e) = applied {
            tracing::error!("Rank {} rejected shard assignment: {}", self.ctx.rank(), e);
            self.ctx.dispatcher().stop();
            return;
        }

        self.assigned.send_replace(true);
        if let Err(e) = self
            .ctx
            .net()
            .send(source, Message::new(Tag::ShardAssignmentDone))
        {
            tracing::error!("Rank {} failed to acknowledge its shards: {}", self.ctx.rank(), e);
        }
    }

    fn apply_assignment(&self, msg: &Message) -> Result<()> {
        let assignments: Vec<ShardAssignment> = msg.payload()?;
        let registry = self.ctx.registry();

        for assignment in &assignments {
            registry
                .table(assignment.table)?
                .assign_owner(assignment.shard, assignment.owner)?;
        }
        if !registry.all_assigned() {
            return Err(Error::ProtocolViolation(
                "shard assignment leaves shards without owner".into(),
            ));
        }

        if let Some(dir) = &self.ctx.config().checkpoint_dir {
            for table in registry.tables() {
                table.enable_checkpoints(dir, self.ctx.config().restore)?;
            }
        }

        let local = assignments
            .iter()
            .filter(|a| a.owner == self.ctx.rank())
            .count();
        tracing::info!(
            "Rank {} received {} assignments, {} shards local",
            self.ctx.rank(),
            assignments.len(),
            local
        );
        Ok(())
    }

    /// Waits until the shard assignment has been applied.
    pub async fn wait_assigned(&self) -> Result<()> {
        let mut rx = self.assigned.subscribe();
        rx.wait_for(|assigned| *assigned)
            .await
            .map_err(|_| Error::ShutDown)?;
        Ok(())
    }

    /// Participant side of the generic barrier.
    pub async fn barrier(&self) -> Result<()> {
        let net = self.ctx.net();
        let coordinator = self.ctx.config().coordinator();

        net.send(coordinator, Message::new(Tag::BarrierRequest))?;
        net.read(Some(coordinator), Tag::BarrierReady).await?;
        net.send(coordinator, Message::new(Tag::BarrierReply))?;
        Ok(())
    }

    /// Reports the end of this process's work and stops once the coordinator replies.
    pub async fn shutdown(&self) -> Result<()> {
        let net = self.ctx.net();
        for table in self.ctx.registry().tables() {
            table.sync_checkpoints()?;
        }

        net.flush().await?;
        net.send(self.ctx.config().coordinator(), Message::new(Tag::WorkerEnd))?;
        net.flush().await?;

        let mut rx = self.shutdown.subscribe();
        rx.wait_for(|stop| *stop)
            .await
            .map_err(|_| Error::ShutDown)?;

        self.ctx.dispatcher().stop();
        net.flush().await?;
        net.shutdown()?;
        tracing::info!("Rank {} shut down", self.ctx.rank());
        Ok(())
    }
}

fn with_server(
    server: &Weak<TableServer>,
    handler: fn(&TableServer, &Message) -> Result<bool>,
) -> impl Fn(&Message) -> Result<bool> + Send + Sync + 'static {
    let server = server.clone();
    move |msg| match server.upgrade() {
        Some(server) => handler(&server, msg),
        None => Err(Error::ShutDown),
    }
}
