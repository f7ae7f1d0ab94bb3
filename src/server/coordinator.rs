//! Coordinator
//!
//! The last rank of the job. It owns no shards; it collects registrations, decides the
//! shard layout once, serves barriers and ends the job.
//!
//! ## Core Concepts
//! - **Registration**: every other process sends REGISTER_WORKER exactly once.
//! - **Assignment**: shards of every table, tables in id order, are dealt round-robin over
//!   the table servers in rank order. The result is broadcast as one SHARD_ASSIGNMENT and
//!   the coordinator waits for a SHARD_ASSIGNMENT_DONE from every process.
//! - **Shutdown**: after a WORKER_END from every process it broadcasts WORKER_SHUTDOWN.

use crate::context::ProcessContext;
use crate::error::{Error, Result};
use crate::table::types::ShardAssignment;
use crate::transport::types::{Message, Rank, ShardId, TableId, Tag};

use std::sync::Arc;

/// Shards held by one table server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerState {
    pub rank: Rank,
    pub shards: Vec<(TableId, ShardId)>,
}

/// Deals every `(table, shard)` pair over `servers` in turn.
///
/// `tables` holds `(id, shard count)` and is walked in the given order; the caller
/// passes it sorted by id so every coordinator computes the same layout.
pub fn assign_round_robin(servers: &[Rank], tables: &[(TableId, usize)]) -> Vec<ShardAssignment> {
    if servers.is_empty() {
        return Vec::new();
    }

    tables
        .iter()
        .flat_map(|&(table, shards)| (0..shards).map(move |shard| (table, shard as ShardId)))
        .enumerate()
        .map(|(i, (table, shard))| ShardAssignment {
            table,
            shard,
            owner: servers[i % servers.len()],
        })
        .collect()
}

pub struct Coordinator {
    ctx: Arc<ProcessContext>,
    servers: Vec<ServerState>,
}

impl Coordinator {
    pub fn new(ctx: Arc<ProcessContext>) -> Result<Self> {
        if !ctx.config().is_coordinator() {
            return Err(Error::Config(format!(
                "rank {} is not the coordinator",
                ctx.rank()
            )));
        }

        // Disk tables broadcast their end marker to every rank, this one included.
        let net = ctx.net().clone();
        ctx.dispatcher()
            .register(Tag::DataPutRequestFinish, move |msg: &Message| {
                net.send(msg.source, msg.reply(Tag::DataPutRequestDone))?;
                Ok(true)
            });

        Ok(Self {
            ctx,
            servers: Vec::new(),
        })
    }

    pub fn servers(&self) -> &[ServerState] {
        &self.servers
    }

    /// Waits for every process to register, assigns all shards and returns once every
    /// process has applied the assignment.
    pub async fn init_table_servers(&mut self) -> Result<Vec<ShardAssignment>> {
        let net = self.ctx.net();
        let config = self.ctx.config();
        let expected = config.size - 1;

        let mut registered = Vec::with_capacity(expected);
        for _ in 0..expected {
            let msg = net.read(None, Tag::RegisterWorker).await?;
            if registered.contains(&msg.source) {
                return Err(Error::ProtocolViolation(format!(
                    "rank {} registered twice",
                    msg.source
                )));
            }
            tracing::info!("Rank {} registered ({}/{})", msg.source, registered.len() + 1, expected);
            registered.push(msg.source);
        }

        let mut servers: Vec<Rank> = registered
            .into_iter()
            .filter(|&rank| config.is_table_server(rank))
            .collect();
        servers.sort_unstable();

        let registry = self.ctx.registry();
        let layout = registry.shard_layout();
        if servers.is_empty() && layout.iter().any(|&(_, shards)| shards > 0) {
            return Err(Error::Config("tables registered but no table servers".into()));
        }

        let assignments = assign_round_robin(&servers, &layout);
        for assignment in &assignments {
            registry
                .table(assignment.table)?
                .assign_owner(assignment.shard, assignment.owner)?;
        }

        self.servers = servers
            .iter()
            .map(|&rank| ServerState {
                rank,
                shards: assignments
                    .iter()
                    .filter(|a| a.owner == rank)
                    .map(|a| (a.table, a.shard))
                    .collect(),
            })
            .collect();
        for server in &self.servers {
            tracing::info!("Table server {} holds {} shards", server.rank, server.shards.len());
        }

        let msg = Message::new(Tag::ShardAssignment).with_payload(&assignments)?;
        net.sync_broadcast(msg, Tag::ShardAssignmentDone).await?;

        tracing::info!(
            "Assigned {} shards of {} tables over {} servers",
            assignments.len(),
            layout.len(),
            self.servers.len()
        );
        Ok(assignments)
    }

    /// Coordinator side of one barrier round: waits for a BARRIER_REQUEST from every
    /// process, then releases them all.
    pub async fn serve_barrier(&self) -> Result<()> {
        let net = self.ctx.net();
        for _ in 0..self.ctx.config().size - 1 {
            net.read(None, Tag::BarrierRequest).await?;
        }
        net.sync_broadcast(Message::new(Tag::BarrierReady), Tag::BarrierReply)
            .await?;
        tracing::debug!("Barrier released");
        Ok(())
    }

    /// Waits for a WORKER_END from every process, tells them to stop and stops this one.
    pub async fn wait_for_job_end(&self) -> Result<()> {
        let net = self.ctx.net();
        for done in 1..self.ctx.config().size {
            let msg = net.read(None, Tag::WorkerEnd).await?;
            tracing::info!("Rank {} finished ({}/{})", msg.source, done, self.ctx.config().size - 1);
        }

        net.broadcast(Message::new(Tag::WorkerShutdown))?;
        net.flush().await?;

        self.ctx.dispatcher().stop();
        net.shutdown()?;
        tracing::info!("Job finished");
        Ok(())
    }
}
