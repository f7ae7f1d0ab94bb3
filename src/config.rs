//! Process Configuration
//!
//! Every tunable used by the table subsystem lives in [`Config`]. A config is normally
//! read from a JSON file shared by the whole job, then specialised per process through
//! `PARAM_TABLE_*` environment variables (most commonly `PARAM_TABLE_RANK`).

use crate::error::{Error, Result};
use crate::transport::types::Rank;

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Rank of this process in `[0, size)`.
    pub rank: Rank,
    /// Total number of processes, coordinator included.
    pub size: usize,
    /// Ranks `[0, num_table_servers)` host table shards.
    pub num_table_servers: usize,
    /// Number of replicated worker groups (N of the synchronous protocol).
    pub num_groups: usize,
    /// Selects the N-put/N-get queue instead of the per-key FIFO queue.
    pub synchronous: bool,
    pub splits_per_server: usize,
    /// Hard cap on the number of floats carried by one split.
    pub max_split_len: usize,
    /// Records per DATA_PUT_REQUEST message.
    pub table_buffer: usize,
    /// Records per disk block before the block number rotates.
    pub block_records: usize,
    /// Capacity of the bounded buffer between disk threads and their consumer.
    pub prefetch_blocks: usize,
    pub data_dir: PathBuf,
    pub checkpoint_dir: Option<PathBuf>,
    /// Rebuild local partitions from existing checkpoint logs after shard assignment.
    pub restore: bool,
    /// Sleep applied when a whole round of the dispatcher only produced requeues.
    pub requeue_backoff_ms: u64,
    /// Message endpoint of every rank, indexed by rank (HTTP substrate only).
    pub peers: Vec<SocketAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rank: 0,
            size: 1,
            num_table_servers: 0,
            num_groups: 1,
            synchronous: false,
            splits_per_server: 1,
            max_split_len: 1 << 20,
            table_buffer: 100,
            block_records: 10_000,
            prefetch_blocks: 4,
            data_dir: std::env::temp_dir().join("param_table"),
            checkpoint_dir: None,
            restore: false,
            requeue_backoff_ms: 1,
            peers: Vec::new(),
        }
    }
}

impl Config {
    /// Loads a config from a JSON file. Missing fields fall back to their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Applies `PARAM_TABLE_RANK`, `PARAM_TABLE_DATA_DIR` and `PARAM_TABLE_CHECKPOINT_DIR`.
    pub fn apply_env(mut self) -> Result<Self> {
        if let Ok(rank) = std::env::var("PARAM_TABLE_RANK") {
            self.rank = rank
                .parse()
                .map_err(|e| Error::Config(format!("PARAM_TABLE_RANK={}: {}", rank, e)))?;
        }
        if let Ok(dir) = std::env::var("PARAM_TABLE_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("PARAM_TABLE_CHECKPOINT_DIR") {
            self.checkpoint_dir = Some(PathBuf::from(dir));
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(Error::Config("size must be at least 1".into()));
        }
        if self.rank >= self.size {
            return Err(Error::Config(format!(
                "rank {} outside [0, {})",
                self.rank, self.size
            )));
        }
        if self.num_table_servers > self.size.saturating_sub(1) {
            return Err(Error::Config(format!(
                "{} table servers do not fit in {} non-coordinator ranks",
                self.num_table_servers,
                self.size - 1
            )));
        }
        if self.num_groups == 0 {
            return Err(Error::Config("num_groups must be at least 1".into()));
        }
        if self.table_buffer == 0 || self.block_records == 0 || self.prefetch_blocks == 0 {
            return Err(Error::Config("disk table sizes must be positive".into()));
        }
        if !self.peers.is_empty() && self.peers.len() != self.size {
            return Err(Error::Config(format!(
                "{} peer addresses given for {} ranks",
                self.peers.len(),
                self.size
            )));
        }
        Ok(())
    }

    /// The coordinator is always the last rank.
    pub fn coordinator(&self) -> Rank {
        self.size - 1
    }

    pub fn is_coordinator(&self) -> bool {
        self.rank == self.coordinator()
    }

    pub fn table_servers(&self) -> Vec<Rank> {
        (0..self.num_table_servers).collect()
    }

    pub fn is_table_server(&self, rank: Rank) -> bool {
        rank < self.num_table_servers
    }

    /// Threshold stamped on outgoing puts/updates: the group count in synchronous mode.
    pub fn update_threshold(&self) -> u32 {
        if self.synchronous {
            self.num_groups as u32
        } else {
            1
        }
    }

    pub fn requeue_backoff(&self) -> Duration {
        Duration::from_millis(self.requeue_backoff_ms)
    }

    /// Convenience constructor used by in-process clusters.
    pub fn for_rank(&self, rank: Rank) -> Self {
        Self {
            rank,
            ..self.clone()
        }
    }
}
