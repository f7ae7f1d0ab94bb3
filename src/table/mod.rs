//! Distributed Table Module
//!
//! Sharded in-memory key-value tables.
//!
//! ## Core Concepts
//! - **Sharding**: a pure `Sharder` maps each key to one of a table's fixed shards.
//! - **Ownership**: `PartitionInfo` records the single owner of every shard, assigned
//!   once by the coordinator at startup.
//! - **Storage**: each shard is a `LocalPartition`, an open-addressing hash table whose
//!   merge semantics come from a `MergeHandler`.
//! - **Access**: `GlobalTable` routes typed requests to the owning process and collects
//!   the responses; `TableRegistry` exposes tables by id to the request handlers.

pub mod collector;
pub mod global;
pub mod handler;
pub mod marshal;
pub mod partition;
pub mod registry;
pub mod types;
