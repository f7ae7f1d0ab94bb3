//! Disk Storage Module
//!
//! On-disk counterparts of the in-memory tables.
//!
//! ## Components
//! - **`checkpoint`**: the append-only, backward-scannable shard log used to restore
//!   partitions after a restart.
//! - **`block`**: block files and the server-side `BlockStore` that persists incoming blocks.
//! - **`disk_table`**: the client-side `DiskTable` with its writer and loader tasks.

pub mod block;
pub mod checkpoint;
pub mod disk_table;

#[cfg(test)]
mod tests;
