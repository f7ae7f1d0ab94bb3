//! Partitioned Parameter Table Library
//!
//! A distributed, sharded in-memory key/value table for parameter-server style
//! training. Table servers own shards, workers read and update parameters through
//! typed tables, and a coordinator decides the shard layout once per job.
//!
//! ## Architecture Modules
//! - **`transport`**: the wire envelope, the point-to-point substrates (in-process mesh
//!   and HTTP) and the per-process network thread that demultiplexes by tag.
//! - **`table`**: local partitions, merge handlers, codecs and sharders, and the
//!   `GlobalTable` that routes requests to shard owners.
//! - **`queue`**: the per-key consistency queues (async FIFO and synchronous
//!   N-put/N-get) and the dispatcher that serves them.
//! - **`disk`**: the backward-scannable checkpoint log and the block-based disk table.
//! - **`server`**: the table server and coordinator roles, bootstrap and shutdown.
//! - **`delegate`**: splitting large parameters into table entries, and the SGD and
//!   AdaGrad handlers that apply gradients on the servers.
//! - **`context`** / **`config`**: per-process wiring and job configuration.

pub mod config;
pub mod context;
pub mod delegate;
pub mod disk;
pub mod error;
pub mod queue;
pub mod server;
pub mod table;
pub mod transport;

pub(crate) mod sync;
