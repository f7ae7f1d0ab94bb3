//! Message Transport Module
//!
//! Point-to-point message passing between the ranked processes of a job.
//!
//! ## Layers
//! - **`fabric`**: the raw substrate contract plus an in-process mesh (`MemoryFabric`).
//! - **`http`**: an `axum`/`reqwest` substrate for multi-host jobs.
//! - **`network`**: the per-process pump (`NetworkThread`) exposing `send`, `read`,
//!   `try_read`, `broadcast`, `sync_broadcast`, `flush` and `shutdown`.
//! - **`types`**: ranks, tags and the wire envelope.

pub mod fabric;
pub mod http;
pub mod network;
pub mod types;
