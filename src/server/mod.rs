//! Server Module
//!
//! The two process roles of a job.
//!
//! ## Components
//! - **`table_server`**: runs on every non-coordinator rank. Serves table requests for
//!   the shards it owns and answers the coordinator's control messages.
//! - **`coordinator`**: the last rank. Assigns shards, serves barriers and ends the job.

pub mod coordinator;
pub mod table_server;
