//! Error Types
//!
//! One error enum shared by every subsystem. Orchestration code (the node binary,
//! bootstrap helpers) wraps these in `anyhow::Error`; library code returns them directly.

use crate::transport::types::{Tag, TableId};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A producer or peer broke the message protocol (queue overflow, bad assignment, ...).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("unknown table id {0}")]
    UnknownTable(TableId),

    #[error("no handler registered for tag {0:?}")]
    UnknownHandler(Tag),

    #[error("key not present in partition")]
    MissingKey,

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A checkpoint log or block file does not follow the on-disk layout.
    #[error("corrupt data: {0}")]
    Corrupt(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("transport has shut down")]
    ShutDown,

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
