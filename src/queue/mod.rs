//! Request Queue & Dispatch Module
//!
//! Everything between "a request arrived" and "a handler ran".
//!
//! ## Architecture Overview
//! 1. **Submission**: the network thread (remote requests) and `GlobalTable` (local
//!    requests) submit into the `Dispatcher`, which implements `RequestSink`.
//! 2. **Ordering**: the consistency queue (`AsyncQueue` or `SyncQueue`) holds requests
//!    per key and decides which one may be served next.
//! 3. **Execution**: a single dispatch loop invokes the handler registered for the
//!    request's tag and requeues requests whose handler reports "not ready".
//!
//! ## Submodules
//! - **`consistency`**: the per-key queue protocols.
//! - **`dispatcher`**: handler registry and the dispatch loop.
//! - **`types`**: queue keys and phases.

pub mod consistency;
pub mod dispatcher;
pub mod types;

#[cfg(test)]
mod tests;
