//! Delegate Module
//!
//! Worker-side access to parameter tables.
//!
//! ## Components
//! - **`param`**: the worker's parameter and the value stored per split.
//! - **`split`**: cuts a parameter into bounded, contiguous splits with stable keys.
//! - **`sgd`**: server-side merge handlers that apply gradients.
//! - **`table_delegate`**: put/update/get of whole parameters over a table.

pub mod param;
pub mod sgd;
pub mod split;
pub mod table_delegate;

#[cfg(test)]
mod tests;
