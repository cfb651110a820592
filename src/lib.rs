//! Motobus - resilient broker consumption
//!
//! Keeps independently owned data stores eventually consistent by consuming
//! domain events and chunked file transfers from a message broker, with
//! bounded retries, a poison queue and delay-based backoff before a message
//! is dropped.

pub mod bus;
pub mod config;
pub mod consumer;
pub mod handlers;
pub mod poison;
pub mod publisher;
pub mod reassembly;
pub mod retry;
pub mod runtime;
pub mod utils;
pub mod wire;

#[cfg(test)]
pub(crate) mod test_utils;
