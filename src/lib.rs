//! Offline resilience for HTTP API clients.
//!
//! Requests sent through the sync layer keep working while the API is
//! unreachable: recent reads come from a local cache, writes wait in a durable
//! queue and are replayed in order once the connection is back.

pub mod config;
pub mod connectivity;
pub mod http;
pub mod logging;
pub mod sync;

#[cfg(test)]
mod testing;
