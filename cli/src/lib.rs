//! vpsdeck: session management for cloud VPS rentals.
//!
//! The library holds the engine the CLI and dashboard drive: variant
//! resolution, status classification, idempotent mutations, adaptive log
//! polling and the entity-scoped cache they share.

pub mod cache;
pub mod config;
pub mod consistency;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod idempotency;
pub mod lifecycle;
pub mod mutation;
pub mod poller;
pub mod transport;
pub mod variant;

#[cfg(test)]
mod test_support;

pub use engine::Engine;
pub use error::{EngineError, EngineResult, ErrorKind};
