//! Memento - persistent memory service for AI assistants.
//!
//! Provides the memory lifecycle engine and multi-connection storage/event
//! layer: durable, enriched, searchable records submitted over a JSON-RPC
//! stdio front end or an HTTP/WebSocket front end.

pub mod config;
pub mod connections;
pub mod enrichment;
pub mod error;
pub mod events;
pub mod http;
pub mod mcp;
pub mod search;
pub mod storage;
pub mod types;

pub use config::Config;
pub use connections::ConnectionManager;
pub use enrichment::MemoryEngine;
pub use error::{MementoError, Result};
pub use storage::Store;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
