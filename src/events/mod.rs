//! Event Bus (C2, §4.2): an in-process hub for live subscribers (WebSocket
//! clients, the stdio adapter) plus a cross-process drop directory for
//! readers in other processes. Restructured from a `tokio::sync::broadcast`
//! manager into a single-serializer-task shape: a plain broadcast channel is
//! lossy for *all* subscribers equally, where this hub wants a per-subscriber
//! bounded queue that drops only the slow one.

pub mod dropdir;
pub mod hub;

pub use hub::EventHub;

use crate::types::{Event, MemoryId};
use crate::types::EventType;

/// Construct the three lifecycle events the engine emits, in definition
/// order, for a single memory (§4.2, §5).
pub fn memory_created(id: MemoryId) -> Event {
    Event::now(EventType::MemoryCreated, id)
}

pub fn enrichment_started(id: MemoryId) -> Event {
    Event::now(EventType::EnrichmentStarted, id)
}

pub fn enrichment_complete(id: MemoryId) -> Event {
    Event::now(EventType::EnrichmentComplete, id)
}
