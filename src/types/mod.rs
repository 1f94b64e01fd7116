//! The Memento data model (§3): Memory, Entity, Relationship, Embedding,
//! Connection, Settings Overlay, User Settings, and Event.

mod connection;
mod entity;
mod event;
mod memory;

pub use connection::*;
pub use entity::*;
pub use event::*;
pub use memory::*;

use rand::Rng;

/// Generate a short unique slug for a new memory id, built on `uuid` for
/// unique tokens but truncated to stay compact.
pub fn generate_slug() -> String {
    let uuid = uuid::Uuid::new_v4();
    uuid.simple().to_string()[..12].to_string()
}

/// Generate an opaque entity/relationship id.
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Sample a float in `[0, 1)`, used by implementer-discretion backoff jitter.
pub fn jitter_fraction() -> f64 {
    rand::thread_rng().gen_range(0.0..1.0)
}
