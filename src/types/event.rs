//! The transient lifecycle Event (§3), shared by the in-process hub and the
//! cross-process drop directory.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::MemoryId;

/// Event kind. The engine emits these in definition order for a given memory id
/// (§4.2, §5): created → enrichment_started → enrichment_complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    MemoryCreated,
    EnrichmentStarted,
    EnrichmentComplete,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::MemoryCreated => "memory_created",
            EventType::EnrichmentStarted => "enrichment_started",
            EventType::EnrichmentComplete => "enrichment_complete",
        }
    }

    /// This type's position in the fixed definition order, used to check
    /// invariant 4 (§8): per-id event subsequences are a prefix of this order.
    pub fn sequence_index(&self) -> u8 {
        match self {
            EventType::MemoryCreated => 0,
            EventType::EnrichmentStarted => 1,
            EventType::EnrichmentComplete => 2,
        }
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory_created" => Ok(EventType::MemoryCreated),
            "enrichment_started" => Ok(EventType::EnrichmentStarted),
            "enrichment_complete" => Ok(EventType::EnrichmentComplete),
            _ => Err(format!("unknown event type: {s}")),
        }
    }
}

/// `{type, memory_id, time_ns}` (§3). Transient; no durable history beyond the
/// drop directory's best-effort files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub memory_id: MemoryId,
    pub time_ns: i128,
}

impl Event {
    pub fn now(event_type: EventType, memory_id: MemoryId) -> Self {
        Self {
            event_type,
            memory_id,
            time_ns: chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default() as i128,
        }
    }

    /// The drop-directory filename for this event: `<unix_nanos>-<sanitized_memory_id>.event`.
    /// `:` and `/` in the id are replaced with `_` to produce a safe filename (§4.2).
    pub fn drop_filename(&self) -> String {
        let sanitized: String = self
            .memory_id
            .as_str()
            .chars()
            .map(|c| if c == ':' || c == '/' { '_' } else { c })
            .collect();
        format!("{}-{}.event", self.time_ns, sanitized)
    }
}

/// Wire payload for a single drop-directory file: `{type, memory_id, time}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFilePayload {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub memory_id: String,
    pub time: i128,
}

impl From<&Event> for EventFilePayload {
    fn from(event: &Event) -> Self {
        Self {
            event_type: event.event_type,
            memory_id: event.memory_id.as_str().to_string(),
            time: event.time_ns,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_filename_sanitizes_colons_and_slashes() {
        let event = Event {
            event_type: EventType::MemoryCreated,
            memory_id: MemoryId::from_parts("work/proj", "abc"),
            time_ns: 12345,
        };
        let name = event.drop_filename();
        assert_eq!(name, "12345-mem_work_proj_abc.event");
        assert!(!name.contains(':'));
        assert!(!name.contains('/'));
    }

    #[test]
    fn sequence_index_orders_event_types() {
        assert!(EventType::MemoryCreated.sequence_index() < EventType::EnrichmentStarted.sequence_index());
        assert!(
            EventType::EnrichmentStarted.sequence_index() < EventType::EnrichmentComplete.sequence_index()
        );
    }
}
