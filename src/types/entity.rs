//! Entity/Relationship/Embedding types (§3), the graph side of the data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::MemoryId;

/// An extracted entity, scoped to a connection's active taxonomy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub name: String,
    /// Taxonomy type id (validated against the connection's active overlay at write time).
    pub entity_type: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Populated by graph reads (`GetEntityGraph`); not stored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_count: Option<i64>,
}

impl Entity {
    pub fn new(name: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            id: super::generate_id(),
            name: name.into(),
            entity_type: entity_type.into(),
            description: None,
            created_at: Utc::now(),
            memory_count: None,
        }
    }
}

/// A typed, directed edge between two entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    pub source_id: String,
    pub target_id: String,
    pub relationship_type: String,
    pub weight: f32,
    pub bidirectional: bool,
    pub created_at: DateTime<Utc>,
}

impl Relationship {
    pub fn new(
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        relationship_type: impl Into<String>,
    ) -> Self {
        Self {
            id: super::generate_id(),
            source_id: source_id.into(),
            target_id: target_id.into(),
            relationship_type: relationship_type.into(),
            weight: 1.0,
            bidirectional: false,
            created_at: Utc::now(),
        }
    }

    /// The endpoint reached when traversing from `from`, honoring `bidirectional`.
    pub fn other_end(&self, from: &str) -> Option<&str> {
        if self.source_id == from {
            Some(&self.target_id)
        } else if self.bidirectional && self.target_id == from {
            Some(&self.source_id)
        } else {
            None
        }
    }
}

/// One embedding row per (memory_id, model_name). At most one per pair; re-embedding replaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub memory_id: MemoryId,
    pub model_name: String,
    pub vector: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

impl Embedding {
    pub fn new(memory_id: MemoryId, model_name: impl Into<String>, vector: Vec<f32>) -> Self {
        Self {
            memory_id,
            model_name: model_name.into(),
            vector,
            created_at: Utc::now(),
        }
    }

    /// Serialize the vector to a little-endian byte blob, the same wire
    /// format reused verbatim for the Postgres `bytea` column.
    pub fn to_blob(&self) -> Vec<u8> {
        vector_to_blob(&self.vector)
    }

    pub fn from_blob(
        memory_id: MemoryId,
        model_name: impl Into<String>,
        blob: &[u8],
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            memory_id,
            model_name: model_name.into(),
            vector: vector_from_blob(blob),
            created_at,
        }
    }
}

/// Serialize an `f32` vector as little-endian bytes.
pub fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for f in vector {
        blob.extend_from_slice(&f.to_le_bytes());
    }
    blob
}

/// Deserialize a little-endian byte blob back into an `f32` vector. Trailing bytes
/// that don't form a full `f32` are ignored.
pub fn vector_from_blob(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// A counter entry for entity type names the active taxonomy doesn't recognize (§4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnknownTypeStat {
    pub type_name: String,
    pub count: i64,
    pub last_seen: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_blob_round_trips() {
        let original = vec![0.1_f32, -2.5, 3.333, 0.0];
        let blob = vector_to_blob(&original);
        assert_eq!(blob.len(), original.len() * 4);
        let decoded = vector_from_blob(&blob);
        assert_eq!(decoded, original);
    }

    #[test]
    fn bidirectional_relationship_traverses_both_ways() {
        let rel = Relationship {
            bidirectional: true,
            ..Relationship::new("e1", "e2", "related_to")
        };
        assert_eq!(rel.other_end("e1"), Some("e2"));
        assert_eq!(rel.other_end("e2"), Some("e1"));
        assert_eq!(rel.other_end("e3"), None);
    }

    #[test]
    fn directed_relationship_traverses_one_way() {
        let rel = Relationship::new("e1", "e2", "related_to");
        assert_eq!(rel.other_end("e1"), Some("e2"));
        assert_eq!(rel.other_end("e2"), None);
    }
}
