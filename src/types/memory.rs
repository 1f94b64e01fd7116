//! The Memory record and its lifecycle states (§3).

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A stable memory identifier of the form `mem:<domain>:<slug>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryId(String);

impl MemoryId {
    /// Build an id for `domain` with a freshly generated slug.
    pub fn new(domain: &str) -> Self {
        Self(format!("mem:{domain}:{}", super::generate_slug()))
    }

    /// Build an id from an explicit domain and slug (used by imports and tests).
    pub fn from_parts(domain: &str, slug: &str) -> Self {
        Self(format!("mem:{domain}:{slug}"))
    }

    /// The domain segment (selects the owning connection).
    pub fn domain(&self) -> &str {
        self.0
            .splitn(3, ':')
            .nth(1)
            .unwrap_or_default()
    }

    /// The slug segment.
    pub fn slug(&self) -> &str {
        self.0.splitn(3, ':').nth(2).unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for MemoryId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("mem"), Some(domain), Some(slug)) if !domain.is_empty() && !slug.is_empty() => {
                Ok(Self::from_parts(domain, slug))
            }
            _ => Err(format!("invalid memory id: {s}")),
        }
    }
}

impl From<String> for MemoryId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Overall memory lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MemoryStatus {
    #[default]
    Pending,
    Processing,
    Enriched,
    Failed,
    Archived,
}

impl MemoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryStatus::Pending => "pending",
            MemoryStatus::Processing => "processing",
            MemoryStatus::Enriched => "enriched",
            MemoryStatus::Failed => "failed",
            MemoryStatus::Archived => "archived",
        }
    }
}

impl FromStr for MemoryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(MemoryStatus::Pending),
            "processing" => Ok(MemoryStatus::Processing),
            "enriched" => Ok(MemoryStatus::Enriched),
            "failed" => Ok(MemoryStatus::Failed),
            "archived" => Ok(MemoryStatus::Archived),
            _ => Err(format!("unknown memory status: {s}")),
        }
    }
}

/// Per-stage enrichment state (entities / relationships / embedding).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    InProgress,
    Done,
    Failed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::InProgress => "in_progress",
            StageStatus::Done => "done",
            StageStatus::Failed => "failed",
        }
    }
}

impl FromStr for StageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(StageStatus::Pending),
            "in_progress" => Ok(StageStatus::InProgress),
            "done" => Ok(StageStatus::Done),
            "failed" => Ok(StageStatus::Failed),
            _ => Err(format!("unknown stage status: {s}")),
        }
    }
}

/// A durable memory record (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: MemoryId,
    pub content: String,
    pub source: Option<String>,
    pub tags: Vec<String>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: Option<String>,
    pub importance: f32,
    pub access_count: i64,
    pub decay_score: f32,
    pub status: MemoryStatus,
    pub entity_status: StageStatus,
    pub relationship_status: StageStatus,
    pub embedding_status: StageStatus,
    pub enrichment_attempts: i64,
    pub enrichment_error: Option<String>,
    pub enriched_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Memory {
    /// Construct a freshly-written memory in the `Pending` state, as the engine
    /// does on the client-visible write path.
    pub fn new(domain: &str, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: MemoryId::new(domain),
            content: content.into(),
            source: None,
            tags: Vec::new(),
            metadata: HashMap::new(),
            timestamp: now,
            created_at: now,
            updated_at: now,
            created_by: None,
            importance: 0.5,
            access_count: 0,
            decay_score: 1.0,
            status: MemoryStatus::Pending,
            entity_status: StageStatus::Pending,
            relationship_status: StageStatus::Pending,
            embedding_status: StageStatus::Pending,
            enrichment_attempts: 0,
            enrichment_error: None,
            enriched_at: None,
            deleted_at: None,
        }
    }

    /// Invariant 1 (§8): status = Enriched iff all three stage statuses = Done.
    pub fn is_consistent(&self, max_retries: i64) -> bool {
        let enriched_iff_all_done = (self.status == MemoryStatus::Enriched)
            == (self.entity_status == StageStatus::Done
                && self.relationship_status == StageStatus::Done
                && self.embedding_status == StageStatus::Done);
        let failed_implies_attempts = self.status != MemoryStatus::Failed
            || (self.enrichment_attempts >= max_retries
                && (self.entity_status == StageStatus::Failed
                    || self.relationship_status == StageStatus::Failed
                    || self.embedding_status == StageStatus::Failed));
        let timestamps_ordered = self.created_at <= self.updated_at;
        let enriched_at_implies_terminal = self.enriched_at.is_none()
            || matches!(self.status, MemoryStatus::Enriched | MemoryStatus::Failed);
        enriched_iff_all_done
            && failed_implies_attempts
            && timestamps_ordered
            && enriched_at_implies_terminal
    }
}

/// Narrow update applied by the engine mid-enrichment (`UpdateEnrichment`, §4.1).
/// Only `Some` fields are written; everything else is left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrichmentPatch {
    pub entity_status: Option<StageStatus>,
    pub relationship_status: Option<StageStatus>,
    pub embedding_status: Option<StageStatus>,
    pub status: Option<MemoryStatus>,
    pub enrichment_attempts: Option<i64>,
    pub enrichment_error: Option<Option<String>>,
    pub enriched_at: Option<Option<DateTime<Utc>>>,
}

/// Mutable fields a client may edit via `Update` (content/tags/metadata/importance).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryEdit {
    pub content: Option<String>,
    pub source: Option<String>,
    pub tags: Option<Vec<String>>,
    pub metadata: Option<HashMap<String, serde_json::Value>>,
    pub importance: Option<f32>,
}

/// Sort key for `List`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    CreatedAt,
    UpdatedAt,
    Importance,
    DecayScore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Desc,
    Asc,
}

/// Implementation-defined ceiling on page size (§4.1).
pub const MAX_PAGE_LIMIT: i64 = 1000;

/// Paginated list options (§4.1 `List(opts)`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListOptions {
    pub domain: Option<String>,
    pub status: Option<MemoryStatus>,
    pub tags: Option<Vec<String>>,
    pub sort_key: SortKey,
    pub sort_direction: SortDirection,
    pub limit: i64,
    pub offset: i64,
}

impl ListOptions {
    /// Clamp `limit` to `(0, MAX_PAGE_LIMIT]`, defaulting to 50 when unset.
    pub fn clamped_limit(&self) -> i64 {
        if self.limit <= 0 {
            50
        } else {
            self.limit.min(MAX_PAGE_LIMIT)
        }
    }
}

/// A page of results (§4.1 `List` return shape).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub limit: i64,
    pub has_more: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_id_round_trips() {
        let id = MemoryId::from_parts("work", "abc123");
        assert_eq!(id.domain(), "work");
        assert_eq!(id.slug(), "abc123");
        assert_eq!(id.to_string(), "mem:work:abc123");
        let parsed: MemoryId = "mem:work:abc123".parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn memory_id_rejects_malformed_input() {
        assert!("not-a-memory-id".parse::<MemoryId>().is_err());
        assert!("mem:onlydomain".parse::<MemoryId>().is_err());
        assert!("mem::slug".parse::<MemoryId>().is_err());
    }

    #[test]
    fn new_memory_is_pending_and_consistent() {
        let m = Memory::new("default", "hello world");
        assert_eq!(m.status, MemoryStatus::Pending);
        assert!(m.is_consistent(3));
    }

    #[test]
    fn enriched_requires_all_stages_done() {
        let mut m = Memory::new("default", "hello world");
        m.status = MemoryStatus::Enriched;
        m.entity_status = StageStatus::Done;
        m.relationship_status = StageStatus::Done;
        m.embedding_status = StageStatus::Pending;
        assert!(!m.is_consistent(3));
        m.embedding_status = StageStatus::Done;
        assert!(m.is_consistent(3));
    }

    #[test]
    fn failed_requires_attempts_at_ceiling_and_a_failed_stage() {
        let mut m = Memory::new("default", "hello world");
        m.status = MemoryStatus::Failed;
        m.enrichment_attempts = 1;
        m.embedding_status = StageStatus::Failed;
        assert!(!m.is_consistent(3));
        m.enrichment_attempts = 3;
        assert!(m.is_consistent(3));
    }

    #[test]
    fn clamped_limit_defaults_and_caps() {
        let mut opts = ListOptions::default();
        assert_eq!(opts.clamped_limit(), 50);
        opts.limit = 5000;
        assert_eq!(opts.clamped_limit(), MAX_PAGE_LIMIT);
        opts.limit = 10;
        assert_eq!(opts.clamped_limit(), 10);
    }
}
