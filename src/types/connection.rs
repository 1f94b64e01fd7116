//! Connection registry types (§3, §4.3) and the Settings Overlay (§3, §4.4).

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::LlmProvider;

/// The kind of physical store backing a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DatabaseKind {
    #[default]
    EmbeddedFile,
    Postgres,
}

impl DatabaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseKind::EmbeddedFile => "embedded-file",
            DatabaseKind::Postgres => "postgres",
        }
    }
}

impl FromStr for DatabaseKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "embedded-file" => Ok(DatabaseKind::EmbeddedFile),
            "postgres" => Ok(DatabaseKind::Postgres),
            _ => Err(format!("unknown database kind: {s}")),
        }
    }
}

/// Database parameters for a connection. `path` is meaningful for `embedded-file`;
/// `dsn` is meaningful for `postgres`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DatabaseConfig {
    pub kind: DatabaseKind,
    /// Relative paths resolve against the directory containing the registry file (§4.3).
    pub path: Option<String>,
    pub dsn: Option<String>,
}

/// Per-connection LLM configuration, overriding the process-level defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub model: String,
    pub embedding_model: String,
    pub endpoint: String,
    /// Never serialized back out in error text; see [`MementoError::redacted`].
    pub secret: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::Ollama,
            model: "llama3.1".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            endpoint: "http://localhost:11434".to_string(),
            secret: None,
        }
    }
}

/// A named logical workspace: {store handle, LLM config, taxonomy overlay}.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub name: String,
    pub display_name: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub category_template: Option<String>,
    pub categories: Vec<String>,
}

impl Connection {
    pub fn new(name: impl Into<String>, database: DatabaseConfig) -> Self {
        let name = name.into();
        Self {
            display_name: name.clone(),
            name,
            enabled: true,
            created_at: Utc::now(),
            database,
            llm: LlmConfig::default(),
            category_template: None,
            categories: Vec::new(),
        }
    }
}

/// Top-level shape of `connections.json` (§6.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionsRegistry {
    pub default_connection: String,
    pub connections: Vec<Connection>,
    pub settings: RegistrySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySettings {
    pub auto_create_default: bool,
    pub max_connections: usize,
    pub allow_user_create: bool,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            auto_create_default: true,
            max_connections: 32,
            allow_user_create: true,
        }
    }
}

impl Default for ConnectionsRegistry {
    fn default() -> Self {
        Self {
            default_connection: "default".to_string(),
            connections: Vec::new(),
            settings: RegistrySettings::default(),
        }
    }
}

/// A named taxonomy item (entity type, relationship type, or memory type id).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TaxonomyItem {
    pub id: String,
    pub label: String,
}

/// A named classification schema: a category name plus its set of allowed values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationSchema {
    pub category: String,
    pub values: Vec<String>,
}

/// Per-connection customization merged over system defaults at read time (§4.4).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SettingsOverlay {
    pub connection_id: String,
    pub custom_entity_types: Vec<TaxonomyItem>,
    pub custom_relationship_types: Vec<TaxonomyItem>,
    pub custom_memory_types: Vec<TaxonomyItem>,
    pub custom_classification_schemas: Vec<ClassificationSchema>,
    pub active_classification_category: Option<String>,
}

/// The merged view returned to callers: system defaults ∪ custom additions (§4.4).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MergedTaxonomy {
    pub all_entity_types: Vec<TaxonomyItem>,
    pub all_relationship_types: Vec<TaxonomyItem>,
    pub all_memory_types: Vec<TaxonomyItem>,
    pub all_classification_schemas: Vec<ClassificationSchema>,
}

/// A process-wide, store-backed settings map (§3 User Settings), upsert semantics.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UserSettings(pub HashMap<String, String>);
