//! Process-level configuration, shared by both front ends.
//!
//! A `clap::Parser` struct with `env = "MEMENTO_..."` attributes and
//! sensible defaults, rather than a generic layered-config crate.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};

/// Security mode for the HTTP adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    Development,
    Production,
}

impl Default for SecurityMode {
    fn default() -> Self {
        SecurityMode::Development
    }
}

/// Default LLM provider used by connections that don't override it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    Ollama,
    Openai,
    Anthropic,
}

impl Default for LlmProvider {
    fn default() -> Self {
        LlmProvider::Ollama
    }
}

impl LlmProvider {
    /// Whether this provider is assumed to run on the same machine, and therefore
    /// contends for CPU/GPU with an embedded-file store (forces NumWorkers = 1, §5).
    pub fn is_local(&self) -> bool {
        matches!(self, LlmProvider::Ollama)
    }
}

/// Process-wide configuration, sourced from the environment with the `MEMENTO_` prefix.
#[derive(Parser, Debug, Clone)]
#[command(name = "memento")]
#[command(about = "Persistent memory service for AI assistants")]
#[command(version)]
pub struct Config {
    /// Root directory for stores and the event drop directory.
    #[arg(
        long,
        env = "MEMENTO_DATA_PATH",
        default_value = "~/.local/share/memento"
    )]
    pub data_path: String,

    /// HTTP adapter bind host. Defaults to loopback for safety.
    #[arg(long, env = "MEMENTO_BIND_HOST", default_value = "127.0.0.1")]
    pub bind_host: String,

    /// HTTP adapter bind port.
    #[arg(long, env = "MEMENTO_BIND_PORT", default_value_t = 8420)]
    pub bind_port: u16,

    /// Security mode: `production` requires a bearer token on `/api/*` except `/api/health`.
    #[arg(long, env = "MEMENTO_SECURITY_MODE", value_enum, default_value_t = SecurityMode::Development)]
    pub security_mode: SecurityMode,

    /// Bearer token compared in constant time when `security_mode = production`.
    #[arg(long, env = "MEMENTO_API_TOKEN", default_value = "")]
    pub api_token: String,

    /// Enrichment worker count. Overridden down to 1 for local-only LLM providers when
    /// the default connection is embedded-file backed.
    #[arg(long, env = "MEMENTO_NUM_WORKERS", default_value_t = 4)]
    pub num_workers: usize,

    /// Path to the connection registry file. Relative database paths in that file
    /// resolve against its parent directory, not the process working directory.
    #[arg(
        long,
        env = "MEMENTO_CONNECTIONS_CONFIG",
        default_value = "~/.config/memento/connections.json"
    )]
    pub connections_config_path: String,

    /// Default LLM provider for connections that don't specify their own.
    #[arg(long, env = "MEMENTO_LLM_PROVIDER", value_enum, default_value_t = LlmProvider::Ollama)]
    pub llm_provider: LlmProvider,

    /// Default extraction model name.
    #[arg(long, env = "MEMENTO_LLM_MODEL", default_value = "llama3.1")]
    pub llm_model: String,

    /// Default embedding model name.
    #[arg(long, env = "MEMENTO_EMBEDDING_MODEL", default_value = "nomic-embed-text")]
    pub embedding_model: String,

    /// Default LLM provider endpoint.
    #[arg(long, env = "MEMENTO_LLM_ENDPOINT", default_value = "http://localhost:11434")]
    pub llm_endpoint: String,

    /// Default LLM provider API key, if the provider requires one.
    #[arg(long, env = "MEMENTO_LLM_API_KEY", default_value = "")]
    pub llm_api_key: String,

    /// Log filter, passed to `tracing_subscriber::EnvFilter`.
    #[arg(long, env = "MEMENTO_LOG", default_value = "info")]
    pub log_filter: String,

    /// Comma-separated origins allowed to open a `/ws` connection. Empty
    /// (the default) allows any origin, a permissive default meant to be
    /// tightened in production deployments.
    #[arg(long, env = "MEMENTO_ALLOWED_ORIGINS", default_value = "")]
    pub allowed_origins: String,

    /// The connection the stdio front end serves. Empty resolves to the
    /// registry default; unused by the HTTP front end, which serves every
    /// registered connection behind a single process (§6.1).
    #[arg(long, env = "MEMENTO_CONNECTION", default_value = "")]
    pub connection: String,
}

impl Config {
    /// Resolve `data_path` to an absolute, tilde-expanded directory, creating it if absent.
    pub fn resolved_data_path(&self) -> crate::error::Result<PathBuf> {
        let expanded = shellexpand::tilde(&self.data_path).to_string();
        let path = PathBuf::from(expanded);
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// Resolve `connections_config_path` to an absolute, tilde-expanded file path,
    /// creating its parent directory if absent.
    pub fn resolved_connections_config_path(&self) -> crate::error::Result<PathBuf> {
        let expanded = shellexpand::tilde(&self.connections_config_path).to_string();
        let path = PathBuf::from(expanded);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(path)
    }

    /// The drop directory used for cross-process event fan-out: `<dataPath>/events/`.
    pub fn events_dir(&self) -> crate::error::Result<PathBuf> {
        let dir = self.resolved_data_path()?.join("events");
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Compare `api_token` against a presented bearer value in constant time.
    pub fn token_matches(&self, presented: &str) -> bool {
        constant_time_eq(self.api_token.as_bytes(), presented.as_bytes())
    }

    /// Whether a WebSocket `Origin` header is allowed to connect (§6.2). An
    /// empty allow-list permits any origin.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        if self.allowed_origins.is_empty() {
            return true;
        }
        match origin {
            Some(origin) => self.allowed_origins.split(',').any(|o| o.trim() == origin),
            None => false,
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_provider_detection() {
        assert!(LlmProvider::Ollama.is_local());
        assert!(!LlmProvider::Openai.is_local());
        assert!(!LlmProvider::Anthropic.is_local());
    }

    #[test]
    fn constant_time_eq_matches_equal_tokens() {
        assert!(constant_time_eq(b"secret-token", b"secret-token"));
        assert!(!constant_time_eq(b"secret-token", b"wrong-token!!"));
        assert!(!constant_time_eq(b"short", b"longer-value"));
    }
}
