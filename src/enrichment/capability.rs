//! External capability interfaces the engine consumes (§6.3): an LLM-backed
//! entity/relationship extractor, an embedder, and agent-identity detection.
//! The concrete Ollama/OpenAI/Anthropic clients are out of scope (§1) — this
//! module defines the trait seams plus a dependency-free naive fallback used
//! when no provider is configured, and deterministic fakes for tests.

use async_trait::async_trait;

use crate::error::Result;

/// `extract_entities`/`extract_relationships` over raw memory content (§6.3).
/// Timeouts and per-call provider errors are the caller's concern; this trait
/// only returns `Result` for errors the stage should record as a failure.
#[async_trait]
pub trait LlmExtractor: Send + Sync {
    async fn extract_entities(&self, content: &str) -> Result<Vec<(String, String)>>;

    async fn extract_relationships(
        &self,
        content: &str,
        entities: &[(String, String)],
    ) -> Result<Vec<(String, String, String, f32)>>;
}

/// `embed(text) -> vector` (§6.3).
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn model_name(&self) -> &str;
}

/// `detect_agent(request_ctx) -> string`, used to default `created_by` when
/// the client omits it (§6.3).
pub trait AgentIdentity: Send + Sync {
    fn detect_agent(&self, user_agent: Option<&str>) -> String;
}

/// Falls back to `"unknown"` unless the caller supplies a recognizable
/// `User-Agent`/client id string.
pub struct DefaultAgentIdentity;

impl AgentIdentity for DefaultAgentIdentity {
    fn detect_agent(&self, user_agent: Option<&str>) -> String {
        user_agent.map(str::to_string).unwrap_or_else(|| "unknown".to_string())
    }
}

/// Capitalized-multi-word heuristic extractor used when no real LLM provider
/// is wired up. Not a substitute for a provider: entity `type` is always
/// `"concept"`, and no relationships are ever proposed (callers relying on
/// actual taxonomy coverage should configure a real `LlmExtractor`).
pub struct NaiveExtractor;

#[async_trait]
impl LlmExtractor for NaiveExtractor {
    async fn extract_entities(&self, content: &str) -> Result<Vec<(String, String)>> {
        let mut found = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        for word in content.split_whitespace() {
            let trimmed = word.trim_matches(|c: char| !c.is_alphanumeric());
            let starts_upper = trimmed.chars().next().map(|c| c.is_uppercase()).unwrap_or(false);
            if starts_upper && trimmed.len() > 1 {
                current.push(trimmed);
            } else if !current.is_empty() {
                found.push(current.join(" "));
                current.clear();
            }
        }
        if !current.is_empty() {
            found.push(current.join(" "));
        }
        found.sort();
        found.dedup();
        Ok(found.into_iter().map(|name| (name, "concept".to_string())).collect())
    }

    async fn extract_relationships(
        &self,
        _content: &str,
        _entities: &[(String, String)],
    ) -> Result<Vec<(String, String, String, f32)>> {
        Ok(Vec::new())
    }
}

/// Deterministic hash-based embedder: stable across runs, needs no network,
/// and is dimensionally consistent for a fixed `dimensions`.
pub struct HashEmbedder {
    model: String,
    dimensions: usize,
}

impl HashEmbedder {
    pub fn new(model: impl Into<String>, dimensions: usize) -> Self {
        Self { model: model.into(), dimensions }
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimensions];
        for (i, byte) in text.bytes().enumerate() {
            let slot = i % self.dimensions;
            vector[slot] += (byte as f32 - 128.0) / 128.0;
        }
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in vector.iter_mut() {
                *v /= norm;
            }
        }
        Ok(vector)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn naive_extractor_finds_capitalized_phrases() {
        let extractor = NaiveExtractor;
        let entities = extractor
            .extract_entities("Go is a compiled language created at Google")
            .await
            .unwrap();
        let names: Vec<&str> = entities.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"Go"));
        assert!(names.contains(&"Google"));
    }

    #[tokio::test]
    async fn naive_extractor_ignores_lowercase_content() {
        let extractor = NaiveExtractor;
        let entities = extractor.extract_entities("just lowercase words here").await.unwrap();
        assert!(entities.is_empty());
    }

    #[tokio::test]
    async fn hash_embedder_is_deterministic_and_normalized() {
        let embedder = HashEmbedder::new("test-model", 16);
        let a = embedder.embed("hello world").await.unwrap();
        let b = embedder.embed("hello world").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4 || norm == 0.0);
    }
}
