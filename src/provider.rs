//! The LLM generation port consumed by agents and the router.
//!
//! Drivers for concrete providers live outside the core. Implementations map
//! their transport failures onto the core taxonomy: network errors and 5xx
//! responses become `Transient`, 401/403 become `Auth`, and rejected request
//! parameters become `Validation`.

use async_trait::async_trait;

use crate::error::CoreResult;

// ─── GenerationParams ─────────────────────────────────────────────────────────

/// Sampling parameters forwarded to the provider.
#[derive(Debug, Clone, Default)]
pub struct GenerationParams {
    /// Maximum tokens in the response. `None` uses the provider default.
    pub max_tokens: Option<u32>,
    /// Sampling temperature. `None` uses the provider default.
    pub temperature: Option<f32>,
    /// Stop sequences.
    pub stop: Vec<String>,
}

impl GenerationParams {
    /// Deterministic, short-output parameters used for classification calls.
    pub fn deterministic() -> Self {
        Self {
            max_tokens: Some(64),
            temperature: Some(0.0),
            stop: Vec::new(),
        }
    }
}

// ─── LlmProvider ──────────────────────────────────────────────────────────────

/// Abstraction over a text-generation + embedding backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Generate a completion for `prompt`.
    async fn generate(&self, prompt: &str, params: &GenerationParams) -> CoreResult<String>;

    /// Compute an embedding vector for `text`.
    async fn embed(&self, text: &str) -> CoreResult<Vec<f32>>;

    /// Stable provider identifier for logs.
    fn provider_name(&self) -> &str;
}

/// Cosine similarity between two vectors. Returns 0 for mismatched or empty
/// inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

// ─── Tests ────────────────────────────────────────────────────────────────────
