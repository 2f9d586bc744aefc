//! Configuration schema for the orchestration core.
//!
//! All sections and fields carry `#[serde(default)]` so a partially-filled
//! TOML document deserializes correctly. Missing sections fall back to their
//! `Default` impl.
//!
//! Example:
//! ```toml
//! [orchestrator]
//! max_parallel_width = 4
//! per_agent_timeout_ms = 30000
//! global_deadline_ms = 120000
//!
//! [memory]
//! retrieval_limit_k = 5
//! relevance_threshold_tau = 0.2
//!
//! [learning]
//! ewma_lambda = 0.9
//! feedback_gamma = 0.25
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

// ─── OrchestratorConfig ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Upper bound on concurrent dispatches in `parallel` / `dynamic` modes.
    pub max_parallel_width: usize,
    /// Per-agent dispatch timeout in milliseconds.
    pub per_agent_timeout_ms: u64,
    /// Whole-request deadline in milliseconds.
    pub global_deadline_ms: u64,
    /// Grace period after cancellation before an overrunning agent is marked
    /// degraded.
    pub cancel_grace_ms: u64,
    /// Maximum retry attempts for transient dispatch failures.
    pub retry_max_n: u32,
    /// Base delay for exponential retry backoff.
    pub retry_base_backoff_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_parallel_width: 4,
            per_agent_timeout_ms: 30_000,
            global_deadline_ms: 120_000,
            cancel_grace_ms: 1_000,
            retry_max_n: 2,
            retry_base_backoff_ms: 200,
        }
    }
}

// ─── MemoryConfig ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MemoryConfig {
    /// Maximum memories returned by a retrieval (`k`).
    pub retrieval_limit_k: usize,
    /// Minimum similarity for a memory to count as relevant (τ).
    pub relevance_threshold_tau: f32,
    /// Cap on the additive confidence boost contributed by retrieval.
    pub confidence_boost_cap: f32,
    /// Capacity of the in-memory write buffer used while the port is down.
    pub memory_buffer_capacity: usize,
    /// Uncommitted interactions that trigger a consolidation pass.
    pub consolidation_threshold: usize,
    /// Pairwise similarity above which interactions consolidate into one entry.
    pub consolidation_similarity: f32,
    /// Retrieval-weight decay applied to originals after consolidation.
    pub consolidation_decay: f32,
    /// Character budget for the prompt fragment built from retrieved memories.
    pub prompt_char_budget: usize,
    /// Messages kept per session after close-time compaction.
    pub session_keep_messages: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            retrieval_limit_k: 5,
            relevance_threshold_tau: 0.2,
            confidence_boost_cap: 0.3,
            memory_buffer_capacity: 1024,
            consolidation_threshold: 32,
            consolidation_similarity: 0.8,
            consolidation_decay: 0.5,
            prompt_char_budget: 2_000,
            session_keep_messages: 50,
        }
    }
}

// ─── RouterConfig ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RouterConfig {
    /// Weight of the recent-success term in candidate scoring (α).
    pub alpha: f32,
    /// Weight of the memory-prior term in candidate scoring (β).
    pub beta: f32,
    /// Whether an LLM fallback runs when keyword rules are inconclusive.
    pub llm_fallback: bool,
    /// Maximum characters of query text included in the classifier prompt.
    pub classifier_prompt_budget: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            alpha: 0.3,
            beta: 0.2,
            llm_fallback: true,
            classifier_prompt_budget: 600,
        }
    }
}

// ─── LearningConfig ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LearningConfig {
    /// EWMA decay factor per update (λ).
    pub ewma_lambda: f32,
    /// Retrieval-weight promotion factor per unit of feedback (γ).
    pub feedback_gamma: f32,
    /// Lower clamp for a memory entry's retrieval weight.
    pub weight_min: f32,
    /// Upper clamp for a memory entry's retrieval weight.
    pub weight_max: f32,
    /// Capacity of the learning update queue.
    pub queue_capacity: usize,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            ewma_lambda: 0.9,
            feedback_gamma: 0.25,
            weight_min: 0.25,
            weight_max: 4.0,
            queue_capacity: 256,
        }
    }
}

// ─── RegistryConfig ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegistryConfig {
    /// Consecutive failures after which a degraded agent becomes failed.
    pub failure_threshold: u32,
    /// Grace window granted to a busy agent before `unregister` conflicts.
    pub unregister_grace_ms: u64,
    /// Interval of the background health monitor.
    pub health_interval_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            unregister_grace_ms: 2_000,
            health_interval_ms: 30_000,
        }
    }
}

// ─── CoreConfig ───────────────────────────────────────────────────────────────

/// Root configuration for the orchestration core.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoreConfig {
    pub orchestrator: OrchestratorConfig,
    pub memory: MemoryConfig,
    pub router: RouterConfig,
    pub learning: LearningConfig,
    pub registry: RegistryConfig,
}

impl CoreConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> CoreResult<Self> {
        toml::from_str(text).map_err(|e| CoreError::Validation(format!("bad config: {e}")))
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.orchestrator.max_parallel_width, 4);
        assert_eq!(cfg.orchestrator.per_agent_timeout_ms, 30_000);
        assert_eq!(cfg.orchestrator.global_deadline_ms, 120_000);
        assert_eq!(cfg.orchestrator.retry_max_n, 2);
        assert_eq!(cfg.orchestrator.retry_base_backoff_ms, 200);
        assert_eq!(cfg.memory.retrieval_limit_k, 5);
        assert!((cfg.memory.relevance_threshold_tau - 0.2).abs() < f32::EPSILON);
        assert!((cfg.memory.confidence_boost_cap - 0.3).abs() < f32::EPSILON);
        assert_eq!(cfg.memory.memory_buffer_capacity, 1024);
        assert!((cfg.learning.ewma_lambda - 0.9).abs() < f32::EPSILON);
        assert!((cfg.learning.feedback_gamma - 0.25).abs() < f32::EPSILON);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg = CoreConfig::from_toml_str(
            r#"
            [orchestrator]
            max_parallel_width = 8
            "#,
        )
        .unwrap();
        assert_eq!(cfg.orchestrator.max_parallel_width, 8);
        // Unmentioned fields keep their defaults.
        assert_eq!(cfg.orchestrator.per_agent_timeout_ms, 30_000);
        assert_eq!(cfg.memory.retrieval_limit_k, 5);
    }

    #[test]
    fn empty_toml_is_all_defaults() {
        let cfg = CoreConfig::from_toml_str("").unwrap();
        assert_eq!(cfg, CoreConfig::default());
    }

    #[test]
    fn malformed_toml_is_validation_error() {
        let err = CoreConfig::from_toml_str("[orchestrator").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }
}
