//! Data model of the long-term memory subsystem and the port it sits behind.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{error::CoreResult, router::RoutingDecision};

// ─── MemoryEntry ──────────────────────────────────────────────────────────────

/// A single record stored behind the [`MemoryPort`].
///
/// Entries are append-only at the port boundary: consolidation emits new
/// entries rather than mutating existing ones, and retrieval-weight
/// adjustments live in the fabric, not the port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryEntry {
    pub entry_id: String,
    pub session_id: String,
    /// Text payload.
    pub content: String,
    /// Embedding vector; opaque to the core, absent when no embedder ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Normalized term key derived from the payload, used for lexical
    /// matching when no embedding is available.
    pub relevance_key: String,
    pub inserted_at_ms: i64,
    pub last_access_ms: i64,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl MemoryEntry {
    /// Agent ids recorded in the entry's metadata, if any.
    pub fn agent_ids(&self) -> Vec<String> {
        self.metadata
            .get("agent_ids")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether the entry's metadata marks the source interaction successful.
    pub fn was_successful(&self) -> bool {
        self.metadata
            .get("success")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// The interaction this entry was derived from, when applicable.
    pub fn interaction_id(&self) -> Option<&str> {
        self.metadata.get("interaction_id").and_then(|v| v.as_str())
    }
}

/// Derive the normalized relevance key for a text payload: lowercase
/// alphanumeric terms, deduplicated, in first-seen order.
pub fn relevance_key_for(text: &str) -> String {
    let mut seen = std::collections::HashSet::new();
    let mut terms = Vec::new();
    for term in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
    {
        if seen.insert(term.clone()) {
            terms.push(term);
        }
    }
    terms.join(" ")
}

// ─── SearchFilters ────────────────────────────────────────────────────────────

/// Optional constraints on a port search.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since_ms: Option<i64>,
}

// ─── MemoryPort ───────────────────────────────────────────────────────────────

/// Abstract long-term memory backend.
///
/// Implementations may be an in-process store, a vector database, or a
/// remote memory service. Any non-validation failure is treated as transient
/// by the fabric and degrades silently.
#[async_trait]
pub trait MemoryPort: Send + Sync {
    /// Append an entry.
    async fn add(&self, entry: MemoryEntry) -> CoreResult<()>;

    /// Return up to `limit` entries with their similarity to the query,
    /// sorted by similarity descending. `embedding` is the query's vector
    /// when one is available; implementations without vector support may
    /// ignore it and match lexically.
    async fn search(
        &self,
        query: &str,
        embedding: Option<&[f32]>,
        limit: usize,
        filters: &SearchFilters,
    ) -> CoreResult<Vec<(MemoryEntry, f32)>>;

    /// Group highly similar entries inserted after `since_ms` and emit one
    /// consolidated entry per group. Must be idempotent: repeated calls over
    /// the same window return the same consolidated set.
    async fn consolidate(&self, since_ms: i64) -> CoreResult<Vec<MemoryEntry>>;
}

// ─── InteractionRecord ────────────────────────────────────────────────────────

/// One completed `process` call, recorded immutably.
///
/// The only post-write mutation permitted is appending feedback.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionRecord {
    pub interaction_id: String,
    pub session_id: String,
    pub query: String,
    pub response: String,
    pub routing: RoutingDecision,
    pub tools_used: Vec<String>,
    pub success: bool,
    pub execution_time_ms: u64,
    pub confidence: f32,
    /// Merged feedback across sources, in `[-1, 1]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback_score: Option<f32>,
    pub created_at_ms: i64,
}

// ─── FeedbackEvent ────────────────────────────────────────────────────────────

/// Explicit user feedback on an interaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackEvent {
    /// Unique id; replaying a seen id is a no-op downstream.
    pub event_id: String,
    pub interaction_id: String,
    /// Score in `[-1, 1]`.
    pub score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// Originating source; at most one live score per (interaction, source).
    pub source: String,
    pub timestamp_ms: i64,
}

// ─── Tests ────────────────────────────────────────────────────────────────────
