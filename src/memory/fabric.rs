//! `MemoryFabric` — composition of the long-term memory port into the
//! retrieval, recording, and feedback contracts the orchestrator consumes.
//!
//! # Degradation
//! The fabric never fails the request path because of the port. Reads degrade
//! to an empty context with zero boost; writes queue in a bounded in-memory
//! buffer (drop-oldest on overflow) and are flushed with exponential backoff
//! once the port recovers.
//!
//! # Retrieval weighting
//! The port is append-only, so feedback-driven promotion does not rewrite
//! entries. Instead the fabric keeps a side table of retrieval weights keyed
//! by entry id (entries derived from interactions reuse the interaction id)
//! and multiplies raw similarity by the weight before thresholding.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{
    config::{CoreConfig, LearningConfig, MemoryConfig},
    error::{CoreError, CoreResult},
    provider::LlmProvider,
};

use super::types::{InteractionRecord, MemoryEntry, MemoryPort, SearchFilters, relevance_key_for};

/// Longest response prefix stored in a derived memory entry.
const STORED_RESPONSE_CHARS: usize = 500;

/// Idle poll interval of the background flush task.
const FLUSH_IDLE: Duration = Duration::from_millis(200);

/// Ceiling for the flush task's backoff.
const FLUSH_BACKOFF_MAX: Duration = Duration::from_secs(30);

// ─── Retrieved context ────────────────────────────────────────────────────────

/// One retrieved memory with its effective (weight-adjusted) similarity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredMemory {
    pub entry: MemoryEntry,
    pub similarity: f32,
}

/// Result of [`MemoryFabric::relevant_context`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievedContext {
    /// Relevant memories, similarity descending.
    pub memories: Vec<ScoredMemory>,
    /// Bounded additive confidence term contributed by retrieval.
    pub confidence_boost: f32,
}

impl RetrievedContext {
    /// Fraction of retrieved memories in which `agent_id` participated
    /// successfully. Used by the router as its memory prior.
    pub fn agent_success_ratio(&self, agent_id: &str) -> f32 {
        if self.memories.is_empty() {
            return 0.0;
        }
        let hits = self
            .memories
            .iter()
            .filter(|m| {
                m.entry.was_successful() && m.entry.agent_ids().iter().any(|a| a == agent_id)
            })
            .count();
        hits as f32 / self.memories.len() as f32
    }
}

// ─── Stats ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RollingStats {
    recorded: u64,
    successes: u64,
    avg_latency_ms: f64,
}

/// Observable fabric counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FabricStats {
    pub recorded: u64,
    pub successes: u64,
    pub avg_latency_ms: f64,
    pub pending_writes: usize,
    pub dropped_writes: u64,
}

// ─── MemoryFabric ─────────────────────────────────────────────────────────────

pub struct MemoryFabric {
    port: Arc<dyn MemoryPort>,
    embedder: Option<Arc<dyn LlmProvider>>,
    memory_cfg: MemoryConfig,
    learning_cfg: LearningConfig,
    /// Interaction records, owned exclusively by the fabric.
    interactions: RwLock<HashMap<String, InteractionRecord>>,
    /// Per-interaction feedback scores by source, merged by averaging.
    feedback_sources: RwLock<HashMap<String, HashMap<String, f32>>>,
    /// Retrieval weights keyed by entry id.
    weights: RwLock<HashMap<String, f32>>,
    /// Writes awaiting a recovered port.
    pending: Mutex<VecDeque<MemoryEntry>>,
    dropped_writes: AtomicU64,
    /// Interactions recorded since the last consolidation pass.
    uncommitted: AtomicUsize,
    /// Consolidated groups whose members were already decayed.
    decayed_groups: RwLock<HashSet<String>>,
    stats: RwLock<RollingStats>,
}

impl MemoryFabric {
    pub fn new(port: Arc<dyn MemoryPort>, config: &CoreConfig) -> Self {
        Self {
            port,
            embedder: None,
            memory_cfg: config.memory.clone(),
            learning_cfg: config.learning.clone(),
            interactions: RwLock::new(HashMap::new()),
            feedback_sources: RwLock::new(HashMap::new()),
            weights: RwLock::new(HashMap::new()),
            pending: Mutex::new(VecDeque::new()),
            dropped_writes: AtomicU64::new(0),
            uncommitted: AtomicUsize::new(0),
            decayed_groups: RwLock::new(HashSet::new()),
            stats: RwLock::new(RollingStats::default()),
        }
    }

    /// Attach an embedding backend. Without one, retrieval is lexical only.
    pub fn with_embedder(mut self, embedder: Arc<dyn LlmProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    // ── Recording ────────────────────────────────────────────────────────

    /// Record a completed interaction and derive a retrievable entry from it.
    ///
    /// The record itself stays in the fabric; only the derived entry crosses
    /// the port. Port failures degrade to the write buffer.
    pub async fn record_interaction(&self, record: InteractionRecord) -> CoreResult<String> {
        let interaction_id = record.interaction_id.clone();
        let entry = self.derive_entry(&record).await;

        {
            let mut stats = self.stats_write()?;
            stats.recorded += 1;
            if record.success {
                stats.successes += 1;
            }
            let latency = record.execution_time_ms as f64;
            stats.avg_latency_ms = if stats.recorded == 1 {
                latency
            } else {
                0.9 * stats.avg_latency_ms + 0.1 * latency
            };
        }
        self.interactions_write()?.insert(interaction_id.clone(), record);

        match self.port.add(entry.clone()).await {
            Ok(()) => {}
            Err(CoreError::Validation(msg)) => {
                return Err(CoreError::Validation(msg));
            }
            Err(e) => {
                log::warn!(
                    "[memory] port write failed, buffering interaction_id={interaction_id}: {e}"
                );
                self.push_pending(entry)?;
            }
        }

        let uncommitted = self.uncommitted.fetch_add(1, Ordering::SeqCst) + 1;
        if uncommitted >= self.memory_cfg.consolidation_threshold {
            self.uncommitted.store(0, Ordering::SeqCst);
            if let Err(e) = self.consolidate_now().await {
                log::warn!("[memory] consolidation failed: {e}");
            }
        }

        Ok(interaction_id)
    }

    async fn derive_entry(&self, record: &InteractionRecord) -> MemoryEntry {
        let response: String = record.response.chars().take(STORED_RESPONSE_CHARS).collect();
        let content = format!("Q: {}\nA: {}", record.query, response);
        let embedding = match &self.embedder {
            Some(embedder) => embedder.embed(&record.query).await.ok(),
            None => None,
        };
        let agent_ids: Vec<String> = record
            .routing
            .assignments
            .iter()
            .map(|a| a.agent_id.clone())
            .collect();
        let now = Utc::now().timestamp_millis();
        let mut metadata = HashMap::new();
        metadata.insert("interaction_id".to_owned(), serde_json::json!(record.interaction_id));
        metadata.insert("success".to_owned(), serde_json::json!(record.success));
        metadata.insert("agent_ids".to_owned(), serde_json::json!(agent_ids));
        MemoryEntry {
            // Reusing the interaction id keys the weight table for both
            // feedback promotion and consolidation decay.
            entry_id: record.interaction_id.clone(),
            session_id: record.session_id.clone(),
            content,
            embedding,
            relevance_key: relevance_key_for(&record.query),
            inserted_at_ms: now,
            last_access_ms: now,
            metadata,
        }
    }

    // ── Retrieval ────────────────────────────────────────────────────────

    /// Retrieve up to `k` memories relevant to `query`.
    ///
    /// Similarity is weight-adjusted and thresholded at τ. A down port
    /// yields an empty context with zero boost — never an error.
    pub async fn relevant_context(
        &self,
        query: &str,
        limit_override: Option<usize>,
    ) -> RetrievedContext {
        let k = limit_override.unwrap_or(self.memory_cfg.retrieval_limit_k);
        if k == 0 {
            return RetrievedContext::default();
        }

        let embedding = match &self.embedder {
            Some(embedder) => embedder.embed(query).await.ok(),
            None => None,
        };

        // Over-fetch so weighting can reorder before the final cut.
        let fetch = k.saturating_mul(4).max(k);
        let raw = match self
            .port
            .search(query, embedding.as_deref(), fetch, &SearchFilters::default())
            .await
        {
            Ok(hits) => hits,
            Err(e) => {
                log::warn!("[memory] search degraded to empty context: {e}");
                return RetrievedContext::default();
            }
        };

        let tau = self.memory_cfg.relevance_threshold_tau;
        let mut scored: Vec<ScoredMemory> = raw
            .into_iter()
            .map(|(entry, sim)| {
                let weight = self.retrieval_weight(&entry.entry_id);
                let similarity = (sim * weight).clamp(0.0, 1.0);
                ScoredMemory { entry, similarity }
            })
            .filter(|m| m.similarity > tau)
            .collect();
        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.entry.entry_id.cmp(&b.entry.entry_id))
        });
        scored.truncate(k);

        let cap = self.memory_cfg.confidence_boost_cap;
        let sum: f32 = scored.iter().map(|m| m.similarity).sum();
        let confidence_boost = (sum / k.max(1) as f32 * cap).clamp(0.0, cap);

        RetrievedContext {
            memories: scored,
            confidence_boost,
        }
    }

    /// Render retrieved memories into a bounded prompt fragment.
    ///
    /// Deterministic: when the budget is exceeded, the oldest entries are
    /// dropped first; survivors keep their similarity order. Always returns
    /// at most `prompt_char_budget` characters.
    pub fn format_for_prompt(&self, memories: &[ScoredMemory]) -> String {
        self.format_for_prompt_with_budget(memories, self.memory_cfg.prompt_char_budget)
    }

    pub fn format_for_prompt_with_budget(
        &self,
        memories: &[ScoredMemory],
        budget_chars: usize,
    ) -> String {
        if memories.is_empty() {
            return String::new();
        }
        const HEADER: &str = "Relevant prior context:\n";

        let mut kept: Vec<&ScoredMemory> = memories.iter().collect();
        loop {
            let body_len: usize = kept.iter().map(|m| rendered_len(&m.entry)).sum();
            if kept.is_empty() || HEADER.chars().count() + body_len <= budget_chars {
                break;
            }
            // Drop the oldest remaining entry.
            if let Some((idx, _)) = kept
                .iter()
                .enumerate()
                .min_by_key(|(_, m)| (m.entry.inserted_at_ms, m.entry.entry_id.clone()))
            {
                kept.remove(idx);
            }
        }
        if kept.is_empty() {
            return String::new();
        }

        let mut out = String::from(HEADER);
        for memory in kept {
            out.push_str("- ");
            out.push_str(&single_line(&memory.entry.content));
            out.push('\n');
        }
        out
    }

    // ── Feedback ─────────────────────────────────────────────────────────

    /// Apply a feedback score to an interaction and promote or demote the
    /// derived entry's retrieval weight. Returns the merged score.
    ///
    /// One score per (interaction, source): a repeated source replaces its
    /// previous score without compounding the weight adjustment.
    pub async fn apply_feedback(
        &self,
        interaction_id: &str,
        score: f32,
        source: &str,
    ) -> CoreResult<f32> {
        if !score.is_finite() || !(-1.0..=1.0).contains(&score) {
            return Err(CoreError::Validation(format!(
                "feedback score {score} outside [-1, 1]"
            )));
        }
        if !self.interactions_read()?.contains_key(interaction_id) {
            return Err(CoreError::Validation(format!(
                "unknown interaction '{interaction_id}'"
            )));
        }

        let first_from_source = {
            let mut sources = self.sources_write()?;
            let per = sources.entry(interaction_id.to_owned()).or_default();
            per.insert(source.to_owned(), score).is_none()
        };

        if first_from_source && score != 0.0 {
            let gamma = self.learning_cfg.feedback_gamma;
            let factor = 1.0 + gamma * score.abs();
            let mut weights = self.weights_write()?;
            let weight = weights.entry(interaction_id.to_owned()).or_insert(1.0);
            *weight = if score > 0.0 {
                *weight * factor
            } else {
                *weight / factor
            };
            *weight = weight.clamp(self.learning_cfg.weight_min, self.learning_cfg.weight_max);
        }

        let merged = {
            let sources = self.sources_read()?;
            let per = sources
                .get(interaction_id)
                .ok_or_else(|| CoreError::InternalInvariant("feedback map vanished".into()))?;
            per.values().sum::<f32>() / per.len() as f32
        };
        if let Some(record) = self.interactions_write()?.get_mut(interaction_id) {
            record.feedback_score = Some(merged);
        }
        log::debug!(
            "[memory] feedback applied interaction_id={interaction_id} source={source} merged={merged:.2}"
        );
        Ok(merged)
    }

    /// Current retrieval weight for an entry (1.0 when never adjusted).
    pub fn retrieval_weight(&self, entry_id: &str) -> f32 {
        self.weights
            .read()
            .ok()
            .and_then(|w| w.get(entry_id).copied())
            .unwrap_or(1.0)
    }

    /// Look up a recorded interaction.
    pub fn interaction(&self, interaction_id: &str) -> Option<InteractionRecord> {
        self.interactions
            .read()
            .ok()
            .and_then(|m| m.get(interaction_id).cloned())
    }

    // ── Consolidation ────────────────────────────────────────────────────

    /// Run a consolidation pass and decay the retrieval weight of every
    /// freshly consolidated member. Safe to call repeatedly.
    pub async fn consolidate_now(&self) -> CoreResult<usize> {
        let consolidated = self.port.consolidate(0).await?;
        let mut fresh = 0usize;
        for group in &consolidated {
            let already = self.decayed_read()?.contains(&group.entry_id);
            if already {
                continue;
            }
            let member_ids: Vec<String> = group
                .metadata
                .get("member_ids")
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(str::to_owned))
                        .collect()
                })
                .unwrap_or_default();
            {
                let mut weights = self.weights_write()?;
                for id in &member_ids {
                    let weight = weights.entry(id.clone()).or_insert(1.0);
                    *weight =
                        (*weight * self.memory_cfg.consolidation_decay).max(self.learning_cfg.weight_min);
                }
            }
            self.decayed_write()?.insert(group.entry_id.clone());
            fresh += 1;
        }
        if fresh > 0 {
            log::info!("[memory] consolidated groups={fresh}");
        }
        Ok(fresh)
    }

    // ── Write buffer ─────────────────────────────────────────────────────

    fn push_pending(&self, entry: MemoryEntry) -> CoreResult<()> {
        let mut pending = self.pending_lock()?;
        if pending.len() >= self.memory_cfg.memory_buffer_capacity {
            pending.pop_front();
            self.dropped_writes.fetch_add(1, Ordering::Relaxed);
        }
        pending.push_back(entry);
        Ok(())
    }

    /// Try to drain the write buffer. Returns how many entries flushed.
    pub async fn flush_pending(&self) -> usize {
        let mut flushed = 0;
        loop {
            let next = match self.pending_lock() {
                Ok(mut pending) => pending.pop_front(),
                Err(_) => return flushed,
            };
            let Some(entry) = next else {
                return flushed;
            };
            if let Err(e) = self.port.add(entry.clone()).await {
                log::debug!("[memory] flush attempt failed: {e}");
                if let Ok(mut pending) = self.pending_lock() {
                    pending.push_front(entry);
                }
                return flushed;
            }
            flushed += 1;
        }
    }

    /// Spawn the background flush task: retries buffered writes with
    /// exponential backoff until the port recovers. Abort the handle to stop.
    pub fn spawn_flush(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let fabric = Arc::clone(self);
        tokio::spawn(async move {
            let mut backoff = FLUSH_IDLE;
            loop {
                let pending = fabric.pending_len();
                if pending == 0 {
                    backoff = FLUSH_IDLE;
                    tokio::time::sleep(FLUSH_IDLE).await;
                    continue;
                }
                let flushed = fabric.flush_pending().await;
                if flushed > 0 && fabric.pending_len() == 0 {
                    log::info!("[memory] flushed buffered writes count={flushed}");
                    backoff = FLUSH_IDLE;
                } else {
                    backoff = (backoff * 2).min(FLUSH_BACKOFF_MAX);
                }
                tokio::time::sleep(backoff).await;
            }
        })
    }

    fn pending_len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn stats(&self) -> FabricStats {
        let rolling = self.stats.read().map(|s| s.clone()).unwrap_or_default();
        FabricStats {
            recorded: rolling.recorded,
            successes: rolling.successes,
            avg_latency_ms: rolling.avg_latency_ms,
            pending_writes: self.pending_len(),
            dropped_writes: self.dropped_writes.load(Ordering::Relaxed),
        }
    }

    // ── Lock helpers ─────────────────────────────────────────────────────

    fn interactions_read(
        &self,
    ) -> CoreResult<std::sync::RwLockReadGuard<'_, HashMap<String, InteractionRecord>>> {
        self.interactions.read().map_err(poisoned)
    }

    fn interactions_write(
        &self,
    ) -> CoreResult<std::sync::RwLockWriteGuard<'_, HashMap<String, InteractionRecord>>> {
        self.interactions.write().map_err(poisoned)
    }

    fn sources_read(
        &self,
    ) -> CoreResult<std::sync::RwLockReadGuard<'_, HashMap<String, HashMap<String, f32>>>> {
        self.feedback_sources.read().map_err(poisoned)
    }

    fn sources_write(
        &self,
    ) -> CoreResult<std::sync::RwLockWriteGuard<'_, HashMap<String, HashMap<String, f32>>>> {
        self.feedback_sources.write().map_err(poisoned)
    }

    fn weights_write(
        &self,
    ) -> CoreResult<std::sync::RwLockWriteGuard<'_, HashMap<String, f32>>> {
        self.weights.write().map_err(poisoned)
    }

    fn decayed_read(&self) -> CoreResult<std::sync::RwLockReadGuard<'_, HashSet<String>>> {
        self.decayed_groups.read().map_err(poisoned)
    }

    fn decayed_write(&self) -> CoreResult<std::sync::RwLockWriteGuard<'_, HashSet<String>>> {
        self.decayed_groups.write().map_err(poisoned)
    }

    fn pending_lock(&self) -> CoreResult<std::sync::MutexGuard<'_, VecDeque<MemoryEntry>>> {
        self.pending.lock().map_err(poisoned)
    }

    fn stats_write(&self) -> CoreResult<std::sync::RwLockWriteGuard<'_, RollingStats>> {
        self.stats.write().map_err(poisoned)
    }
}

fn poisoned<T>(_: T) -> CoreError {
    CoreError::InternalInvariant("memory fabric lock poisoned".into())
}

fn single_line(text: &str) -> String {
    text.replace('\n', "; ")
}

fn rendered_len(entry: &MemoryEntry) -> usize {
    // "- " + content + "\n"
    2 + single_line(&entry.content).chars().count() + 1
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        memory::lexical::LexicalMemoryPort,
        router::{OrchestrationMode, RoutingAssignment, RoutingDecision},
    };
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    fn record(id: &str, query: &str, success: bool) -> InteractionRecord {
        InteractionRecord {
            interaction_id: id.to_owned(),
            session_id: "s1".to_owned(),
            query: query.to_owned(),
            response: "the answer".to_owned(),
            routing: RoutingDecision {
                assignments: vec![RoutingAssignment {
                    agent_id: "a1".to_owned(),
                    capability: crate::capability::Capability::Conversational,
                    weight: 1.0,
                    optional: false,
                }],
                mode: OrchestrationMode::Single,
                intent: crate::capability::Intent::Conversational,
                confidence: 0.8,
            },
            tools_used: vec![],
            success,
            execution_time_ms: 10,
            confidence: 0.8,
            feedback_score: None,
            created_at_ms: Utc::now().timestamp_millis(),
        }
    }

    fn fabric() -> MemoryFabric {
        MemoryFabric::new(Arc::new(LexicalMemoryPort::new()), &CoreConfig::default())
    }

    /// Port that can be switched into a failing state.
    struct FlakyPort {
        inner: LexicalMemoryPort,
        down: AtomicBool,
    }

    impl FlakyPort {
        fn new() -> Self {
            Self {
                inner: LexicalMemoryPort::new(),
                down: AtomicBool::new(false),
            }
        }
        fn set_down(&self, down: bool) {
            self.down.store(down, Ordering::SeqCst);
        }
        fn check(&self) -> CoreResult<()> {
            if self.down.load(Ordering::SeqCst) {
                Err(CoreError::Transient("port down".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl MemoryPort for FlakyPort {
        async fn add(&self, entry: MemoryEntry) -> CoreResult<()> {
            self.check()?;
            self.inner.add(entry).await
        }
        async fn search(
            &self,
            query: &str,
            embedding: Option<&[f32]>,
            limit: usize,
            filters: &SearchFilters,
        ) -> CoreResult<Vec<(MemoryEntry, f32)>> {
            self.check()?;
            self.inner.search(query, embedding, limit, filters).await
        }
        async fn consolidate(&self, since_ms: i64) -> CoreResult<Vec<MemoryEntry>> {
            self.check()?;
            self.inner.consolidate(since_ms).await
        }
    }

    #[tokio::test]
    async fn record_then_retrieve_same_query() {
        let fabric = fabric();
        fabric.record_interaction(record("i1", "deploy the service", true)).await.unwrap();

        let ctx = fabric.relevant_context("deploy the service", None).await;
        assert_eq!(ctx.memories.len(), 1);
        assert!(ctx.confidence_boost > 0.0);
        assert!(ctx.confidence_boost <= 0.3);
    }

    #[tokio::test]
    async fn boost_formula_matches_sum_over_k() {
        let fabric = fabric();
        fabric.record_interaction(record("i1", "unique query words", true)).await.unwrap();
        let ctx = fabric.relevant_context("unique query words", None).await;
        let sum: f32 = ctx.memories.iter().map(|m| m.similarity).sum();
        let expected = (sum / 5.0 * 0.3).clamp(0.0, 0.3);
        assert!((ctx.confidence_boost - expected).abs() < 1e-6);
    }

    #[tokio::test]
    async fn irrelevant_memories_fall_below_threshold() {
        let fabric = fabric();
        fabric.record_interaction(record("i1", "kubernetes ingress rules", true)).await.unwrap();
        let ctx = fabric.relevant_context("piano sonata practice", None).await;
        assert!(ctx.memories.is_empty());
        assert_eq!(ctx.confidence_boost, 0.0);
    }

    #[tokio::test]
    async fn empty_context_when_port_down() {
        let port = Arc::new(FlakyPort::new());
        let fabric = MemoryFabric::new(port.clone(), &CoreConfig::default());
        fabric.record_interaction(record("i1", "some query", true)).await.unwrap();

        port.set_down(true);
        let ctx = fabric.relevant_context("some query", None).await;
        assert!(ctx.memories.is_empty());
        assert_eq!(ctx.confidence_boost, 0.0);
    }

    #[tokio::test]
    async fn failed_writes_buffer_and_flush_on_recovery() {
        let port = Arc::new(FlakyPort::new());
        let fabric = MemoryFabric::new(port.clone(), &CoreConfig::default());

        port.set_down(true);
        fabric.record_interaction(record("i1", "buffered question", true)).await.unwrap();
        assert_eq!(fabric.stats().pending_writes, 1);

        port.set_down(false);
        let flushed = fabric.flush_pending().await;
        assert_eq!(flushed, 1);
        assert_eq!(fabric.stats().pending_writes, 0);

        let ctx = fabric.relevant_context("buffered question", None).await;
        assert_eq!(ctx.memories.len(), 1);
    }

    #[tokio::test]
    async fn buffer_drops_oldest_on_overflow() {
        let port = Arc::new(FlakyPort::new());
        let mut config = CoreConfig::default();
        config.memory.memory_buffer_capacity = 2;
        let fabric = MemoryFabric::new(port.clone(), &config);

        port.set_down(true);
        for i in 0..4 {
            fabric
                .record_interaction(record(&format!("i{i}"), &format!("query {i}"), true))
                .await
                .unwrap();
        }
        let stats = fabric.stats();
        assert_eq!(stats.pending_writes, 2);
        assert_eq!(stats.dropped_writes, 2);
    }

    #[tokio::test]
    async fn feedback_outside_range_is_rejected() {
        let fabric = fabric();
        fabric.record_interaction(record("i1", "q", true)).await.unwrap();
        let err = fabric.apply_feedback("i1", 1.5, "user").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
        let err = fabric.apply_feedback("i1", f32::NAN, "user").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn feedback_on_unknown_interaction_is_rejected() {
        let fabric = fabric();
        let err = fabric.apply_feedback("ghost", 0.5, "user").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn positive_feedback_promotes_retrieval_weight() {
        let fabric = fabric();
        fabric.record_interaction(record("i1", "q", true)).await.unwrap();
        assert_eq!(fabric.retrieval_weight("i1"), 1.0);

        fabric.apply_feedback("i1", 1.0, "user").await.unwrap();
        assert!((fabric.retrieval_weight("i1") - 1.25).abs() < 1e-6);
    }

    #[tokio::test]
    async fn negative_feedback_demotes_retrieval_weight() {
        let fabric = fabric();
        fabric.record_interaction(record("i1", "q", true)).await.unwrap();
        fabric.apply_feedback("i1", -1.0, "user").await.unwrap();
        assert!(fabric.retrieval_weight("i1") < 1.0);
    }

    #[tokio::test]
    async fn repeated_source_does_not_compound_weight() {
        let fabric = fabric();
        fabric.record_interaction(record("i1", "q", true)).await.unwrap();
        fabric.apply_feedback("i1", 1.0, "user").await.unwrap();
        let once = fabric.retrieval_weight("i1");
        fabric.apply_feedback("i1", 1.0, "user").await.unwrap();
        assert_eq!(fabric.retrieval_weight("i1"), once);
    }

    #[tokio::test]
    async fn multiple_sources_merge_by_averaging() {
        let fabric = fabric();
        fabric.record_interaction(record("i1", "q", true)).await.unwrap();
        fabric.apply_feedback("i1", 1.0, "alice").await.unwrap();
        let merged = fabric.apply_feedback("i1", 0.0, "bob").await.unwrap();
        assert!((merged - 0.5).abs() < 1e-6);
        let rec = fabric.interaction("i1").unwrap();
        assert_eq!(rec.feedback_score, Some(0.5));
    }

    #[tokio::test]
    async fn format_for_prompt_respects_budget() {
        let fabric = fabric();
        for i in 0..20 {
            fabric
                .record_interaction(record(
                    &format!("i{i}"),
                    &format!("shared topic question number {i}"),
                    true,
                ))
                .await
                .unwrap();
        }
        let ctx = fabric.relevant_context("shared topic question", Some(20)).await;
        let rendered = fabric.format_for_prompt_with_budget(&ctx.memories, 200);
        assert!(rendered.chars().count() <= 200, "rendered length {}", rendered.len());
    }

    #[tokio::test]
    async fn format_for_prompt_empty_input_is_empty() {
        let fabric = fabric();
        assert_eq!(fabric.format_for_prompt(&[]), "");
    }

    #[tokio::test]
    async fn format_drops_oldest_entries_first() {
        let fabric = fabric();
        let old = ScoredMemory {
            entry: MemoryEntry {
                entry_id: "old".into(),
                session_id: "s1".into(),
                content: "x".repeat(60),
                embedding: None,
                relevance_key: "x".into(),
                inserted_at_ms: 1,
                last_access_ms: 1,
                metadata: HashMap::new(),
            },
            similarity: 0.9,
        };
        let new = ScoredMemory {
            entry: MemoryEntry {
                entry_id: "new".into(),
                session_id: "s1".into(),
                content: "y".repeat(60),
                embedding: None,
                relevance_key: "y".into(),
                inserted_at_ms: 2,
                last_access_ms: 2,
                metadata: HashMap::new(),
            },
            similarity: 0.8,
        };
        let rendered = fabric.format_for_prompt_with_budget(&[old, new], 100);
        assert!(rendered.contains(&"y".repeat(60)), "newer entry survives");
        assert!(!rendered.contains(&"x".repeat(60)), "older entry dropped first");
    }

    #[tokio::test]
    async fn consolidation_decays_member_weights_once() {
        let mut config = CoreConfig::default();
        config.memory.consolidation_threshold = 100; // keep automatic runs out of the way
        let fabric = MemoryFabric::new(Arc::new(LexicalMemoryPort::new()), &config);
        fabric
            .record_interaction(record("i1", "recurring deployment question", true))
            .await
            .unwrap();
        fabric
            .record_interaction(record("i2", "recurring deployment question", true))
            .await
            .unwrap();

        let fresh = fabric.consolidate_now().await.unwrap();
        assert_eq!(fresh, 1);
        let w1 = fabric.retrieval_weight("i1");
        assert!((w1 - 0.5).abs() < 1e-6);

        // Second run over the same window is a no-op for weights.
        let fresh = fabric.consolidate_now().await.unwrap();
        assert_eq!(fresh, 0);
        assert_eq!(fabric.retrieval_weight("i1"), w1);
    }

    #[tokio::test]
    async fn agent_success_ratio_counts_successful_uses() {
        let fabric = fabric();
        fabric.record_interaction(record("i1", "alpha beta gamma", true)).await.unwrap();
        fabric.record_interaction(record("i2", "alpha beta delta", false)).await.unwrap();
        let ctx = fabric.relevant_context("alpha beta", None).await;
        assert_eq!(ctx.memories.len(), 2);
        assert!((ctx.agent_success_ratio("a1") - 0.5).abs() < 1e-6);
        assert_eq!(ctx.agent_success_ratio("other"), 0.0);
    }
}
