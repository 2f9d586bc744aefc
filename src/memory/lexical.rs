//! In-process implementation of the [`MemoryPort`].
//!
//! [`LexicalMemoryPort`] keeps all entries in an `RwLock<Vec>` and scores
//! retrieval hybridly: cosine similarity when both the query and the entry
//! carry embeddings, lexical term overlap otherwise.
//!
//! Suitable for tests and lightweight production use. A vector-database
//! driver can replace it behind the same port.

use std::{
    collections::HashSet,
    hash::{Hash, Hasher},
    sync::RwLock,
};

use async_trait::async_trait;
use chrono::Utc;

use crate::{
    error::{CoreError, CoreResult},
    provider::cosine_similarity,
};

use super::types::{MemoryEntry, MemoryPort, SearchFilters};

// ─── Lexical scoring ──────────────────────────────────────────────────────────

/// Lowercase alphanumeric terms of `text`.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Term-overlap similarity: `|a ∩ b| / max(|a|, |b|)`, over unique terms.
pub fn lexical_similarity(a: &str, b: &str) -> f32 {
    let terms_a: HashSet<String> = tokenize(a).into_iter().collect();
    let terms_b: HashSet<String> = tokenize(b).into_iter().collect();
    if terms_a.is_empty() || terms_b.is_empty() {
        return 0.0;
    }
    let shared = terms_a.intersection(&terms_b).count();
    shared as f32 / terms_a.len().max(terms_b.len()) as f32
}

// ─── LexicalMemoryPort ────────────────────────────────────────────────────────

/// Append-only in-process memory store.
pub struct LexicalMemoryPort {
    entries: RwLock<Vec<MemoryEntry>>,
    /// Pairwise similarity above which entries consolidate into one group.
    consolidation_similarity: f32,
}

impl LexicalMemoryPort {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            consolidation_similarity: 0.8,
        }
    }

    pub fn with_consolidation_similarity(mut self, threshold: f32) -> Self {
        self.consolidation_similarity = threshold;
        self
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn similarity(query: &str, query_embedding: Option<&[f32]>, entry: &MemoryEntry) -> f32 {
        if let (Some(qe), Some(ee)) = (query_embedding, entry.embedding.as_deref()) {
            let sim = cosine_similarity(qe, ee);
            if sim > 0.0 {
                return sim;
            }
        }
        lexical_similarity(query, &entry.relevance_key)
    }

    fn read_entries(&self) -> CoreResult<std::sync::RwLockReadGuard<'_, Vec<MemoryEntry>>> {
        self.entries
            .read()
            .map_err(|_| CoreError::InternalInvariant("memory store lock poisoned".into()))
    }

    fn write_entries(&self) -> CoreResult<std::sync::RwLockWriteGuard<'_, Vec<MemoryEntry>>> {
        self.entries
            .write()
            .map_err(|_| CoreError::InternalInvariant("memory store lock poisoned".into()))
    }
}

impl Default for LexicalMemoryPort {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MemoryPort for LexicalMemoryPort {
    async fn add(&self, entry: MemoryEntry) -> CoreResult<()> {
        self.write_entries()?.push(entry);
        Ok(())
    }

    async fn search(
        &self,
        query: &str,
        embedding: Option<&[f32]>,
        limit: usize,
        filters: &SearchFilters,
    ) -> CoreResult<Vec<(MemoryEntry, f32)>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let entries = self.read_entries()?;
        let mut scored: Vec<(MemoryEntry, f32)> = entries
            .iter()
            .filter(|e| {
                filters
                    .session_id
                    .as_ref()
                    .map(|s| &e.session_id == s)
                    .unwrap_or(true)
                    && filters.since_ms.map(|t| e.inserted_at_ms >= t).unwrap_or(true)
            })
            .map(|e| (e.clone(), Self::similarity(query, embedding, e)))
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.entry_id.cmp(&b.0.entry_id))
        });
        scored.truncate(limit);
        Ok(scored)
    }

    async fn consolidate(&self, since_ms: i64) -> CoreResult<Vec<MemoryEntry>> {
        let threshold = self.consolidation_similarity;
        let now = Utc::now().timestamp_millis();

        // Group plain entries in the window greedily by relevance-key overlap.
        let groups: Vec<Vec<MemoryEntry>> = {
            let entries = self.read_entries()?;
            let window: Vec<&MemoryEntry> = entries
                .iter()
                .filter(|e| e.inserted_at_ms >= since_ms && !is_consolidated(e))
                .collect();

            let mut grouped: Vec<Vec<MemoryEntry>> = Vec::new();
            let mut assigned = vec![false; window.len()];
            for i in 0..window.len() {
                if assigned[i] {
                    continue;
                }
                let mut group = vec![window[i].clone()];
                assigned[i] = true;
                for j in (i + 1)..window.len() {
                    if assigned[j] {
                        continue;
                    }
                    let sim =
                        lexical_similarity(&window[i].relevance_key, &window[j].relevance_key);
                    if sim > threshold {
                        group.push(window[j].clone());
                        assigned[j] = true;
                    }
                }
                if group.len() >= 2 {
                    grouped.push(group);
                }
            }
            grouped
        };

        let mut out = Vec::new();
        for group in groups {
            let mut member_ids: Vec<String> =
                group.iter().map(|e| e.entry_id.clone()).collect();
            member_ids.sort();
            let entry_id = consolidated_id(&member_ids);

            // Idempotence: a group already consolidated is returned as-is.
            let existing = self
                .read_entries()?
                .iter()
                .find(|e| e.entry_id == entry_id)
                .cloned();
            if let Some(existing) = existing {
                out.push(existing);
                continue;
            }

            let content = group
                .iter()
                .map(|e| e.content.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            let relevance_key = super::types::relevance_key_for(&content);
            let mut metadata = std::collections::HashMap::new();
            metadata.insert("consolidated".to_owned(), serde_json::json!(true));
            metadata.insert("member_ids".to_owned(), serde_json::json!(member_ids));
            let entry = MemoryEntry {
                entry_id,
                session_id: group[0].session_id.clone(),
                content,
                embedding: None,
                relevance_key,
                inserted_at_ms: now,
                last_access_ms: now,
                metadata,
            };
            self.write_entries()?.push(entry.clone());
            out.push(entry);
        }
        Ok(out)
    }
}

fn is_consolidated(entry: &MemoryEntry) -> bool {
    entry
        .metadata
        .get("consolidated")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

/// Deterministic id for a consolidated group: hash of the sorted member ids.
fn consolidated_id(member_ids: &[String]) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    for id in member_ids {
        id.hash(&mut hasher);
    }
    format!("consolidated-{:016x}", hasher.finish())
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::relevance_key_for;

    fn entry(id: &str, content: &str, at_ms: i64) -> MemoryEntry {
        MemoryEntry {
            entry_id: id.to_owned(),
            session_id: "s1".to_owned(),
            content: content.to_owned(),
            embedding: None,
            relevance_key: relevance_key_for(content),
            inserted_at_ms: at_ms,
            last_access_ms: at_ms,
            metadata: std::collections::HashMap::new(),
        }
    }

    #[test]
    fn lexical_similarity_identical_is_one() {
        assert!((lexical_similarity("hello world", "world hello") - 1.0).abs() < 1e-6);
    }

    #[test]
    fn lexical_similarity_disjoint_is_zero() {
        assert_eq!(lexical_similarity("alpha beta", "gamma delta"), 0.0);
    }

    #[test]
    fn lexical_similarity_partial_overlap() {
        // {a, b, c} vs {b, c, d}: 2 shared / max(3, 3).
        let sim = lexical_similarity("a b c", "b c d");
        assert!((sim - 2.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn lexical_similarity_empty_is_zero() {
        assert_eq!(lexical_similarity("", "anything"), 0.0);
    }

    #[tokio::test]
    async fn add_and_search_ranks_by_similarity() {
        let port = LexicalMemoryPort::new();
        port.add(entry("e1", "rust async orchestration", 1)).await.unwrap();
        port.add(entry("e2", "gardening tips for spring", 2)).await.unwrap();

        let hits = port
            .search("rust orchestration", None, 5, &SearchFilters::default())
            .await
            .unwrap();
        assert_eq!(hits[0].0.entry_id, "e1");
        assert!(hits[0].1 > hits[1].1);
    }

    #[tokio::test]
    async fn search_respects_limit_and_filters() {
        let port = LexicalMemoryPort::new();
        for i in 0..10 {
            port.add(entry(&format!("e{i}"), "shared words here", i)).await.unwrap();
        }
        let hits = port
            .search("shared words", None, 3, &SearchFilters::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 3);

        let recent = port
            .search(
                "shared words",
                None,
                10,
                &SearchFilters {
                    session_id: None,
                    since_ms: Some(7),
                },
            )
            .await
            .unwrap();
        assert_eq!(recent.len(), 3, "only entries at t >= 7 should match");
    }

    #[tokio::test]
    async fn search_prefers_embeddings_when_present() {
        let port = LexicalMemoryPort::new();
        let mut close = entry("close", "unrelated words entirely", 1);
        close.embedding = Some(vec![1.0, 0.0]);
        let mut far = entry("far", "query terms verbatim match", 2);
        far.embedding = Some(vec![0.0, 1.0]);
        port.add(close).await.unwrap();
        port.add(far).await.unwrap();

        let hits = port
            .search("query", Some(&[1.0, 0.0]), 2, &SearchFilters::default())
            .await
            .unwrap();
        assert_eq!(hits[0].0.entry_id, "close");
    }

    #[tokio::test]
    async fn consolidate_groups_similar_entries() {
        let port = LexicalMemoryPort::new();
        port.add(entry("e1", "how do I deploy the service", 1)).await.unwrap();
        port.add(entry("e2", "how do I deploy the service", 2)).await.unwrap();
        port.add(entry("e3", "completely different topic", 3)).await.unwrap();

        let consolidated = port.consolidate(0).await.unwrap();
        assert_eq!(consolidated.len(), 1);
        let members = consolidated[0]
            .metadata
            .get("member_ids")
            .and_then(|v| v.as_array())
            .map(|a| a.len())
            .unwrap_or(0);
        assert_eq!(members, 2);
    }

    #[tokio::test]
    async fn consolidate_is_idempotent() {
        let port = LexicalMemoryPort::new();
        port.add(entry("e1", "repeated question about deploys", 1)).await.unwrap();
        port.add(entry("e2", "repeated question about deploys", 2)).await.unwrap();

        let first = port.consolidate(0).await.unwrap();
        let count_after_first = port.len();
        let second = port.consolidate(0).await.unwrap();

        assert_eq!(first.len(), second.len());
        assert_eq!(
            first[0].entry_id, second[0].entry_id,
            "same window must yield the same consolidated ids"
        );
        assert_eq!(port.len(), count_after_first, "no duplicate entries on re-run");
    }

    #[tokio::test]
    async fn consolidate_without_similar_pairs_is_empty() {
        let port = LexicalMemoryPort::new();
        port.add(entry("e1", "alpha beta gamma", 1)).await.unwrap();
        port.add(entry("e2", "delta epsilon zeta", 2)).await.unwrap();
        let consolidated = port.consolidate(0).await.unwrap();
        assert!(consolidated.is_empty());
    }
}
