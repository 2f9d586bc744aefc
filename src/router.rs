//! `QueryRouter` — intent classification, capability resolution, and agent
//! selection.
//!
//! Routing runs in order: classify the intent (keyword fast path, bounded
//! LLM fallback), map it to required capabilities, collect ready candidates
//! from the registry, score them with learned fitness plus the memory prior,
//! pick an execution mode, and assemble a dependency-ordered decision.
//!
//! Everything except the LLM fallback is non-suspending.

use std::{collections::HashMap, sync::Arc};

use regex::RegexSet;
use serde::{Deserialize, Serialize};

use crate::{
    agent::AgentStatus,
    capability::{Capability, Intent},
    config::RouterConfig,
    error::CoreError,
    learning::FitnessBook,
    memory::RetrievedContext,
    provider::{GenerationParams, LlmProvider},
    registry::AgentRegistry,
    session::Message,
};

// ─── OrchestrationMode ────────────────────────────────────────────────────────

/// How the orchestrator composes the selected agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestrationMode {
    Single,
    Sequential,
    Parallel,
    Pipeline,
    Dynamic,
}

impl std::fmt::Display for OrchestrationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrchestrationMode::Single => "single",
            OrchestrationMode::Sequential => "sequential",
            OrchestrationMode::Parallel => "parallel",
            OrchestrationMode::Pipeline => "pipeline",
            OrchestrationMode::Dynamic => "dynamic",
        };
        write!(f, "{s}")
    }
}

// ─── RoutingDecision ──────────────────────────────────────────────────────────

/// One selected agent with its assigned capability and fused weight.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingAssignment {
    pub agent_id: String,
    pub capability: Capability,
    /// Normalized selection weight; weights across a decision sum to 1.
    pub weight: f32,
    /// Whether a failure of this assignment may be skipped in pipeline mode.
    #[serde(default)]
    pub optional: bool,
}

/// The router's output: ordered assignments, a mode, and a confidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingDecision {
    pub assignments: Vec<RoutingAssignment>,
    pub mode: OrchestrationMode,
    pub intent: Intent,
    pub confidence: f32,
}

impl RoutingDecision {
    /// An empty failure decision, used when recording unroutable queries.
    pub fn unroutable(intent: Intent) -> Self {
        Self {
            assignments: Vec::new(),
            mode: OrchestrationMode::Single,
            intent,
            confidence: 0.0,
        }
    }

    pub fn agent_ids(&self) -> Vec<String> {
        self.assignments.iter().map(|a| a.agent_id.clone()).collect()
    }
}

// ─── RoutingFailure ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingFailureReason {
    NoCapableAgent,
    DependencyCycle,
    UnknownAgent,
}

/// Why routing produced no decision.
#[derive(Debug, Clone)]
pub struct RoutingFailure {
    pub reason: RoutingFailureReason,
    pub missing_capability: Option<Capability>,
    pub message: String,
    pub intent: Intent,
}

impl std::fmt::Display for RoutingFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<RoutingFailure> for CoreError {
    fn from(failure: RoutingFailure) -> Self {
        CoreError::Validation(failure.message)
    }
}

// ─── RouteOverrides ───────────────────────────────────────────────────────────

/// Caller-supplied routing constraints.
#[derive(Debug, Clone, Default)]
pub struct RouteOverrides {
    pub force_mode: Option<OrchestrationMode>,
    pub force_agent_id: Option<String>,
}

// ─── Intent rules ─────────────────────────────────────────────────────────────

/// Keyword patterns per intent, checked in priority order.
const INTENT_RULES: &[(Intent, &[&str])] = &[
    (
        Intent::Research,
        &[
            r"(?i)\bresearch\b",
            r"(?i)\blatest\b.*\b(developments?|news|advances?)\b",
            r"(?i)\bstate of the art\b",
            r"(?i)\bsurvey\b",
            r"(?i)\binvestigate\b",
        ],
    ),
    (
        Intent::Orchestration,
        &[
            r"(?i)\borchestrate\b",
            r"(?i)\bcoordinate\b",
            r"(?i)\bmulti[- ]step\b",
            r"(?i)\bbreak (down|up) the task\b",
            r"(?i)\bplan and execute\b",
        ],
    ),
    (
        Intent::Debugging,
        &[
            r"(?i)\bdebug\b",
            r"(?i)\bfix\b.*\b(bug|error|crash|panic)\b",
            r"(?i)\bstack trace\b",
            r"(?i)\bwhy (is|does).*\b(fail|crash|break)",
            r"(?i)\bbroken\b",
        ],
    ),
    (
        Intent::Testing,
        &[
            r"(?i)\b(unit |integration )?tests?\b",
            r"(?i)\bcoverage\b",
            r"(?i)\bassert(ion)?s?\b",
        ],
    ),
    (
        Intent::Documentation,
        &[
            r"(?i)\bdocument(ation)?\b",
            r"(?i)\bdocstrings?\b",
            r"(?i)\breadme\b",
            r"(?i)\bwrite docs\b",
        ],
    ),
    (
        Intent::Architecture,
        &[
            r"(?i)\barchitecture\b",
            r"(?i)\bsystem design\b",
            r"(?i)\bmodule layout\b",
            r"(?i)\bdesign\b.*\b(structure|system|schema)\b",
        ],
    ),
    (
        Intent::CodeGeneration,
        &[
            r"(?i)\bimplement\b",
            r"(?i)\bwrite (a |an |the )?(function|class|method|module|script|code)\b",
            r"(?i)\bgenerate code\b",
            r"(?i)\brefactor\b",
        ],
    ),
    (
        Intent::Search,
        &[
            r"(?i)\bsearch\b",
            r"(?i)\bfind\b",
            r"(?i)\blook ?up\b",
            r"(?i)\bwhere is\b",
            r"(?i)\blocate\b",
        ],
    ),
    (
        Intent::Conversational,
        &[
            r"(?i)^\s*(hello|hi|hey|yo|good (morning|afternoon|evening))\b",
            r"(?i)\bthanks?( you)?\b",
            r"(?i)\bhow are you\b",
        ],
    ),
];

// ─── QueryRouter ──────────────────────────────────────────────────────────────

pub struct QueryRouter {
    registry: Arc<AgentRegistry>,
    fitness: Arc<FitnessBook>,
    provider: Option<Arc<dyn LlmProvider>>,
    config: RouterConfig,
    rules: Vec<(Intent, RegexSet)>,
}

impl QueryRouter {
    pub fn new(
        registry: Arc<AgentRegistry>,
        fitness: Arc<FitnessBook>,
        config: RouterConfig,
    ) -> Self {
        let rules = INTENT_RULES
            .iter()
            .filter_map(|(intent, patterns)| {
                RegexSet::new(patterns.iter().copied())
                    .ok()
                    .map(|set| (*intent, set))
            })
            .collect();
        Self {
            registry,
            fitness,
            provider: None,
            config,
            rules,
        }
    }

    /// Attach the LLM used when keyword rules are inconclusive.
    pub fn with_llm_fallback(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    // ── Intent classification ────────────────────────────────────────────

    /// Classify a query into one intent label with a confidence.
    ///
    /// Keyword rules resolve the obvious cases without suspending; only an
    /// inconclusive query reaches the LLM fallback.
    pub async fn classify_intent(&self, query: &str, history: &[Message]) -> (Intent, f32) {
        let mut best: Option<(Intent, usize)> = None;
        for (intent, set) in &self.rules {
            let hits = set.matches(query).iter().count();
            if hits > 0 && best.map(|(_, b)| hits > b).unwrap_or(true) {
                best = Some((*intent, hits));
            }
        }
        if let Some((intent, hits)) = best {
            let confidence = if hits >= 2 { 0.9 } else { 0.7 };
            return (intent, confidence);
        }

        if self.config.llm_fallback {
            if let Some(provider) = &self.provider {
                if let Some(result) = self.classify_with_llm(provider, query, history).await {
                    return result;
                }
            }
        }
        (Intent::Unknown, 0.3)
    }

    async fn classify_with_llm(
        &self,
        provider: &Arc<dyn LlmProvider>,
        query: &str,
        history: &[Message],
    ) -> Option<(Intent, f32)> {
        let truncated: String = query
            .chars()
            .take(self.config.classifier_prompt_budget)
            .collect();
        let context = history
            .last()
            .map(|m| {
                let line: String = m.content.chars().take(120).collect();
                format!("Previous message: {line}\n")
            })
            .unwrap_or_default();
        let prompt = format!(
            "Classify the user query into exactly one of these labels:\n\
             conversational, search, code_generation, debugging, documentation, \
             testing, architecture, research, orchestration, unknown.\n\
             Reply with the label only.\n\n{context}Query: {truncated}\nLabel:"
        );
        match provider
            .generate(&prompt, &GenerationParams::deterministic())
            .await
        {
            Ok(raw) => {
                let label = raw.split_whitespace().next().unwrap_or("");
                Intent::parse(label).map(|intent| (intent, 0.6))
            }
            Err(e) => {
                log::debug!("[router] llm classification unavailable: {e}");
                None
            }
        }
    }

    // ── Routing ──────────────────────────────────────────────────────────

    /// Produce a routing decision for a query.
    pub async fn route(
        &self,
        query: &str,
        history: &[Message],
        retrieved: &RetrievedContext,
        overrides: &RouteOverrides,
    ) -> Result<RoutingDecision, RoutingFailure> {
        let (intent, intent_confidence) = self.classify_intent(query, history).await;

        if let Some(agent_id) = &overrides.force_agent_id {
            return self.route_forced(agent_id, intent, intent_confidence, overrides);
        }

        let required = intent.required_capabilities();
        let mode = self.select_mode(intent, required.len(), overrides.force_mode);

        // Candidate pools per required capability, ready agents only.
        let mut pools: Vec<(Capability, Vec<Scored>)> = Vec::with_capacity(required.len());
        for cap in required {
            let pool = self.ready_candidates(*cap, intent, retrieved);
            if pool.is_empty() {
                return Err(RoutingFailure {
                    reason: RoutingFailureReason::NoCapableAgent,
                    missing_capability: Some(*cap),
                    message: format!("no ready agent offers capability '{cap}'"),
                    intent,
                });
            }
            pools.push((*cap, pool));
        }

        let mut picks: Vec<(String, Capability, f32)> = Vec::new();
        if mode == OrchestrationMode::Parallel {
            // Fan out across every distinct ready candidate.
            for (cap, pool) in &pools {
                for candidate in pool {
                    if !picks.iter().any(|(id, _, _)| id == &candidate.agent_id) {
                        picks.push((candidate.agent_id.clone(), *cap, candidate.score));
                    }
                }
            }
        } else {
            // One agent per capability, preferring agents not yet selected.
            // An agent may still serve two stages when it is the only
            // candidate for both.
            for (cap, pool) in &pools {
                let fresh = pool
                    .iter()
                    .find(|c| !picks.iter().any(|(id, _, _)| id == &c.agent_id));
                if let Some(candidate) = fresh.or_else(|| pool.first()) {
                    picks.push((candidate.agent_id.clone(), *cap, candidate.score));
                }
            }
        }

        // Mean candidate score, normalized to [0, 1] by the scoring ceiling.
        let ceiling = 1.0 + self.config.alpha + self.config.beta;
        let mean_score = if picks.is_empty() {
            0.0
        } else {
            picks.iter().map(|(_, _, s)| *s).sum::<f32>() / picks.len() as f32 / ceiling
        };
        let assignments = self.assemble(picks, intent)?;
        let confidence =
            (0.5 * intent_confidence + 0.5 * mean_score.clamp(0.0, 1.0)).clamp(0.0, 1.0);

        log::debug!(
            "[router] decision intent={intent} mode={mode} agents={:?} confidence={confidence:.2}",
            assignments.iter().map(|a| a.agent_id.as_str()).collect::<Vec<_>>()
        );
        Ok(RoutingDecision {
            assignments,
            mode,
            intent,
            confidence,
        })
    }

    fn route_forced(
        &self,
        agent_id: &str,
        intent: Intent,
        intent_confidence: f32,
        overrides: &RouteOverrides,
    ) -> Result<RoutingDecision, RoutingFailure> {
        let profile = self.registry.profile(agent_id).map_err(|_| RoutingFailure {
            reason: RoutingFailureReason::UnknownAgent,
            missing_capability: None,
            message: format!("forced agent '{agent_id}' is not registered"),
            intent,
        })?;
        let status = self.registry.status(agent_id).unwrap_or(AgentStatus::Failed);
        if !matches!(status, AgentStatus::Ready | AgentStatus::Uninitialized) {
            return Err(RoutingFailure {
                reason: RoutingFailureReason::UnknownAgent,
                missing_capability: None,
                message: format!("forced agent '{agent_id}' is {status}"),
                intent,
            });
        }
        let capability = intent
            .required_capabilities()
            .iter()
            .copied()
            .find(|c| profile.capabilities.contains(c))
            .or_else(|| profile.capabilities.first().copied())
            .ok_or_else(|| RoutingFailure {
                reason: RoutingFailureReason::NoCapableAgent,
                missing_capability: None,
                message: format!("forced agent '{agent_id}' declares no capabilities"),
                intent,
            })?;
        Ok(RoutingDecision {
            assignments: vec![RoutingAssignment {
                agent_id: agent_id.to_owned(),
                capability,
                weight: 1.0,
                optional: false,
            }],
            mode: overrides.force_mode.unwrap_or(OrchestrationMode::Single),
            intent,
            confidence: intent_confidence,
        })
    }

    fn select_mode(
        &self,
        intent: Intent,
        required_count: usize,
        force: Option<OrchestrationMode>,
    ) -> OrchestrationMode {
        if let Some(mode) = force {
            return mode;
        }
        match intent {
            Intent::Research => OrchestrationMode::Pipeline,
            Intent::Orchestration => OrchestrationMode::Dynamic,
            Intent::Conversational
            | Intent::Search
            | Intent::Documentation
            | Intent::Testing
            | Intent::Unknown => {
                if required_count > 1 {
                    OrchestrationMode::Sequential
                } else {
                    OrchestrationMode::Single
                }
            }
            _ => {
                if required_count > 1 {
                    OrchestrationMode::Sequential
                } else {
                    OrchestrationMode::Single
                }
            }
        }
    }

    /// Ready candidates for one capability, scored and sorted.
    ///
    /// `score = fitness + α · recent_success(intent) + β · memory_prior`;
    /// ties break on lower recent latency, then id.
    fn ready_candidates(
        &self,
        cap: Capability,
        intent: Intent,
        retrieved: &RetrievedContext,
    ) -> Vec<Scored> {
        let mut pool: Vec<Scored> = self
            .registry
            .find_by_capability(cap)
            .into_iter()
            .filter(|id| {
                matches!(self.registry.status(id), Ok(AgentStatus::Ready))
            })
            .map(|agent_id| {
                let fitness = self.fitness.overall(&agent_id);
                let recent = self.fitness.agent_fitness(&agent_id, intent);
                let prior = retrieved.agent_success_ratio(&agent_id);
                let score = fitness + self.config.alpha * recent + self.config.beta * prior;
                let latency = self.registry.last_latency_ms(&agent_id).unwrap_or(u64::MAX);
                Scored {
                    agent_id,
                    score,
                    latency,
                }
            })
            .collect();
        pool.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.latency.cmp(&b.latency))
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });
        pool
    }

    /// Order picks by declared dependencies (stable topological sort) and
    /// normalize weights to sum to 1.
    fn assemble(
        &self,
        picks: Vec<(String, Capability, f32)>,
        intent: Intent,
    ) -> Result<Vec<RoutingAssignment>, RoutingFailure> {
        let selected: Vec<String> = picks.iter().map(|(id, _, _)| id.clone()).collect();
        let mut blocked_by: HashMap<usize, Vec<usize>> = HashMap::new();
        for (i, (agent_id, _, _)) in picks.iter().enumerate() {
            let deps = self.registry.dependencies_of(agent_id).unwrap_or_default();
            let blockers: Vec<usize> = deps
                .iter()
                .filter_map(|dep| selected.iter().position(|s| s == dep))
                .collect();
            blocked_by.insert(i, blockers);
        }

        // Kahn's algorithm, always taking the lowest original index so the
        // capability order survives among unconstrained picks.
        let mut placed: Vec<usize> = Vec::with_capacity(picks.len());
        let mut done = vec![false; picks.len()];
        while placed.len() < picks.len() {
            let next = (0..picks.len()).find(|&i| {
                !done[i]
                    && blocked_by
                        .get(&i)
                        .map(|b| b.iter().all(|&j| done[j]))
                        .unwrap_or(true)
            });
            match next {
                Some(i) => {
                    done[i] = true;
                    placed.push(i);
                }
                None => {
                    return Err(RoutingFailure {
                        reason: RoutingFailureReason::DependencyCycle,
                        missing_capability: None,
                        message: "selected agents form a dependency cycle".to_owned(),
                        intent,
                    });
                }
            }
        }

        let total: f32 = picks.iter().map(|(_, _, s)| s.max(0.0)).sum();
        let assignments = placed
            .into_iter()
            .map(|i| {
                let (agent_id, capability, score) = picks[i].clone();
                let weight = if total > 0.0 {
                    score.max(0.0) / total
                } else {
                    1.0 / picks.len() as f32
                };
                RoutingAssignment {
                    agent_id,
                    capability,
                    weight,
                    optional: false,
                }
            })
            .collect();
        Ok(assignments)
    }
}

struct Scored {
    agent_id: String,
    score: f32,
    latency: u64,
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        agent::{Agent, AgentConstructor, AgentDescriptor, AgentProfile, AgentReply, AgentType, InvocationContext},
        config::RegistryConfig,
        error::CoreResult,
    };
    use async_trait::async_trait;

    struct StubAgent(String, Vec<Capability>);

    #[async_trait]
    impl Agent for StubAgent {
        async fn invoke(&self, _ctx: InvocationContext) -> CoreResult<AgentReply> {
            Ok(AgentReply::new("ok", 0.9))
        }
        fn describe(&self) -> AgentProfile {
            AgentProfile {
                agent_id: self.0.clone(),
                name: self.0.clone(),
                agent_type: AgentType::Custom("stub".into()),
                capabilities: self.1.clone(),
            }
        }
    }

    fn descriptor(id: &str, caps: Vec<Capability>) -> AgentDescriptor {
        let id2 = id.to_owned();
        let caps2 = caps.clone();
        let ctor: AgentConstructor =
            Arc::new(move || Ok(Arc::new(StubAgent(id2.clone(), caps2.clone())) as Arc<dyn Agent>));
        AgentDescriptor::new(id, id, AgentType::Custom("stub".into()), caps, ctor)
    }

    async fn harness() -> (Arc<AgentRegistry>, Arc<FitnessBook>, QueryRouter) {
        let fitness = Arc::new(FitnessBook::new(0.9));
        let registry = Arc::new(AgentRegistry::new(fitness.clone(), RegistryConfig::default()));
        let router = QueryRouter::new(registry.clone(), fitness.clone(), RouterConfig::default());
        (registry, fitness, router)
    }

    async fn add_ready(registry: &AgentRegistry, id: &str, caps: Vec<Capability>) {
        registry.register(descriptor(id, caps)).unwrap();
        registry.instantiate(id).await.unwrap();
    }

    #[tokio::test]
    async fn keyword_rules_classify_obvious_queries() {
        let (_, _, router) = harness().await;
        let (intent, conf) = router.classify_intent("hello there!", &[]).await;
        assert_eq!(intent, Intent::Conversational);
        assert!(conf >= 0.7);

        let (intent, _) = router
            .classify_intent("please debug this panic in the parser", &[])
            .await;
        assert_eq!(intent, Intent::Debugging);

        let (intent, _) = router
            .classify_intent("research the latest developments in WASM", &[])
            .await;
        assert_eq!(intent, Intent::Research);

        let (intent, _) = router
            .classify_intent("implement a parser for TOML", &[])
            .await;
        assert_eq!(intent, Intent::CodeGeneration);
    }

    #[tokio::test]
    async fn inconclusive_query_is_unknown_without_fallback() {
        let (_, _, router) = harness().await;
        let (intent, conf) = router.classify_intent("zzz qqq", &[]).await;
        assert_eq!(intent, Intent::Unknown);
        assert!(conf < 0.5);
    }

    #[tokio::test]
    async fn llm_fallback_classifies_when_rules_miss() {
        let (registry, fitness, _) = harness().await;
        struct LabelProvider;
        #[async_trait]
        impl LlmProvider for LabelProvider {
            async fn generate(&self, _p: &str, _: &GenerationParams) -> CoreResult<String> {
                Ok("testing".into())
            }
            async fn embed(&self, _t: &str) -> CoreResult<Vec<f32>> {
                Err(CoreError::Validation("no".into()))
            }
            fn provider_name(&self) -> &str {
                "label"
            }
        }
        let router = QueryRouter::new(registry, fitness, RouterConfig::default())
            .with_llm_fallback(Arc::new(LabelProvider));
        let (intent, conf) = router.classify_intent("hmm qqq zzz", &[]).await;
        assert_eq!(intent, Intent::Testing);
        assert!((conf - 0.6).abs() < 1e-6);
    }

    #[tokio::test]
    async fn single_agent_single_mode() {
        let (registry, _, router) = harness().await;
        add_ready(&registry, "chat", vec![Capability::Conversational]).await;

        let decision = router
            .route("hello", &[], &RetrievedContext::default(), &RouteOverrides::default())
            .await
            .unwrap();
        assert_eq!(decision.mode, OrchestrationMode::Single);
        assert_eq!(decision.agent_ids(), vec!["chat".to_owned()]);
        assert!((decision.assignments[0].weight - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn research_routes_to_four_stage_pipeline() {
        let (registry, _, router) = harness().await;
        add_ready(&registry, "search_agent", vec![Capability::Search]).await;
        add_ready(&registry, "analysis_agent", vec![Capability::Analysis]).await;
        add_ready(&registry, "synthesis_agent", vec![Capability::Synthesis]).await;
        add_ready(&registry, "response_agent", vec![Capability::Response]).await;

        let decision = router
            .route(
                "research the latest developments in io_uring",
                &[],
                &RetrievedContext::default(),
                &RouteOverrides::default(),
            )
            .await
            .unwrap();
        assert_eq!(decision.mode, OrchestrationMode::Pipeline);
        assert_eq!(
            decision.agent_ids(),
            vec![
                "search_agent".to_owned(),
                "analysis_agent".to_owned(),
                "synthesis_agent".to_owned(),
                "response_agent".to_owned(),
            ]
        );
        let total: f32 = decision.assignments.iter().map(|a| a.weight).sum();
        assert!((total - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn missing_capability_is_routing_failure() {
        let (registry, _, router) = harness().await;
        add_ready(&registry, "search_agent", vec![Capability::Search]).await;

        let failure = router
            .route(
                "research the latest developments in Zig",
                &[],
                &RetrievedContext::default(),
                &RouteOverrides::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(failure.reason, RoutingFailureReason::NoCapableAgent);
        assert_eq!(failure.missing_capability, Some(Capability::Analysis));
    }

    #[tokio::test]
    async fn non_ready_agents_are_rejected() {
        let (registry, _, router) = harness().await;
        // Registered but never instantiated: stays uninitialized.
        registry
            .register(descriptor("chat", vec![Capability::Conversational]))
            .unwrap();

        let failure = router
            .route("hello", &[], &RetrievedContext::default(), &RouteOverrides::default())
            .await
            .unwrap_err();
        assert_eq!(failure.reason, RoutingFailureReason::NoCapableAgent);
    }

    #[tokio::test]
    async fn ties_break_lexicographically() {
        let (registry, _, router) = harness().await;
        add_ready(&registry, "a1", vec![Capability::CodeGeneration]).await;
        add_ready(&registry, "a2", vec![Capability::CodeGeneration]).await;

        let decision = router
            .route(
                "implement a linked list",
                &[],
                &RetrievedContext::default(),
                &RouteOverrides::default(),
            )
            .await
            .unwrap();
        assert_eq!(decision.agent_ids(), vec!["a1".to_owned()]);
    }

    #[tokio::test]
    async fn higher_fitness_wins_selection() {
        let (registry, fitness, router) = harness().await;
        add_ready(&registry, "a1", vec![Capability::CodeGeneration]).await;
        add_ready(&registry, "a2", vec![Capability::CodeGeneration]).await;

        for _ in 0..5 {
            fitness.nudge(
                &[("a2".to_owned(), vec![Capability::CodeGeneration])],
                Intent::CodeGeneration,
                1.0,
            );
        }
        let decision = router
            .route(
                "implement a queue",
                &[],
                &RetrievedContext::default(),
                &RouteOverrides::default(),
            )
            .await
            .unwrap();
        assert_eq!(decision.agent_ids(), vec!["a2".to_owned()]);
    }

    #[tokio::test]
    async fn forced_parallel_selects_all_candidates() {
        let (registry, _, router) = harness().await;
        add_ready(&registry, "a1", vec![Capability::CodeGeneration]).await;
        add_ready(&registry, "a2", vec![Capability::CodeGeneration]).await;
        add_ready(&registry, "a3", vec![Capability::CodeGeneration]).await;

        let overrides = RouteOverrides {
            force_mode: Some(OrchestrationMode::Parallel),
            force_agent_id: None,
        };
        let decision = router
            .route(
                "implement three variants of the cache",
                &[],
                &RetrievedContext::default(),
                &overrides,
            )
            .await
            .unwrap();
        assert_eq!(decision.mode, OrchestrationMode::Parallel);
        assert_eq!(decision.assignments.len(), 3);
        let total: f32 = decision.assignments.iter().map(|a| a.weight).sum();
        assert!((total - 1.0).abs() < 1e-5, "parallel weights must sum to 1");
    }

    #[tokio::test]
    async fn forced_agent_bypasses_selection() {
        let (registry, _, router) = harness().await;
        add_ready(&registry, "special", vec![Capability::Conversational]).await;

        let overrides = RouteOverrides {
            force_mode: None,
            force_agent_id: Some("special".to_owned()),
        };
        let decision = router
            .route("anything at all", &[], &RetrievedContext::default(), &overrides)
            .await
            .unwrap();
        assert_eq!(decision.agent_ids(), vec!["special".to_owned()]);
        assert_eq!(decision.mode, OrchestrationMode::Single);
    }

    #[tokio::test]
    async fn dependency_order_is_honored() {
        let (registry, _, router) = harness().await;
        add_ready(&registry, "analyzer", vec![Capability::Analysis]).await;
        // The code generator depends on the analyzer and must come second
        // even though debugging lists analysis first anyway; flip the
        // declaration to prove ordering comes from the sort.
        registry
            .register(
                descriptor("generator", vec![Capability::CodeGeneration])
                    .with_dependency("analyzer"),
            )
            .unwrap();
        registry.instantiate("generator").await.unwrap();

        let decision = router
            .route(
                "debug this panic and fix the bug",
                &[],
                &RetrievedContext::default(),
                &RouteOverrides::default(),
            )
            .await
            .unwrap();
        let ids = decision.agent_ids();
        let analyzer_at = ids.iter().position(|i| i == "analyzer").unwrap();
        let generator_at = ids.iter().position(|i| i == "generator").unwrap();
        assert!(analyzer_at < generator_at);
        assert_eq!(decision.mode, OrchestrationMode::Sequential);
    }

    #[tokio::test]
    async fn memory_prior_boosts_previously_successful_agent() {
        let (registry, _, router) = harness().await;
        add_ready(&registry, "a1", vec![Capability::CodeGeneration]).await;
        add_ready(&registry, "a2", vec![Capability::CodeGeneration]).await;

        // Retrieved context says a2 solved similar queries before.
        let mut metadata = std::collections::HashMap::new();
        metadata.insert("agent_ids".to_owned(), serde_json::json!(["a2"]));
        metadata.insert("success".to_owned(), serde_json::json!(true));
        let retrieved = RetrievedContext {
            memories: vec![crate::memory::ScoredMemory {
                entry: crate::memory::MemoryEntry {
                    entry_id: "i0".into(),
                    session_id: "s0".into(),
                    content: "Q: implement a cache\nA: done".into(),
                    embedding: None,
                    relevance_key: "implement a cache".into(),
                    inserted_at_ms: 0,
                    last_access_ms: 0,
                    metadata,
                },
                similarity: 0.9,
            }],
            confidence_boost: 0.05,
        };

        let decision = router
            .route("implement a cache", &[], &retrieved, &RouteOverrides::default())
            .await
            .unwrap();
        assert_eq!(decision.agent_ids(), vec!["a2".to_owned()]);
    }
}
