//! Execution of the five orchestration modes.
//!
//! | mode       | composition                            | failure policy            |
//! |------------|----------------------------------------|---------------------------|
//! | single     | one dispatch                           | propagate                 |
//! | sequential | ordered, accumulated context           | short-circuit             |
//! | parallel   | concurrent from shared input, fused    | branch marked failed      |
//! | pipeline   | stage i consumes stage i-1             | fatal unless optional     |
//! | dynamic    | planner emits a DAG, bounded width     | branch marked failed      |

use std::{collections::HashMap, sync::Arc};

use tokio::{sync::Semaphore, task::JoinSet};

use crate::{
    agent::InvocationContext,
    capability::Capability,
    error::{CoreError, CoreResult, ErrorKind, ErrorReport},
    router::{RoutingAssignment, RoutingDecision},
    session::SessionHandle,
};

use super::{
    AgentContribution, Deadline, ModeOutcome, Orchestrator,
    dispatch::dispatch_assignment, error_from_report,
    plan::{PlanAggregator, PlanSpec, validate_plan},
};

impl Orchestrator {
    pub(crate) async fn execute_mode(
        &self,
        query: &str,
        session: &SessionHandle,
        decision: &RoutingDecision,
        memory_fragment: &str,
        deadline: Deadline,
        width: usize,
        cancel_on_first_failure: bool,
    ) -> CoreResult<ModeOutcome> {
        use crate::router::OrchestrationMode::*;
        match decision.mode {
            Single => self.run_single(query, session, decision, memory_fragment, deadline).await,
            Sequential => {
                self.run_sequential(query, session, decision, memory_fragment, deadline)
                    .await
            }
            Parallel => {
                self.run_parallel(
                    query,
                    session,
                    decision,
                    memory_fragment,
                    deadline,
                    width,
                    cancel_on_first_failure,
                )
                .await
            }
            Pipeline => {
                self.run_pipeline(query, session, decision, memory_fragment, deadline)
                    .await
            }
            Dynamic => {
                self.run_dynamic(query, session, decision, memory_fragment, deadline, width)
                    .await
            }
        }
    }

    fn base_context(
        &self,
        query: &str,
        decision: &RoutingDecision,
        session: &SessionHandle,
        memory_fragment: &str,
        deadline: Deadline,
    ) -> InvocationContext {
        InvocationContext {
            query: query.to_owned(),
            intent: decision.intent,
            prior_output: None,
            memory_fragment: memory_fragment.to_owned(),
            session: Some(session.clone()),
            tool_scope: self.tools.scope(None),
            deadline,
        }
    }

    // ── single ───────────────────────────────────────────────────────────

    async fn run_single(
        &self,
        query: &str,
        session: &SessionHandle,
        decision: &RoutingDecision,
        memory_fragment: &str,
        deadline: Deadline,
    ) -> CoreResult<ModeOutcome> {
        let assignment = decision
            .assignments
            .first()
            .ok_or_else(|| CoreError::Validation("no agent selected".into()))?;
        let ctx = self.base_context(query, decision, session, memory_fragment, deadline);
        let contribution =
            dispatch_assignment(&self.registry, assignment, ctx, &self.config.orchestrator).await;

        if contribution.success {
            return Ok(ModeOutcome {
                content: contribution.content.clone(),
                confidence: contribution.confidence,
                contributions: vec![contribution],
                success: true,
                cancelled: false,
                completed_fraction: 1.0,
                fatal: None,
            });
        }
        if contribution.error_kind() == Some(ErrorKind::Cancelled) {
            return Ok(cancelled_outcome(String::new(), 0.0, vec![contribution], 0.0));
        }
        let fatal = contribution.error.as_ref().map(error_from_report);
        Ok(ModeOutcome {
            content: String::new(),
            confidence: 0.0,
            contributions: vec![contribution],
            success: false,
            cancelled: false,
            completed_fraction: 1.0,
            fatal,
        })
    }

    // ── sequential ───────────────────────────────────────────────────────

    async fn run_sequential(
        &self,
        query: &str,
        session: &SessionHandle,
        decision: &RoutingDecision,
        memory_fragment: &str,
        deadline: Deadline,
    ) -> CoreResult<ModeOutcome> {
        if decision.assignments.is_empty() {
            return Err(CoreError::Validation("no agents selected".into()));
        }
        let total = decision.assignments.len();
        let mut accumulated: Vec<String> = Vec::new();
        let mut contributions: Vec<AgentContribution> = Vec::new();

        for (i, assignment) in decision.assignments.iter().enumerate() {
            let mut ctx = self.base_context(query, decision, session, memory_fragment, deadline);
            if !accumulated.is_empty() {
                ctx.prior_output = Some(accumulated.join("\n\n"));
            }
            let contribution =
                dispatch_assignment(&self.registry, assignment, ctx, &self.config.orchestrator)
                    .await;

            if contribution.success {
                accumulated.push(contribution.content.clone());
                contributions.push(contribution);
                continue;
            }

            let partial = accumulated.last().cloned().unwrap_or_default();
            let fraction = i as f32 / total as f32;
            if contribution.error_kind() == Some(ErrorKind::Cancelled) {
                contributions.push(contribution);
                let confidence = contributions
                    .iter()
                    .rev()
                    .find(|c| c.success)
                    .map(|c| c.confidence)
                    .unwrap_or(0.0);
                return Ok(cancelled_outcome(partial, confidence, contributions, fraction));
            }
            // Any other failure short-circuits the chain.
            let fatal = contribution.error.as_ref().map(error_from_report);
            contributions.push(contribution);
            return Ok(ModeOutcome {
                content: partial,
                confidence: 0.0,
                contributions,
                success: false,
                cancelled: false,
                completed_fraction: fraction,
                fatal,
            });
        }

        // The final stage's output and confidence are the result.
        let confidence = contributions.last().map(|c| c.confidence).unwrap_or(0.0);
        Ok(ModeOutcome {
            content: accumulated.last().cloned().unwrap_or_default(),
            confidence,
            contributions,
            success: true,
            cancelled: false,
            completed_fraction: 1.0,
            fatal: None,
        })
    }

    // ── parallel ─────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    async fn run_parallel(
        &self,
        query: &str,
        session: &SessionHandle,
        decision: &RoutingDecision,
        memory_fragment: &str,
        deadline: Deadline,
        width: usize,
        cancel_on_first_failure: bool,
    ) -> CoreResult<ModeOutcome> {
        if decision.assignments.is_empty() {
            return Err(CoreError::Validation(
                "parallel mode requires at least one agent".into(),
            ));
        }

        let semaphore = Arc::new(Semaphore::new(width));
        let mut join_set = JoinSet::new();
        for assignment in decision.assignments.clone() {
            let semaphore = semaphore.clone();
            let registry = self.registry.clone();
            let cfg = self.config.orchestrator.clone();
            let ctx = self.base_context(query, decision, session, memory_fragment, deadline);
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                dispatch_assignment(&registry, &assignment, ctx, &cfg).await
            });
        }

        let mut contributions: Vec<AgentContribution> = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(contribution) => {
                    let failed = !contribution.success;
                    let was_cancelled = contribution.error_kind() == Some(ErrorKind::Cancelled);
                    contributions.push(contribution);
                    if failed && !was_cancelled && cancel_on_first_failure {
                        join_set.shutdown().await;
                        break;
                    }
                }
                Err(e) => log::error!("[orchestrator] parallel branch panicked: {e}"),
            }
        }

        // Results arrive in any order; the fuse step imposes weight-then-id
        // ordering.
        let weights: HashMap<&str, f32> = decision
            .assignments
            .iter()
            .map(|a| (a.agent_id.as_str(), a.weight))
            .collect();
        contributions.sort_by(|a, b| {
            let wa = weights.get(a.agent_id.as_str()).copied().unwrap_or(0.0);
            let wb = weights.get(b.agent_id.as_str()).copied().unwrap_or(0.0);
            wb.partial_cmp(&wa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });

        let successes: Vec<&AgentContribution> =
            contributions.iter().filter(|c| c.success).collect();

        if successes.is_empty() {
            if deadline.expired() {
                let fraction = 0.0;
                return Ok(cancelled_outcome(String::new(), 0.0, contributions, fraction));
            }
            let fatal = contributions
                .iter()
                .find_map(|c| c.error.as_ref().map(error_from_report))
                .unwrap_or_else(|| CoreError::InternalInvariant("no branch produced a result".into()));
            return Ok(ModeOutcome {
                content: String::new(),
                confidence: 0.0,
                contributions,
                success: false,
                cancelled: false,
                completed_fraction: 1.0,
                fatal: Some(fatal),
            });
        }

        // Weight-normalized mean over successful branches only.
        let weight_sum: f32 = successes
            .iter()
            .map(|c| weights.get(c.agent_id.as_str()).copied().unwrap_or(0.0))
            .sum();
        let confidence = if weight_sum > 0.0 {
            successes
                .iter()
                .map(|c| {
                    weights.get(c.agent_id.as_str()).copied().unwrap_or(0.0) * c.confidence
                })
                .sum::<f32>()
                / weight_sum
        } else {
            successes.iter().map(|c| c.confidence).sum::<f32>() / successes.len() as f32
        };

        let content = self
            .fuse_parallel(query, session, decision, memory_fragment, deadline, &successes)
            .await;

        Ok(ModeOutcome {
            content,
            confidence,
            contributions,
            success: true,
            cancelled: false,
            completed_fraction: 1.0,
            fatal: None,
        })
    }

    /// Combine branch outputs: a ready synthesis agent outside the branch
    /// set fuses them when present, otherwise they concatenate in the
    /// already-deterministic order.
    async fn fuse_parallel(
        &self,
        query: &str,
        session: &SessionHandle,
        decision: &RoutingDecision,
        memory_fragment: &str,
        deadline: Deadline,
        successes: &[&AgentContribution],
    ) -> String {
        let concatenated = successes
            .iter()
            .map(|c| c.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n---\n\n");
        if successes.len() < 2 {
            return concatenated;
        }

        let branch_ids: Vec<&str> = decision
            .assignments
            .iter()
            .map(|a| a.agent_id.as_str())
            .collect();
        let synthesizer = self
            .registry
            .find_by_capability(Capability::Synthesis)
            .into_iter()
            .find(|id| {
                !branch_ids.contains(&id.as_str())
                    && matches!(
                        self.registry.status(id),
                        Ok(crate::agent::AgentStatus::Ready)
                    )
            });
        let Some(synthesizer) = synthesizer else {
            return concatenated;
        };

        let assignment = RoutingAssignment {
            agent_id: synthesizer,
            capability: Capability::Synthesis,
            weight: 1.0,
            optional: true,
        };
        let mut ctx = self.base_context(query, decision, session, memory_fragment, deadline);
        ctx.prior_output = Some(concatenated.clone());
        let fused =
            dispatch_assignment(&self.registry, &assignment, ctx, &self.config.orchestrator).await;
        if fused.success {
            fused.content
        } else {
            log::debug!("[orchestrator] synthesis fuse failed, falling back to concatenation");
            concatenated
        }
    }

    // ── pipeline ─────────────────────────────────────────────────────────

    async fn run_pipeline(
        &self,
        query: &str,
        session: &SessionHandle,
        decision: &RoutingDecision,
        memory_fragment: &str,
        deadline: Deadline,
    ) -> CoreResult<ModeOutcome> {
        if decision.assignments.is_empty() {
            return Err(CoreError::Validation("no agents selected".into()));
        }
        let total = decision.assignments.len();
        let mut previous: Option<String> = None;
        let mut contributions: Vec<AgentContribution> = Vec::new();
        let mut product = 1.0f32;
        let mut any_success = false;

        for (i, assignment) in decision.assignments.iter().enumerate() {
            let mut ctx = self.base_context(query, decision, session, memory_fragment, deadline);
            ctx.prior_output = previous.clone();
            let contribution =
                dispatch_assignment(&self.registry, assignment, ctx, &self.config.orchestrator)
                    .await;

            if contribution.success {
                product *= contribution.confidence.clamp(0.01, 1.0);
                any_success = true;
                previous = Some(contribution.content.clone());
                contributions.push(contribution);
                continue;
            }
            if contribution.error_kind() == Some(ErrorKind::Cancelled) {
                contributions.push(contribution);
                let confidence = if any_success { product.clamp(0.01, 1.0) } else { 0.0 };
                return Ok(cancelled_outcome(
                    previous.unwrap_or_default(),
                    confidence,
                    contributions,
                    i as f32 / total as f32,
                ));
            }
            if assignment.optional {
                // Empty sentinel replaces the optional stage's output.
                previous = Some(String::new());
                contributions.push(contribution);
                continue;
            }
            let fatal = contribution.error.as_ref().map(error_from_report);
            contributions.push(contribution);
            return Ok(ModeOutcome {
                content: previous.unwrap_or_default(),
                confidence: 0.0,
                contributions,
                success: false,
                cancelled: false,
                completed_fraction: i as f32 / total as f32,
                fatal,
            });
        }

        let confidence = product.clamp(0.01, 1.0);
        Ok(ModeOutcome {
            content: previous.unwrap_or_default(),
            confidence,
            contributions,
            success: true,
            cancelled: false,
            completed_fraction: 1.0,
            fatal: None,
        })
    }

    // ── dynamic ──────────────────────────────────────────────────────────

    async fn run_dynamic(
        &self,
        query: &str,
        session: &SessionHandle,
        decision: &RoutingDecision,
        memory_fragment: &str,
        deadline: Deadline,
        width: usize,
    ) -> CoreResult<ModeOutcome> {
        let planner = decision
            .assignments
            .first()
            .ok_or_else(|| CoreError::Validation("no orchestration agent selected".into()))?;
        let ctx = self.base_context(query, decision, session, memory_fragment, deadline);
        let planner_contribution =
            dispatch_assignment(&self.registry, planner, ctx, &self.config.orchestrator).await;

        if !planner_contribution.success {
            if planner_contribution.error_kind() == Some(ErrorKind::Cancelled) {
                return Ok(cancelled_outcome(String::new(), 0.0, vec![planner_contribution], 0.0));
            }
            let fatal = planner_contribution.error.as_ref().map(error_from_report);
            return Ok(ModeOutcome {
                content: String::new(),
                confidence: 0.0,
                contributions: vec![planner_contribution],
                success: false,
                cancelled: false,
                completed_fraction: 0.0,
                fatal,
            });
        }

        // Plan validation failures propagate before any node dispatch and
        // before anything is recorded.
        let plan: PlanSpec = serde_json::from_str(&planner_contribution.content)
            .map_err(|e| CoreError::Validation(format!("plan does not parse: {e}")))?;
        let generations = validate_plan(&plan)?;
        for node in &plan.nodes {
            self.registry.profile(&node.agent_id).map_err(|_| {
                CoreError::Validation(format!(
                    "plan references unknown agent '{}'",
                    node.agent_id
                ))
            })?;
        }

        let mut outputs: HashMap<String, String> = HashMap::new();
        let mut contributions = vec![planner_contribution];
        let mut required_failed = false;
        let mut cancelled = false;
        let mut executed = 0usize;

        'generations: for generation in &generations {
            let semaphore = Arc::new(Semaphore::new(width));
            let mut join_set = JoinSet::new();

            for &idx in generation {
                let node = plan.nodes[idx].clone();
                let mut inputs: Vec<String> = Vec::with_capacity(node.depends_on.len());
                let mut missing_dep: Option<String> = None;
                for dep in &node.depends_on {
                    match outputs.get(dep) {
                        Some(output) => inputs.push(output.clone()),
                        None => {
                            missing_dep = Some(dep.clone());
                            break;
                        }
                    }
                }
                if let Some(dep) = missing_dep {
                    // Upstream failed: this branch is marked failed without
                    // dispatching.
                    if node.optional {
                        outputs.insert(node.id.clone(), String::new());
                    } else {
                        required_failed = true;
                    }
                    contributions.push(skipped_contribution(&node.agent_id, &dep));
                    continue;
                }

                let capability = self
                    .registry
                    .profile(&node.agent_id)
                    .ok()
                    .and_then(|p| p.capabilities.first().copied())
                    .unwrap_or(Capability::Workflow);
                let assignment = RoutingAssignment {
                    agent_id: node.agent_id.clone(),
                    capability,
                    weight: 1.0 / plan.nodes.len() as f32,
                    optional: node.optional,
                };
                let mut ctx =
                    self.base_context(&node.action, decision, session, memory_fragment, deadline);
                if !inputs.is_empty() {
                    ctx.prior_output = Some(inputs.join("\n\n"));
                }

                let semaphore = semaphore.clone();
                let registry = self.registry.clone();
                let cfg = self.config.orchestrator.clone();
                join_set.spawn(async move {
                    let _permit = semaphore.acquire_owned().await;
                    let contribution = dispatch_assignment(&registry, &assignment, ctx, &cfg).await;
                    (idx, node, contribution)
                });
            }

            let mut batch: Vec<(usize, super::plan::PlanNode, AgentContribution)> = Vec::new();
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok(result) => batch.push(result),
                    Err(e) => log::error!("[orchestrator] plan node panicked: {e}"),
                }
            }
            // Deterministic order within a generation.
            batch.sort_by_key(|(idx, _, _)| *idx);

            for (_, node, contribution) in batch {
                executed += 1;
                if contribution.success {
                    outputs.insert(node.id.clone(), contribution.content.clone());
                } else if contribution.error_kind() == Some(ErrorKind::Cancelled)
                    && deadline.expired()
                {
                    cancelled = true;
                } else if node.optional {
                    outputs.insert(node.id.clone(), String::new());
                } else {
                    required_failed = true;
                }
                contributions.push(contribution);
            }
            if cancelled {
                break 'generations;
            }
        }

        let node_contributions: Vec<&AgentContribution> = contributions[1..].iter().collect();
        let successes: Vec<&AgentContribution> = node_contributions
            .iter()
            .copied()
            .filter(|c| c.success)
            .collect();

        if cancelled {
            let fraction = executed as f32 / plan.nodes.len() as f32;
            let confidence = mean_confidence(&successes);
            let content = join_plan_outputs(&plan, &outputs, PlanAggregator::Concat);
            return Ok(cancelled_outcome(content, confidence, contributions, fraction));
        }
        if successes.is_empty() {
            let fatal = node_contributions
                .iter()
                .find_map(|c| c.error.as_ref().map(error_from_report))
                .unwrap_or_else(|| CoreError::InternalInvariant("plan produced no results".into()));
            return Ok(ModeOutcome {
                content: String::new(),
                confidence: 0.0,
                contributions,
                success: false,
                cancelled: false,
                completed_fraction: 1.0,
                fatal: Some(fatal),
            });
        }

        let content = join_plan_outputs(&plan, &outputs, plan.aggregator());
        let confidence = mean_confidence(&successes);
        Ok(ModeOutcome {
            content,
            confidence,
            contributions,
            success: !required_failed,
            cancelled: false,
            completed_fraction: 1.0,
            fatal: None,
        })
    }
}

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn cancelled_outcome(
    content: String,
    confidence: f32,
    contributions: Vec<AgentContribution>,
    completed_fraction: f32,
) -> ModeOutcome {
    ModeOutcome {
        content,
        confidence,
        contributions,
        success: false,
        cancelled: true,
        completed_fraction,
        fatal: None,
    }
}

fn skipped_contribution(agent_id: &str, failed_dep: &str) -> AgentContribution {
    AgentContribution {
        agent_id: agent_id.to_owned(),
        capability: Capability::Workflow,
        content: String::new(),
        confidence: 0.0,
        success: false,
        error: Some(ErrorReport {
            kind: ErrorKind::Cancelled,
            message: format!("skipped: dependency '{failed_dep}' did not complete"),
            component: "orchestrator".to_owned(),
            retriable: false,
        }),
        duration_ms: 0,
        tools_used: Vec::new(),
        attempts: 0,
    }
}

fn mean_confidence(successes: &[&AgentContribution]) -> f32 {
    if successes.is_empty() {
        return 0.0;
    }
    successes.iter().map(|c| c.confidence).sum::<f32>() / successes.len() as f32
}

/// Join plan outputs deterministically in node declaration order.
///
/// The weighted-mean aggregator surfaces only the sink nodes (final
/// generation with outputs); concat surfaces every successful node.
fn join_plan_outputs(
    plan: &PlanSpec,
    outputs: &HashMap<String, String>,
    aggregator: PlanAggregator,
) -> String {
    let sink_only = aggregator == PlanAggregator::WeightedMean;
    let consumed: std::collections::HashSet<&str> = plan
        .nodes
        .iter()
        .flat_map(|n| n.depends_on.iter().map(String::as_str))
        .collect();
    plan.nodes
        .iter()
        .filter(|n| !sink_only || !consumed.contains(n.id.as_str()))
        .filter_map(|n| outputs.get(&n.id))
        .filter(|o| !o.is_empty())
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join("\n\n")
}
