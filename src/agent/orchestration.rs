//! Plan-producing agent for dynamic mode.
//!
//! Invoked first when the router picks dynamic execution: it asks the
//! provider for a JSON plan, validates that the payload parses, and returns
//! the plan verbatim as its reply content. DAG validation (cycles, unknown
//! agents) happens in the orchestrator, which owns the registry view.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    capability::Capability,
    error::{CoreError, CoreResult},
    orchestrator::PlanSpec,
    provider::{GenerationParams, LlmProvider},
};

use super::{Agent, AgentProfile, AgentReply, AgentType, InvocationContext};

pub struct OrchestrationAgent {
    agent_id: String,
    name: String,
    provider: Arc<dyn LlmProvider>,
    /// Agents the planner may reference, rendered into the planning prompt.
    roster: Vec<String>,
}

impl OrchestrationAgent {
    pub fn new(
        agent_id: impl Into<String>,
        name: impl Into<String>,
        provider: Arc<dyn LlmProvider>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            name: name.into(),
            provider,
            roster: Vec::new(),
        }
    }

    pub fn with_roster(mut self, agent_ids: Vec<String>) -> Self {
        self.roster = agent_ids;
        self
    }

    fn planning_prompt(&self, query: &str) -> String {
        let roster = if self.roster.is_empty() {
            "any registered agent".to_owned()
        } else {
            self.roster.join(", ")
        };
        format!(
            "Decompose the task below into a plan of agent invocations.\n\
             Available agents: {roster}.\n\
             Reply with ONLY a JSON object of this shape:\n\
             {{\"nodes\": [{{\"id\": \"n1\", \"agent_id\": \"...\", \"action\": \"...\", \
             \"depends_on\": [], \"optional\": false}}], \"aggregator\": \"weighted_mean\"}}\n\n\
             Task: {query}"
        )
    }
}

#[async_trait]
impl Agent for OrchestrationAgent {
    async fn invoke(&self, ctx: InvocationContext) -> CoreResult<AgentReply> {
        ctx.deadline.check()?;
        let prompt = self.planning_prompt(&ctx.query);
        let raw = self
            .provider
            .generate(&prompt, &GenerationParams::deterministic())
            .await?;

        let json = extract_json(&raw).ok_or_else(|| {
            CoreError::Validation(format!(
                "planner '{}' returned no JSON object",
                self.agent_id
            ))
        })?;
        // Parse once here so a malformed plan fails inside the planning
        // dispatch instead of downstream.
        let plan: PlanSpec = serde_json::from_str(json)
            .map_err(|e| CoreError::Validation(format!("plan does not parse: {e}")))?;
        if plan.nodes.is_empty() {
            return Err(CoreError::Validation("plan has no nodes".into()));
        }

        Ok(AgentReply::new(json.to_owned(), 0.8))
    }

    fn describe(&self) -> AgentProfile {
        AgentProfile {
            agent_id: self.agent_id.clone(),
            name: self.name.clone(),
            agent_type: AgentType::Orchestration,
            capabilities: vec![Capability::Orchestration, Capability::Meta],
        }
    }
}

/// The first balanced top-level JSON object in `text`, if any.
fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    for (offset, c) in text[start..].char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

// ─── Tests ────────────────────────────────────────────────────────────────────
