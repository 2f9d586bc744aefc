//! Stage agents for the research pipeline: search, analysis, synthesis,
//! response.
//!
//! Each stage is its own agent so the router can order them independently.
//! The search stage prefers a search-capable tool from its scope and falls
//! back to generation alone when none is reachable.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    capability::Capability,
    error::CoreResult,
    provider::{GenerationParams, LlmProvider},
    tool::UnifiedResult,
};

use super::{Agent, AgentProfile, AgentReply, AgentType, InvocationContext, prompt::compose_prompt};

// ─── ResearchStage ────────────────────────────────────────────────────────────

/// Position of an agent inside the research pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResearchStage {
    Search,
    Analysis,
    Synthesis,
    Response,
}

impl ResearchStage {
    pub fn capability(&self) -> Capability {
        match self {
            ResearchStage::Search => Capability::Search,
            ResearchStage::Analysis => Capability::Analysis,
            ResearchStage::Synthesis => Capability::Synthesis,
            ResearchStage::Response => Capability::Response,
        }
    }

    fn instructions(&self) -> &'static str {
        match self {
            ResearchStage::Search => {
                "Gather raw findings relevant to the question. List facts and sources, no prose."
            }
            ResearchStage::Analysis => {
                "Analyze the findings below. Identify patterns, contradictions, and gaps."
            }
            ResearchStage::Synthesis => {
                "Synthesize the analysis below into a coherent, structured summary."
            }
            ResearchStage::Response => {
                "Write the final answer for the user from the synthesis below. Be direct."
            }
        }
    }
}

// ─── ResearchStageAgent ───────────────────────────────────────────────────────

pub struct ResearchStageAgent {
    agent_id: String,
    name: String,
    stage: ResearchStage,
    provider: Arc<dyn LlmProvider>,
    /// Tool consulted by the search stage, when visible in the scope.
    search_tool: String,
    base_confidence: f32,
}

impl ResearchStageAgent {
    pub fn new(
        agent_id: impl Into<String>,
        name: impl Into<String>,
        stage: ResearchStage,
        provider: Arc<dyn LlmProvider>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            name: name.into(),
            stage,
            provider,
            search_tool: "web_search".to_owned(),
            base_confidence: 0.75,
        }
    }

    pub fn with_search_tool(mut self, tool_name: impl Into<String>) -> Self {
        self.search_tool = tool_name.into();
        self
    }

    pub fn with_base_confidence(mut self, confidence: f32) -> Self {
        self.base_confidence = confidence.clamp(0.0, 1.0);
        self
    }

    /// Run the search tool if the scope exposes it. Returns the rendered
    /// findings and whether the tool actually contributed.
    async fn gather(&self, ctx: &InvocationContext) -> (Option<String>, bool) {
        if self.stage != ResearchStage::Search || !ctx.tool_scope.available(&self.search_tool) {
            return (None, false);
        }
        let result: UnifiedResult = ctx
            .tool_scope
            .execute(
                &self.search_tool,
                "search",
                serde_json::json!({ "query": ctx.query }),
            )
            .await;
        if result.success {
            (Some(result.data.to_string()), true)
        } else {
            log::debug!(
                "[agent:{}] search tool failed, continuing without it: {:?}",
                self.agent_id,
                result.error
            );
            (None, false)
        }
    }
}

#[async_trait]
impl Agent for ResearchStageAgent {
    async fn invoke(&self, ctx: InvocationContext) -> CoreResult<AgentReply> {
        ctx.deadline.check()?;
        let (findings, used_tool) = self.gather(&ctx).await;

        let prior = match (&findings, &ctx.prior_output) {
            (Some(findings), Some(prior)) => Some(format!("{prior}\n\nTool findings:\n{findings}")),
            (Some(findings), None) => Some(format!("Tool findings:\n{findings}")),
            (None, prior) => prior.clone(),
        };

        let prompt = compose_prompt(
            self.stage.instructions(),
            &ctx.memory_fragment,
            &[],
            prior.as_deref(),
            &ctx.query,
        );
        let content = self
            .provider
            .generate(&prompt, &GenerationParams::default())
            .await?;

        let mut reply = AgentReply::new(content, self.base_confidence);
        if used_tool {
            reply.tools_used.push(self.search_tool.clone());
        }
        Ok(reply)
    }

    fn describe(&self) -> AgentProfile {
        AgentProfile {
            agent_id: self.agent_id.clone(),
            name: self.name.clone(),
            agent_type: AgentType::Research,
            capabilities: vec![self.stage.capability()],
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
