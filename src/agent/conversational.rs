//! LLM-backed conversational agent.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    capability::Capability,
    error::CoreResult,
    provider::{GenerationParams, LlmProvider},
    session::Message,
};

use super::{Agent, AgentProfile, AgentReply, AgentType, InvocationContext, prompt::compose_prompt};

/// General-purpose chat agent: session history + memories + query, one
/// generation, no tools.
pub struct ConversationalAgent {
    agent_id: String,
    name: String,
    provider: Arc<dyn LlmProvider>,
    persona: String,
    base_confidence: f32,
    max_history: usize,
}

impl ConversationalAgent {
    pub fn new(
        agent_id: impl Into<String>,
        name: impl Into<String>,
        provider: Arc<dyn LlmProvider>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            name: name.into(),
            provider,
            persona: "You are a helpful pair-programming assistant.".to_owned(),
            base_confidence: 0.7,
            max_history: 20,
        }
    }

    pub fn with_persona(mut self, persona: impl Into<String>) -> Self {
        self.persona = persona.into();
        self
    }

    pub fn with_base_confidence(mut self, confidence: f32) -> Self {
        self.base_confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history;
        self
    }
}

#[async_trait]
impl Agent for ConversationalAgent {
    async fn invoke(&self, ctx: InvocationContext) -> CoreResult<AgentReply> {
        ctx.deadline.check()?;
        let history: Vec<Message> = match &ctx.session {
            Some(session) => session.recent(self.max_history)?,
            None => Vec::new(),
        };
        let prompt = compose_prompt(
            &self.persona,
            &ctx.memory_fragment,
            &history,
            ctx.prior_output.as_deref(),
            &ctx.query,
        );
        let content = self
            .provider
            .generate(&prompt, &GenerationParams::default())
            .await?;
        Ok(AgentReply::new(content, self.base_confidence))
    }

    fn describe(&self) -> AgentProfile {
        AgentProfile {
            agent_id: self.agent_id.clone(),
            name: self.name.clone(),
            agent_type: AgentType::Conversational,
            capabilities: vec![Capability::Conversational, Capability::Response],
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
