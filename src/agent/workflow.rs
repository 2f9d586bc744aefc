//! Workflow agent: a fixed tool-step sequence followed by a summarizing
//! generation.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    capability::Capability,
    error::{CoreError, CoreResult, ErrorKind},
    provider::{GenerationParams, LlmProvider},
};

use super::{Agent, AgentProfile, AgentReply, AgentType, InvocationContext, prompt::compose_prompt};

/// One tool invocation in a workflow.
#[derive(Debug, Clone)]
pub struct WorkflowStep {
    pub tool: String,
    pub action: String,
    pub args: serde_json::Value,
    /// Whether the workflow continues past a failure of this step.
    pub optional: bool,
}

/// Executes its configured steps in order, then summarizes their outputs.
pub struct WorkflowAgent {
    agent_id: String,
    name: String,
    provider: Arc<dyn LlmProvider>,
    steps: Vec<WorkflowStep>,
    base_confidence: f32,
}

impl WorkflowAgent {
    pub fn new(
        agent_id: impl Into<String>,
        name: impl Into<String>,
        provider: Arc<dyn LlmProvider>,
        steps: Vec<WorkflowStep>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            name: name.into(),
            provider,
            steps,
            base_confidence: 0.7,
        }
    }

    pub fn with_base_confidence(mut self, confidence: f32) -> Self {
        self.base_confidence = confidence.clamp(0.0, 1.0);
        self
    }
}

#[async_trait]
impl Agent for WorkflowAgent {
    async fn invoke(&self, ctx: InvocationContext) -> CoreResult<AgentReply> {
        let mut tools_used = Vec::new();
        let mut outputs = Vec::new();

        for step in &self.steps {
            ctx.deadline.check()?;
            let result = ctx
                .tool_scope
                .execute(&step.tool, &step.action, step.args.clone())
                .await;
            if result.success {
                tools_used.push(step.tool.clone());
                outputs.push(format!("[{} {}] {}", step.tool, step.action, result.data));
                continue;
            }
            if step.optional {
                log::debug!(
                    "[agent:{}] optional step {}:{} failed, continuing",
                    self.agent_id,
                    step.tool,
                    step.action
                );
                continue;
            }
            // A required step failing on an unavailable tool fails the
            // dispatch with that kind so the orchestrator does not retry it
            // as transient.
            let kind = result.error_kind().unwrap_or(ErrorKind::Transient);
            let message = result
                .error
                .map(|e| e.message)
                .unwrap_or_else(|| "tool step failed".to_owned());
            return Err(match kind {
                ErrorKind::ToolUnavailable => CoreError::ToolUnavailable(message),
                ErrorKind::Validation => CoreError::Validation(message),
                ErrorKind::Auth => CoreError::Auth(message),
                _ => CoreError::Transient(message),
            });
        }

        ctx.deadline.check()?;
        let prior = if outputs.is_empty() {
            ctx.prior_output.clone()
        } else {
            Some(outputs.join("\n"))
        };
        let prompt = compose_prompt(
            "Summarize the results of the completed workflow steps for the user.",
            &ctx.memory_fragment,
            &[],
            prior.as_deref(),
            &ctx.query,
        );
        let content = self
            .provider
            .generate(&prompt, &GenerationParams::default())
            .await?;
        Ok(AgentReply::new(content, self.base_confidence).with_tools(tools_used))
    }

    fn describe(&self) -> AgentProfile {
        AgentProfile {
            agent_id: self.agent_id.clone(),
            name: self.name.clone(),
            agent_type: AgentType::Workflow,
            capabilities: vec![Capability::Workflow],
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
