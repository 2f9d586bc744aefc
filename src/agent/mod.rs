//! The agent abstraction: a named unit that consumes a query fragment and
//! returns a response, bound to one or more capabilities.
//!
//! Agents are values behind the small [`Agent`] trait (`invoke`, `health`,
//! `describe`). The registry holds them; the orchestrator checks them out for
//! one dispatch at a time. Agents hold read-only views of everything they
//! touch: session handles, formatted memories, and a weak tool scope.

mod conversational;
mod orchestration;
mod prompt;
mod research;
mod workflow;

pub use conversational::ConversationalAgent;
pub use orchestration::OrchestrationAgent;
pub use prompt::compose_prompt;
pub use research::{ResearchStage, ResearchStageAgent};
pub use workflow::WorkflowAgent;

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    capability::{Capability, Intent},
    error::CoreResult,
    orchestrator::Deadline,
    session::SessionHandle,
    tool::ToolScope,
};

// ─── AgentStatus ──────────────────────────────────────────────────────────────

/// Runtime lifecycle state of a registered agent.
///
/// ```text
/// uninitialized --initialize--> ready --dispatch--> busy --complete--> ready
///                                  \--shutdown--> shutdown
/// ready/busy --error--> degraded --N failures--> failed
/// degraded --recover--> ready
/// any --shutdown--> shutdown (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Uninitialized,
    Ready,
    Busy,
    Degraded,
    Failed,
    Shutdown,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentStatus::Uninitialized => "uninitialized",
            AgentStatus::Ready => "ready",
            AgentStatus::Busy => "busy",
            AgentStatus::Degraded => "degraded",
            AgentStatus::Failed => "failed",
            AgentStatus::Shutdown => "shutdown",
        };
        write!(f, "{s}")
    }
}

// ─── AgentType ────────────────────────────────────────────────────────────────

/// Coarse classification of an agent implementation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Conversational,
    Workflow,
    Research,
    Orchestration,
    Custom(String),
}

// ─── AgentProfile ─────────────────────────────────────────────────────────────

/// Static description of an agent, as returned by [`Agent::describe`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProfile {
    pub agent_id: String,
    pub name: String,
    pub agent_type: AgentType,
    pub capabilities: Vec<Capability>,
}

// ─── AgentDescriptor ──────────────────────────────────────────────────────────

/// Constructor thunk producing a fresh agent instance.
pub type AgentConstructor = Arc<dyn Fn() -> CoreResult<Arc<dyn Agent>> + Send + Sync>;

/// Registration record for an agent: identity, capability set, dependency
/// list, free-form configuration, and the constructor the registry runs on
/// first use.
#[derive(Clone)]
pub struct AgentDescriptor {
    pub agent_id: String,
    pub name: String,
    pub agent_type: AgentType,
    pub capabilities: Vec<Capability>,
    /// Agents that must be dispatched before this one in an ordered mode.
    pub dependencies: Vec<String>,
    pub config: HashMap<String, serde_json::Value>,
    pub constructor: AgentConstructor,
}

impl AgentDescriptor {
    pub fn new(
        agent_id: impl Into<String>,
        name: impl Into<String>,
        agent_type: AgentType,
        capabilities: Vec<Capability>,
        constructor: AgentConstructor,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            name: name.into(),
            agent_type,
            capabilities,
            dependencies: Vec::new(),
            config: HashMap::new(),
            constructor,
        }
    }

    pub fn with_dependency(mut self, agent_id: impl Into<String>) -> Self {
        self.dependencies.push(agent_id.into());
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    pub fn profile(&self) -> AgentProfile {
        AgentProfile {
            agent_id: self.agent_id.clone(),
            name: self.name.clone(),
            agent_type: self.agent_type.clone(),
            capabilities: self.capabilities.clone(),
        }
    }
}

impl std::fmt::Debug for AgentDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentDescriptor")
            .field("agent_id", &self.agent_id)
            .field("name", &self.name)
            .field("agent_type", &self.agent_type)
            .field("capabilities", &self.capabilities)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

// ─── InvocationContext ────────────────────────────────────────────────────────

/// Everything one dispatch hands to an agent.
#[derive(Clone)]
pub struct InvocationContext {
    /// The query fragment this agent should work on.
    pub query: String,
    pub intent: Intent,
    /// Output of the previous stage in ordered modes, if any.
    pub prior_output: Option<String>,
    /// Prompt fragment rendered from retrieved long-term memories.
    pub memory_fragment: String,
    /// Session the dispatch belongs to. Absent for detached invocations.
    pub session: Option<SessionHandle>,
    /// The tools this dispatch may reach.
    pub tool_scope: ToolScope,
    /// Cooperative cancellation: agents observe this at their own suspension
    /// points.
    pub deadline: Deadline,
}

impl InvocationContext {
    /// A detached context with no session, tools, or memory, and a far-off
    /// deadline. The usual starting point for direct invocations in tests.
    pub fn detached(query: impl Into<String>, intent: Intent) -> Self {
        Self {
            query: query.into(),
            intent,
            prior_output: None,
            memory_fragment: String::new(),
            session: None,
            tool_scope: ToolScope::none(),
            deadline: Deadline::none(),
        }
    }

    pub fn with_prior_output(mut self, output: impl Into<String>) -> Self {
        self.prior_output = Some(output.into());
        self
    }

    pub fn with_tool_scope(mut self, scope: ToolScope) -> Self {
        self.tool_scope = scope;
        self
    }
}

// ─── AgentReply ───────────────────────────────────────────────────────────────

/// What an agent returns from one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentReply {
    pub content: String,
    /// Self-reported confidence in `[0, 1]`.
    pub confidence: f32,
    /// Names of tools invoked during this reply, in invocation order.
    pub tools_used: Vec<String>,
}

impl AgentReply {
    pub fn new(content: impl Into<String>, confidence: f32) -> Self {
        Self {
            content: content.into(),
            confidence: confidence.clamp(0.0, 1.0),
            tools_used: Vec::new(),
        }
    }

    pub fn with_tools(mut self, tools_used: Vec<String>) -> Self {
        self.tools_used = tools_used;
        self
    }
}

// ─── Agent ────────────────────────────────────────────────────────────────────

/// The capability surface of every agent.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Handle one dispatch.
    async fn invoke(&self, ctx: InvocationContext) -> CoreResult<AgentReply>;

    /// Self-check used by lazy initialization and the health monitor.
    async fn health(&self) -> CoreResult<()> {
        Ok(())
    }

    /// Static description of the agent.
    fn describe(&self) -> AgentProfile;
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_builder_accumulates() {
        let ctor: AgentConstructor = Arc::new(|| {
            Err(crate::error::CoreError::Validation("not constructible".into()))
        });
        let desc = AgentDescriptor::new(
            "a1",
            "Agent One",
            AgentType::Conversational,
            vec![Capability::Conversational],
            ctor,
        )
        .with_dependency("a0")
        .with_config("persona", serde_json::json!("friendly"));

        assert_eq!(desc.dependencies, vec!["a0".to_owned()]);
        assert_eq!(desc.config.get("persona"), Some(&serde_json::json!("friendly")));
        let profile = desc.profile();
        assert_eq!(profile.agent_id, "a1");
        assert_eq!(profile.capabilities, vec![Capability::Conversational]);
    }

    #[test]
    fn reply_clamps_confidence() {
        assert_eq!(AgentReply::new("x", 1.7).confidence, 1.0);
        assert_eq!(AgentReply::new("x", -0.2).confidence, 0.0);
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&AgentStatus::Uninitialized).unwrap();
        assert_eq!(json, "\"uninitialized\"");
    }

    #[test]
    fn detached_context_has_no_session() {
        let ctx = InvocationContext::detached("hi", Intent::Conversational);
        assert!(ctx.session.is_none());
        assert!(ctx.memory_fragment.is_empty());
        assert!(!ctx.deadline.expired());
    }
}
