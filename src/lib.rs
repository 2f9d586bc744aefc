//! torq-core — the agent orchestration core of TORQ Console.
//!
//! A registry-driven, capability-addressed multi-agent scheduler: queries are
//! classified and routed to one or more specialized agents, composed across
//! five execution modes (single, sequential, parallel, pipeline, dynamic),
//! enriched with temporal long-term memory, and fed back into a learning
//! loop that adapts future routing from measured outcomes.
//!
//! The core stays transport- and storage-agnostic: LLM providers, memory
//! backends, tools, and telemetry all plug in behind small ports
//! ([`provider::LlmProvider`], [`memory::MemoryPort`], [`tool::Tool`],
//! [`telemetry::TelemetrySink`]).
//!
//! ```rust,ignore
//! let fitness = Arc::new(FitnessBook::new(config.learning.ewma_lambda));
//! let registry = Arc::new(AgentRegistry::new(fitness.clone(), config.registry.clone()));
//! let fabric = Arc::new(MemoryFabric::new(Arc::new(LexicalMemoryPort::new()), &config));
//! let tools = Arc::new(ToolManager::new());
//! let (learning, _task) = LearningLoop::spawn(fitness.clone(), fabric.clone(), &config.learning);
//! let router = QueryRouter::new(registry.clone(), fitness, config.router.clone());
//! let orchestrator = Orchestrator::new(config, registry, router, fabric, tools, learning);
//!
//! let session_id = orchestrator.create_session("user", None)?;
//! let result = orchestrator.process("Hello", &session_id, ProcessOptions::default()).await?;
//! ```

pub mod agent;
pub mod capability;
pub mod config;
pub mod error;
pub mod events;
pub mod learning;
pub mod memory;
pub mod orchestrator;
pub mod provider;
pub mod registry;
pub mod router;
pub mod session;
pub mod telemetry;
pub mod tool;

/// Convenience re-exports for the most commonly used types across the core.
///
/// ```rust
/// use torq_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::agent::{
        Agent, AgentDescriptor, AgentProfile, AgentReply, AgentStatus, AgentType,
        ConversationalAgent, InvocationContext, OrchestrationAgent, ResearchStage,
        ResearchStageAgent, WorkflowAgent,
    };
    pub use crate::capability::{Capability, Intent};
    pub use crate::config::CoreConfig;
    pub use crate::error::{CoreError, CoreResult, ErrorKind, ErrorReport};
    pub use crate::events::{CoreEvent, EventBus, SessionEventKind, TokioBroadcastBus};
    pub use crate::learning::{FitnessBook, LearningEvent, LearningHandle, LearningLoop};
    pub use crate::memory::{
        InteractionRecord, LexicalMemoryPort, MemoryEntry, MemoryFabric, MemoryPort,
        RetrievedContext,
    };
    pub use crate::orchestrator::{
        AgentContribution, Deadline, OrchestrationResult, Orchestrator, PlanSpec, ProcessOptions,
    };
    pub use crate::provider::{GenerationParams, LlmProvider};
    pub use crate::registry::AgentRegistry;
    pub use crate::router::{
        OrchestrationMode, QueryRouter, RoutingAssignment, RoutingDecision, RoutingFailure,
    };
    pub use crate::session::{Message, MessageKind, MessageRole, SessionHandle, SessionTable};
    pub use crate::telemetry::{LogTelemetry, NullTelemetry, TelemetrySink};
    pub use crate::tool::{PrivilegePolicy, Tool, ToolManager, ToolScope, UnifiedResult};
}
