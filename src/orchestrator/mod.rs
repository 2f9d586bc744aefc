//! The orchestrator: multi-mode execution engine and owner of the session
//! table.
//!
//! `process` is the single entry point for a query: it serializes per-session
//! work, retrieves long-term context, asks the router for a decision,
//! executes the chosen mode, and records exactly one interaction for every
//! call that reached dispatch. Pre-dispatch validation failures (unroutable
//! query, cyclic plan, zero deadline) surface immediately and record nothing.

mod deadline;
mod dispatch;
mod modes;
mod plan;

pub use deadline::Deadline;
pub use plan::{PlanAggregator, PlanNode, PlanSpec, validate_plan};

use std::{sync::Arc, time::Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    capability::{Capability, Intent},
    config::CoreConfig,
    error::{CoreError, CoreResult, ErrorKind, ErrorReport},
    events::{CoreEvent, EventBus, SessionEventKind},
    learning::{LearningEvent, LearningHandle},
    memory::{InteractionRecord, MemoryFabric},
    registry::AgentRegistry,
    router::{OrchestrationMode, QueryRouter, RouteOverrides, RoutingAssignment, RoutingDecision},
    session::{MessageKind, MessageRole, SessionHandle, SessionTable, USER_AGENT_ID},
    telemetry::{NullTelemetry, SpanRecord, TelemetrySink},
    tool::ToolManager,
};

// ─── ProcessOptions ───────────────────────────────────────────────────────────

/// Caller-supplied options for one `process` call.
#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    /// Whole-request deadline override in milliseconds.
    pub deadline_ms: Option<u64>,
    pub force_mode: Option<OrchestrationMode>,
    pub force_agent_id: Option<String>,
    /// In parallel mode, cancel the remaining branches when one fails.
    pub cancel_on_first_failure: bool,
    pub max_parallel_width: Option<usize>,
    /// Override for the number of memories retrieved.
    pub retrieval_limit: Option<usize>,
}

// ─── AgentContribution ────────────────────────────────────────────────────────

/// Per-agent record inside an [`OrchestrationResult`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentContribution {
    pub agent_id: String,
    pub capability: Capability,
    pub content: String,
    pub confidence: f32,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
    pub duration_ms: u64,
    pub tools_used: Vec<String>,
    pub attempts: u32,
}

impl AgentContribution {
    pub(crate) fn failed(
        assignment: &RoutingAssignment,
        error: CoreError,
        attempts: u32,
        duration_ms: u64,
    ) -> Self {
        Self {
            agent_id: assignment.agent_id.clone(),
            capability: assignment.capability,
            content: String::new(),
            confidence: 0.0,
            success: false,
            error: Some(error.report("orchestrator")),
            duration_ms,
            tools_used: Vec::new(),
            attempts,
        }
    }

    pub(crate) fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// Rebuild a [`CoreError`] from a contribution's report when a mode-level
/// failure has to propagate to the caller.
pub(crate) fn error_from_report(report: &ErrorReport) -> CoreError {
    let message = report.message.clone();
    match report.kind {
        ErrorKind::Validation => CoreError::Validation(message),
        ErrorKind::Auth => CoreError::Auth(message),
        ErrorKind::Transient => CoreError::Transient(message),
        ErrorKind::Conflict => CoreError::Conflict(message),
        ErrorKind::ToolUnavailable => CoreError::ToolUnavailable(message),
        ErrorKind::Cancelled => CoreError::Cancelled(message),
        ErrorKind::InternalInvariant => CoreError::InternalInvariant(message),
    }
}

// ─── OrchestrationResult ──────────────────────────────────────────────────────

/// The outcome of one `process` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationResult {
    pub interaction_id: String,
    pub session_id: String,
    /// Final user-visible content.
    pub content: String,
    pub mode: OrchestrationMode,
    pub intent: Intent,
    pub confidence: f32,
    pub success: bool,
    pub contributions: Vec<AgentContribution>,
    /// Tools invoked across all contributions, in dispatch order.
    pub tools_invoked: Vec<String>,
    pub total_duration_ms: u64,
}

// ─── ModeOutcome ──────────────────────────────────────────────────────────────

/// Internal result of mode execution, before recording and boosting.
pub(crate) struct ModeOutcome {
    pub content: String,
    /// Mode-aggregated confidence, before the memory boost.
    pub confidence: f32,
    pub contributions: Vec<AgentContribution>,
    pub success: bool,
    pub cancelled: bool,
    /// Fraction of planned work that completed; scales confidence on
    /// cancellation.
    pub completed_fraction: f32,
    /// A failure that must propagate to the caller after recording.
    pub fatal: Option<CoreError>,
}

// ─── Orchestrator ─────────────────────────────────────────────────────────────

pub struct Orchestrator {
    pub(crate) config: CoreConfig,
    pub(crate) registry: Arc<AgentRegistry>,
    router: QueryRouter,
    pub(crate) fabric: Arc<MemoryFabric>,
    pub(crate) tools: Arc<ToolManager>,
    learning: LearningHandle,
    sessions: SessionTable,
    bus: Option<Arc<dyn EventBus>>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl Orchestrator {
    pub fn new(
        config: CoreConfig,
        registry: Arc<AgentRegistry>,
        router: QueryRouter,
        fabric: Arc<MemoryFabric>,
        tools: Arc<ToolManager>,
        learning: LearningHandle,
    ) -> Self {
        Self {
            config,
            registry,
            router,
            fabric,
            tools,
            learning,
            sessions: SessionTable::new(),
            bus: None,
            telemetry: Arc::new(NullTelemetry),
        }
    }

    pub fn with_event_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    // ── Session surface ──────────────────────────────────────────────────

    pub fn create_session(
        &self,
        owner: &str,
        initial_agent_id: Option<String>,
    ) -> CoreResult<String> {
        if let Some(agent_id) = &initial_agent_id {
            // Fails on unknown ids before the session exists.
            self.registry.profile(agent_id)?;
        }
        let session_id = self.sessions.create(owner, initial_agent_id)?;
        self.publish(CoreEvent::SessionEvent {
            session_id: session_id.clone(),
            kind: SessionEventKind::Created,
        });
        Ok(session_id)
    }

    pub async fn close_session(&self, session_id: &str) -> CoreResult<()> {
        self.sessions
            .close(session_id, self.config.memory.session_keep_messages)
            .await?;
        self.publish(CoreEvent::SessionEvent {
            session_id: session_id.to_owned(),
            kind: SessionEventKind::Closed,
        });
        Ok(())
    }

    /// Handle to a live session, mainly for inspection.
    pub fn session(&self, session_id: &str) -> CoreResult<SessionHandle> {
        self.sessions.get(session_id)
    }

    /// Look up a recorded interaction.
    pub fn interaction(&self, interaction_id: &str) -> Option<InteractionRecord> {
        self.fabric.interaction(interaction_id)
    }

    // ── Feedback surface ─────────────────────────────────────────────────

    /// Submit explicit feedback for an interaction. The fitness and memory
    /// updates are applied asynchronously by the learning loop.
    pub async fn submit_feedback(
        &self,
        interaction_id: &str,
        score: f32,
        note: Option<String>,
    ) -> CoreResult<()> {
        if !score.is_finite() || !(-1.0..=1.0).contains(&score) {
            return Err(CoreError::Validation(format!(
                "feedback score {score} outside [-1, 1]"
            )));
        }
        let record = self.fabric.interaction(interaction_id).ok_or_else(|| {
            CoreError::Validation(format!("unknown interaction '{interaction_id}'"))
        })?;
        if let Some(note) = note {
            log::info!("[orchestrator] feedback note interaction_id={interaction_id}: {note}");
        }
        self.learning.submit(LearningEvent::Feedback {
            event_id: Uuid::new_v4().to_string(),
            interaction_id: interaction_id.to_owned(),
            participants: participants_of(&record.routing),
            intent: record.routing.intent,
            score,
            source: "user".to_owned(),
        });
        Ok(())
    }

    // ── Process ──────────────────────────────────────────────────────────

    /// Route and execute one query inside a session.
    #[tracing::instrument(name = "orchestrator.process", skip_all, fields(session = %session_id))]
    pub async fn process(
        &self,
        query: &str,
        session_id: &str,
        options: ProcessOptions,
    ) -> CoreResult<OrchestrationResult> {
        let started = Instant::now();
        let deadline_ms = options
            .deadline_ms
            .unwrap_or(self.config.orchestrator.global_deadline_ms);
        if deadline_ms == 0 {
            return Err(CoreError::Cancelled("deadline is zero".into()));
        }
        let deadline = Deadline::after_ms(deadline_ms);

        let session = self.sessions.get(session_id)?;
        // Per-session FIFO: concurrent calls for one session run in arrival
        // order.
        let _serial = session.acquire_serial().await;

        let user_message = session.append(
            USER_AGENT_ID,
            MessageRole::User,
            MessageKind::Text,
            query,
            None,
        )?;
        self.publish(CoreEvent::MessageAppended {
            session_id: session_id.to_owned(),
            message_id: user_message.message_id.clone(),
            role: MessageRole::User,
        });

        let retrieved = self
            .fabric
            .relevant_context(query, options.retrieval_limit)
            .await;
        let memory_fragment = self.fabric.format_for_prompt(&retrieved.memories);

        let history = session.recent(20)?;
        let overrides = RouteOverrides {
            force_mode: options.force_mode,
            force_agent_id: options.force_agent_id.clone(),
        };
        let decision = match self.router.route(query, &history, &retrieved, &overrides).await {
            Ok(decision) => decision,
            Err(failure) => {
                log::warn!("[orchestrator] unroutable query session={session_id}: {failure}");
                return Err(failure.into());
            }
        };
        deadline.check()?;

        let width = options
            .max_parallel_width
            .unwrap_or(self.config.orchestrator.max_parallel_width)
            .max(1);
        let outcome = self
            .execute_mode(
                query,
                &session,
                &decision,
                &memory_fragment,
                deadline,
                width,
                options.cancel_on_first_failure,
            )
            .await?;

        // Partial output still lands in the session log; a cancelled run's
        // tail message carries the cancelled flag.
        if !outcome.content.is_empty() || outcome.cancelled {
            let assistant_id = decision
                .assignments
                .first()
                .map(|a| a.agent_id.clone())
                .unwrap_or_else(|| "orchestrator".to_owned());
            let message = session.append(
                &assistant_id,
                MessageRole::Assistant,
                MessageKind::Text,
                outcome.content.clone(),
                Some(user_message.message_id.clone()),
            )?;
            if outcome.cancelled {
                session.mark_tail_cancelled()?;
            }
            self.publish(CoreEvent::MessageAppended {
                session_id: session_id.to_owned(),
                message_id: message.message_id,
                role: MessageRole::Assistant,
            });
        }

        for contribution in &outcome.contributions {
            for tool in &contribution.tools_used {
                self.publish(CoreEvent::ToolInvoked {
                    session_id: session_id.to_owned(),
                    tool_name: tool.clone(),
                    success: contribution.success,
                });
            }
        }

        let success = outcome.success && !outcome.cancelled;
        let boost = retrieved.confidence_boost;
        let confidence = ((outcome.confidence + boost).min(1.0)
            * outcome.completed_fraction.clamp(0.0, 1.0))
        .clamp(0.0, 1.0);

        let tools_invoked: Vec<String> = outcome
            .contributions
            .iter()
            .flat_map(|c| c.tools_used.iter().cloned())
            .collect();
        let total_duration_ms = started.elapsed().as_millis() as u64;
        let interaction_id = Uuid::new_v4().to_string();

        let record = InteractionRecord {
            interaction_id: interaction_id.clone(),
            session_id: session_id.to_owned(),
            query: query.to_owned(),
            response: outcome.content.clone(),
            routing: decision.clone(),
            tools_used: tools_invoked.clone(),
            success,
            execution_time_ms: total_duration_ms,
            confidence,
            feedback_score: None,
            created_at_ms: Utc::now().timestamp_millis(),
        };
        if let Err(e) = self.fabric.record_interaction(record.clone()).await {
            log::warn!("[orchestrator] interaction not recorded: {e}");
        }
        self.publish(CoreEvent::InteractionRecorded {
            session_id: session_id.to_owned(),
            interaction_id: interaction_id.clone(),
            success,
        });
        self.telemetry.record_interaction(&record).await;
        self.telemetry
            .record_span(&SpanRecord {
                component: "orchestrator".to_owned(),
                name: "process".to_owned(),
                duration_ms: total_duration_ms,
                success,
            })
            .await;
        self.learning.submit(LearningEvent::Outcome {
            interaction_id: interaction_id.clone(),
            participants: participants_of(&decision),
            intent: decision.intent,
            success,
            latency_ms: total_duration_ms,
            confidence,
        });

        log::info!(
            "[orchestrator] processed session={session_id} mode={} intent={} success={success} \
             confidence={confidence:.2} duration_ms={total_duration_ms}",
            decision.mode,
            decision.intent
        );

        if outcome.cancelled {
            return Err(CoreError::Cancelled(
                "deadline exceeded during execution".into(),
            ));
        }
        if let Some(fatal) = outcome.fatal {
            return Err(fatal);
        }

        Ok(OrchestrationResult {
            interaction_id,
            session_id: session_id.to_owned(),
            content: outcome.content,
            mode: decision.mode,
            intent: decision.intent,
            confidence,
            success,
            contributions: outcome.contributions,
            tools_invoked,
            total_duration_ms,
        })
    }

    pub(crate) fn publish(&self, event: CoreEvent) {
        if let Some(bus) = &self.bus {
            bus.publish(event);
        }
    }
}

fn participants_of(decision: &RoutingDecision) -> Vec<(String, Vec<Capability>)> {
    decision
        .assignments
        .iter()
        .map(|a| (a.agent_id.clone(), vec![a.capability]))
        .collect()
}
