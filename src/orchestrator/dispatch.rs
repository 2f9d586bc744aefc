//! The single-dispatch contract: check an agent out of the registry, invoke
//! it under its timeout, retry transient failures, and return it.
//!
//! Retry policy: only transient failures are re-attempted, with exponential
//! backoff, and never past the retry budget or the global deadline. A
//! dispatch cut off by the global deadline grants the agent the configured
//! grace period to return cooperatively; an agent that overruns it is
//! quarantined as degraded.

use std::time::{Duration, Instant};

use crate::{
    agent::InvocationContext,
    config::OrchestratorConfig,
    error::CoreError,
    registry::AgentRegistry,
    router::RoutingAssignment,
};

use super::AgentContribution;

/// Execute one assignment to completion. Never returns an error: every
/// failure shape is folded into the contribution so mode logic can decide
/// what it means.
pub(crate) async fn dispatch_assignment(
    registry: &AgentRegistry,
    assignment: &RoutingAssignment,
    ctx: InvocationContext,
    cfg: &OrchestratorConfig,
) -> AgentContribution {
    let started = Instant::now();
    let deadline = ctx.deadline;

    if let Err(e) = deadline.check() {
        return AgentContribution::failed(assignment, e, 0, 0);
    }

    let agent = match registry.checkout(&assignment.agent_id, deadline).await {
        Ok(agent) => agent,
        Err(e) => {
            return AgentContribution::failed(assignment, e, 0, started.elapsed().as_millis() as u64);
        }
    };

    let per_agent = Duration::from_millis(cfg.per_agent_timeout_ms.max(1));
    let grace = Duration::from_millis(cfg.cancel_grace_ms);
    let base_backoff = Duration::from_millis(cfg.retry_base_backoff_ms.max(1));
    let mut attempts: u32 = 0;

    let final_err = loop {
        attempts += 1;
        // A dispatch straddling the global deadline gets the remaining time
        // plus the cooperative grace window; otherwise the per-agent bound.
        let (window, cut_by_global) = match deadline.remaining() {
            Some(rem) if rem < per_agent => (rem + grace, true),
            _ => (per_agent, false),
        };

        match tokio::time::timeout(window, agent.invoke(ctx.clone())).await {
            Ok(Ok(reply)) => {
                let latency = started.elapsed().as_millis() as u64;
                if let Err(e) = registry.complete(&assignment.agent_id, true, latency).await {
                    log::error!("[orchestrator] agent return failed: {e}");
                }
                log::debug!(
                    "[orchestrator] dispatched agent_id={} attempts={attempts} duration_ms={latency}",
                    assignment.agent_id
                );
                return AgentContribution {
                    agent_id: assignment.agent_id.clone(),
                    capability: assignment.capability,
                    content: reply.content,
                    confidence: reply.confidence,
                    success: true,
                    error: None,
                    duration_ms: latency,
                    tools_used: reply.tools_used,
                    attempts,
                };
            }
            Ok(Err(e)) => {
                if e.retriable() && attempts <= cfg.retry_max_n && !deadline.expired() {
                    log::debug!(
                        "[orchestrator] transient failure agent_id={} attempt={attempts}: {e}",
                        assignment.agent_id
                    );
                    backoff_sleep(base_backoff, attempts, deadline).await;
                    continue;
                }
                break e;
            }
            Err(_elapsed) => {
                if cut_by_global {
                    // Ran past the deadline plus grace: quarantine.
                    if let Err(e) = registry
                        .mark_degraded(&assignment.agent_id, "cancellation overrun")
                        .await
                    {
                        log::error!("[orchestrator] quarantine failed: {e}");
                    }
                    let latency = started.elapsed().as_millis() as u64;
                    return AgentContribution::failed(
                        assignment,
                        CoreError::Cancelled(format!(
                            "agent '{}' did not return within the cancellation grace period",
                            assignment.agent_id
                        )),
                        attempts,
                        latency,
                    );
                }
                let e = CoreError::Transient(format!(
                    "agent '{}' timed out after {}ms",
                    assignment.agent_id,
                    per_agent.as_millis()
                ));
                if attempts <= cfg.retry_max_n && !deadline.expired() {
                    backoff_sleep(base_backoff, attempts, deadline).await;
                    continue;
                }
                break e;
            }
        }
    };

    let latency = started.elapsed().as_millis() as u64;
    // A cooperative cancellation is a clean return, not an agent fault.
    let clean = matches!(final_err, CoreError::Cancelled(_));
    if let Err(e) = registry.complete(&assignment.agent_id, clean, latency).await {
        log::error!("[orchestrator] agent return failed: {e}");
    }
    AgentContribution::failed(assignment, final_err, attempts, latency)
}

/// Exponential backoff bounded by the remaining deadline.
async fn backoff_sleep(base: Duration, attempt: u32, deadline: super::Deadline) {
    let delay = base * 2u32.saturating_pow(attempt.saturating_sub(1));
    let delay = match deadline.remaining() {
        Some(rem) => delay.min(rem),
        None => delay,
    };
    tokio::time::sleep(delay).await;
}
