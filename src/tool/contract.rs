//! The uniform surface every capability-bearing tool presents to the core.
//!
//! Tools never raise across the boundary: `execute` always returns a
//! [`UnifiedResult`], with failures expressed as typed error info. Action
//! strings are namespaced per tool; a tool receiving an action it does not
//! implement fails with a validation error and records nothing observable.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{capability::Capability, error::ErrorKind};

// ─── ToolHealth ───────────────────────────────────────────────────────────────

/// Health classification reported by a tool's probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolHealth {
    Available,
    Degraded,
    Unavailable,
}

/// Probe result: health class plus the last observed response time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolHealthReport {
    pub health: ToolHealth,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_response_time_ms: Option<u64>,
}

impl ToolHealthReport {
    pub fn available() -> Self {
        Self {
            health: ToolHealth::Available,
            last_response_time_ms: None,
        }
    }
}

// ─── UnifiedResult ────────────────────────────────────────────────────────────

/// Typed error carried inside a [`UnifiedResult`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

/// The uniform result shape of every tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnifiedResult {
    pub success: bool,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolErrorInfo>,
    pub execution_time_ms: u64,
    pub tool_name: String,
    /// The tool's primary capability, as a wire label.
    pub category: String,
}

impl UnifiedResult {
    pub fn ok(
        tool_name: impl Into<String>,
        category: impl Into<String>,
        data: Value,
        execution_time_ms: u64,
    ) -> Self {
        Self {
            success: true,
            data,
            error: None,
            execution_time_ms,
            tool_name: tool_name.into(),
            category: category.into(),
        }
    }

    pub fn failure(
        tool_name: impl Into<String>,
        category: impl Into<String>,
        kind: ErrorKind,
        message: impl Into<String>,
        execution_time_ms: u64,
    ) -> Self {
        Self {
            success: false,
            data: Value::Null,
            error: Some(ToolErrorInfo {
                kind,
                message: message.into(),
            }),
            execution_time_ms,
            tool_name: tool_name.into(),
            category: category.into(),
        }
    }

    /// Kind of the carried error, if any.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

// ─── PrivilegePolicy ──────────────────────────────────────────────────────────

/// Input policy a tool advertises at registration.
///
/// Privileged tools (file writes, shell, network post) must register with
/// [`PrivilegePolicy::Guarded`]; the manager enforces the action allowlist
/// and the argument blocklist at the call boundary, and never retries a
/// privileged invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PrivilegePolicy {
    /// Read-like tool with no side effects; invocations may be retried.
    Open,
    /// Side-effecting tool with an enforced input policy.
    Guarded {
        /// Actions that may be invoked; anything else is rejected.
        allowed_actions: Vec<String>,
        /// Substring patterns that, when found in the serialized arguments,
        /// reject the invocation.
        blocked_patterns: Vec<String>,
    },
}

impl PrivilegePolicy {
    pub fn is_guarded(&self) -> bool {
        matches!(self, PrivilegePolicy::Guarded { .. })
    }
}

// ─── Tool ─────────────────────────────────────────────────────────────────────

/// A capability-bearing tool the core can dispatch work to.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Stable machine identifier (snake_case), e.g. `"web_search"`.
    fn name(&self) -> &str;

    /// Capabilities this tool implements. Must be non-empty.
    fn capabilities(&self) -> &[Capability];

    /// Whether the tool performs privileged operations.
    fn privileged(&self) -> bool {
        false
    }

    /// Input policy; privileged tools must return `Guarded`.
    fn policy(&self) -> PrivilegePolicy {
        PrivilegePolicy::Open
    }

    /// One-time setup before the first execution.
    async fn initialize(&self) -> Result<(), String> {
        Ok(())
    }

    /// Release held resources. Called once when the tool is removed.
    async fn shutdown(&self) {}

    /// Liveness probe.
    async fn health(&self) -> ToolHealthReport {
        ToolHealthReport::available()
    }

    /// Execute `action` with `args`. Unknown actions and invalid arguments
    /// fail with a validation-kind [`UnifiedResult`]; this method never
    /// panics or returns a transport error.
    async fn execute(&self, action: &str, args: Value) -> UnifiedResult;
}

// ─── Tests ────────────────────────────────────────────────────────────────────
