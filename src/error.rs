//! Error taxonomy for the orchestration core.
//!
//! Every fallible operation in the core returns [`CoreError`], a closed set of
//! error kinds with fixed retry semantics:
//!
//! | kind                | retried | typical source                          |
//! |---------------------|---------|-----------------------------------------|
//! | `Validation`        | never   | malformed input, unknown id, cyclic plan |
//! | `Auth`              | never   | provider or tool rejected credentials    |
//! | `Transient`         | yes     | network, timeout, 5xx from a port        |
//! | `Conflict`          | never   | duplicate registration, busy unregister  |
//! | `ToolUnavailable`   | never   | tool health probe failed at dispatch     |
//! | `Cancelled`         | never   | deadline or explicit cancellation        |
//! | `InternalInvariant` | never   | a core invariant was violated            |
//!
//! Agents and ports translate lower-level failures into these kinds before
//! returning; retry loops and mode-level short-circuits inspect `kind()` at
//! the control boundary instead of matching on message text.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type used throughout the core.
pub type CoreResult<T> = Result<T, CoreError>;

// ─── ErrorKind ────────────────────────────────────────────────────────────────

/// The kind of a [`CoreError`], stripped of its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Auth,
    Transient,
    Conflict,
    ToolUnavailable,
    Cancelled,
    InternalInvariant,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Auth => "auth",
            ErrorKind::Transient => "transient",
            ErrorKind::Conflict => "conflict",
            ErrorKind::ToolUnavailable => "tool_unavailable",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InternalInvariant => "internal_invariant",
        };
        write!(f, "{s}")
    }
}

// ─── CoreError ────────────────────────────────────────────────────────────────

/// The single error type crossing component boundaries inside the core.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CoreError {
    /// Malformed input, unknown agent id, unresolved capability, cyclic plan.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A provider or tool rejected credentials. Surfaced verbatim.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// Network failure, timeout, or 5xx from a port. Retried per policy.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Duplicate registration or an operation on a busy resource.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A required tool reported `unavailable` at dispatch time.
    #[error("tool unavailable: {0}")]
    ToolUnavailable(String),

    /// Deadline expiry or explicit cancellation. Final for the request.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// An internal invariant was violated. The offending agent is quarantined.
    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Validation(_) => ErrorKind::Validation,
            CoreError::Auth(_) => ErrorKind::Auth,
            CoreError::Transient(_) => ErrorKind::Transient,
            CoreError::Conflict(_) => ErrorKind::Conflict,
            CoreError::ToolUnavailable(_) => ErrorKind::ToolUnavailable,
            CoreError::Cancelled(_) => ErrorKind::Cancelled,
            CoreError::InternalInvariant(_) => ErrorKind::InternalInvariant,
        }
    }

    /// Whether the retry policy may re-attempt the failed operation.
    pub fn retriable(&self) -> bool {
        matches!(self, CoreError::Transient(_))
    }

    /// Build a structured report for the transport layer.
    pub fn report(&self, component: impl Into<String>) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
            component: component.into(),
            retriable: self.retriable(),
        }
    }

    /// Short user-facing message derived from the kind alone.
    ///
    /// Never exposes raw internals; the full message stays in logs and in
    /// [`ErrorReport`] for operators.
    pub fn user_message(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Validation => "The request could not be understood.",
            ErrorKind::Auth => "Access was denied by an upstream service.",
            ErrorKind::Transient => "A temporary problem occurred. Please try again.",
            ErrorKind::Conflict => "The operation conflicts with current state.",
            ErrorKind::ToolUnavailable => "A required tool is currently unavailable.",
            ErrorKind::Cancelled => "The request was cancelled.",
            ErrorKind::InternalInvariant => "An internal error occurred.",
        }
    }
}

// ─── ErrorReport ──────────────────────────────────────────────────────────────

/// Serializable failure summary surfaced to the transport layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
    /// Which component produced the failure (e.g. `"router"`, `"orchestrator"`).
    pub component: String,
    pub retriable: bool,
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_retriable() {
        assert!(CoreError::Transient("timeout".into()).retriable());
        assert!(!CoreError::Validation("bad".into()).retriable());
        assert!(!CoreError::Auth("401".into()).retriable());
        assert!(!CoreError::Conflict("busy".into()).retriable());
        assert!(!CoreError::ToolUnavailable("down".into()).retriable());
        assert!(!CoreError::Cancelled("deadline".into()).retriable());
        assert!(!CoreError::InternalInvariant("bug".into()).retriable());
    }

    #[test]
    fn report_carries_component_and_kind() {
        let report = CoreError::Transient("socket closed".into()).report("router");
        assert_eq!(report.kind, ErrorKind::Transient);
        assert_eq!(report.component, "router");
        assert!(report.retriable);
        assert!(report.message.contains("socket closed"));
    }

    #[test]
    fn user_message_hides_internals() {
        let err = CoreError::Auth("key sk-123 rejected by upstream".into());
        assert!(!err.user_message().contains("sk-123"));
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::ToolUnavailable).unwrap();
        assert_eq!(json, "\"tool_unavailable\"");
    }
}
