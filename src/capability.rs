//! The closed capability and intent vocabularies shared by the registry,
//! router, and orchestrator.
//!
//! Capabilities label what an agent can do; intents label what a query asks
//! for. The router owns the fixed intent → capability mapping
//! ([`Intent::required_capabilities`]), so adding a capability here without
//! wiring it into that table leaves it unreachable by routing.

use serde::{Deserialize, Serialize};

// ─── Capability ───────────────────────────────────────────────────────────────

/// A label from the closed set identifying what kind of work an agent or tool
/// can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Search,
    Analysis,
    Synthesis,
    Response,
    CodeGeneration,
    Documentation,
    Testing,
    Performance,
    Orchestration,
    Meta,
    Conversational,
    Research,
    Workflow,
}

impl Capability {
    /// All capabilities, in declaration order.
    pub const ALL: [Capability; 13] = [
        Capability::Search,
        Capability::Analysis,
        Capability::Synthesis,
        Capability::Response,
        Capability::CodeGeneration,
        Capability::Documentation,
        Capability::Testing,
        Capability::Performance,
        Capability::Orchestration,
        Capability::Meta,
        Capability::Conversational,
        Capability::Research,
        Capability::Workflow,
    ];

    /// Parse from the snake_case wire form. Returns `None` for unknown labels.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "search" => Some(Capability::Search),
            "analysis" => Some(Capability::Analysis),
            "synthesis" => Some(Capability::Synthesis),
            "response" => Some(Capability::Response),
            "code_generation" => Some(Capability::CodeGeneration),
            "documentation" => Some(Capability::Documentation),
            "testing" => Some(Capability::Testing),
            "performance" => Some(Capability::Performance),
            "orchestration" => Some(Capability::Orchestration),
            "meta" => Some(Capability::Meta),
            "conversational" => Some(Capability::Conversational),
            "research" => Some(Capability::Research),
            "workflow" => Some(Capability::Workflow),
            _ => None,
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Capability::Search => "search",
            Capability::Analysis => "analysis",
            Capability::Synthesis => "synthesis",
            Capability::Response => "response",
            Capability::CodeGeneration => "code_generation",
            Capability::Documentation => "documentation",
            Capability::Testing => "testing",
            Capability::Performance => "performance",
            Capability::Orchestration => "orchestration",
            Capability::Meta => "meta",
            Capability::Conversational => "conversational",
            Capability::Research => "research",
            Capability::Workflow => "workflow",
        };
        write!(f, "{s}")
    }
}

// ─── Intent ───────────────────────────────────────────────────────────────────

/// Classified purpose of an incoming query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Conversational,
    Search,
    CodeGeneration,
    Debugging,
    Documentation,
    Testing,
    Architecture,
    Research,
    Orchestration,
    Unknown,
}

impl Intent {
    /// The capabilities a query with this intent requires, in execution order.
    pub fn required_capabilities(&self) -> &'static [Capability] {
        match self {
            Intent::Conversational => &[Capability::Conversational],
            Intent::Search => &[Capability::Search],
            Intent::CodeGeneration => &[Capability::CodeGeneration],
            Intent::Debugging => &[Capability::Analysis, Capability::CodeGeneration],
            Intent::Documentation => &[Capability::Documentation],
            Intent::Testing => &[Capability::Testing],
            Intent::Architecture => &[Capability::Analysis, Capability::Synthesis],
            Intent::Research => &[
                Capability::Search,
                Capability::Analysis,
                Capability::Synthesis,
                Capability::Response,
            ],
            Intent::Orchestration => &[Capability::Orchestration],
            Intent::Unknown => &[Capability::Conversational],
        }
    }

    /// Parse from the snake_case wire form (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "conversational" => Some(Intent::Conversational),
            "search" => Some(Intent::Search),
            "code_generation" => Some(Intent::CodeGeneration),
            "debugging" => Some(Intent::Debugging),
            "documentation" => Some(Intent::Documentation),
            "testing" => Some(Intent::Testing),
            "architecture" => Some(Intent::Architecture),
            "research" => Some(Intent::Research),
            "orchestration" => Some(Intent::Orchestration),
            "unknown" => Some(Intent::Unknown),
            _ => None,
        }
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Intent::Conversational => "conversational",
            Intent::Search => "search",
            Intent::CodeGeneration => "code_generation",
            Intent::Debugging => "debugging",
            Intent::Documentation => "documentation",
            Intent::Testing => "testing",
            Intent::Architecture => "architecture",
            Intent::Research => "research",
            Intent::Orchestration => "orchestration",
            Intent::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
