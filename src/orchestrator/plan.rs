//! Dynamic execution plans.
//!
//! The orchestration agent returns a [`PlanSpec`]: a finite list of nodes
//! with a DAG of dependencies. Validation rejects duplicate ids, unknown
//! dependency references, and cycles before anything is dispatched; the
//! validated plan is then grouped into topological generations so each
//! generation can run concurrently under the parallel-width bound.

use petgraph::{algo::toposort, graph::DiGraph};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

// ─── PlanSpec ─────────────────────────────────────────────────────────────────

/// How a dynamic plan's results are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanAggregator {
    /// Weighted mean of node confidences, outputs joined in node order.
    #[default]
    WeightedMean,
    /// Concatenate successful node outputs in node order.
    Concat,
}

/// One node of a dynamic plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanNode {
    pub id: String,
    pub agent_id: String,
    /// Instruction given to the agent as its query fragment.
    pub action: String,
    /// Ids of nodes whose outputs feed this node.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// A failed optional node yields an empty output instead of failing the
    /// nodes downstream of it.
    #[serde(default)]
    pub optional: bool,
}

/// A complete dynamic plan, as returned by an orchestration agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSpec {
    pub nodes: Vec<PlanNode>,
    #[serde(default)]
    pub aggregator: Option<PlanAggregator>,
}

impl PlanSpec {
    pub fn aggregator(&self) -> PlanAggregator {
        self.aggregator.unwrap_or_default()
    }
}

// ─── Validation ───────────────────────────────────────────────────────────────

/// Validate a plan and return its topological generations as node indices.
///
/// Generation `g` contains every node whose longest dependency chain has
/// length `g`; nodes within a generation are independent of each other and
/// keep their declared order.
pub fn validate_plan(plan: &PlanSpec) -> CoreResult<Vec<Vec<usize>>> {
    if plan.nodes.is_empty() {
        return Err(CoreError::Validation("plan has no nodes".into()));
    }

    let mut graph = DiGraph::<usize, ()>::new();
    let indices: Vec<_> = (0..plan.nodes.len()).map(|i| graph.add_node(i)).collect();

    for (i, node) in plan.nodes.iter().enumerate() {
        if plan.nodes[..i].iter().any(|n| n.id == node.id) {
            return Err(CoreError::Validation(format!(
                "duplicate plan node id '{}'",
                node.id
            )));
        }
        for dep in &node.depends_on {
            let Some(j) = plan.nodes.iter().position(|n| &n.id == dep) else {
                return Err(CoreError::Validation(format!(
                    "plan node '{}' depends on unknown node '{dep}'",
                    node.id
                )));
            };
            if j == i {
                return Err(CoreError::Validation(format!(
                    "plan node '{}' depends on itself",
                    node.id
                )));
            }
            graph.add_edge(indices[j], indices[i], ());
        }
    }

    if toposort(&graph, None).is_err() {
        return Err(CoreError::Validation("cyclic plan".into()));
    }

    // Longest-chain depth per node; dependencies are acyclic at this point.
    let mut depth = vec![0usize; plan.nodes.len()];
    let mut changed = true;
    while changed {
        changed = false;
        for (i, node) in plan.nodes.iter().enumerate() {
            for dep in &node.depends_on {
                if let Some(j) = plan.nodes.iter().position(|n| &n.id == dep) {
                    if depth[i] < depth[j] + 1 {
                        depth[i] = depth[j] + 1;
                        changed = true;
                    }
                }
            }
        }
    }

    let max_depth = depth.iter().copied().max().unwrap_or(0);
    let mut generations: Vec<Vec<usize>> = vec![Vec::new(); max_depth + 1];
    for (i, d) in depth.iter().enumerate() {
        generations[*d].push(i);
    }
    Ok(generations)
}

// ─── Tests ────────────────────────────────────────────────────────────────────
