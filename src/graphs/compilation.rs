//! Compile-time validation (§4.B): entry exists, edge targets exist, no
//! node is named `Start`/`End`, and reachability from entry to `End`.

use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use thiserror::Error;

use crate::app::App;
use crate::graphs::builder::GraphBuilder;
use crate::graphs::edges::ConditionalEdge;
use crate::types::NodeKind;

#[derive(Debug, Error, Diagnostic)]
pub enum GraphCompileError {
    #[error("no entry node set; call GraphBuilder::set_entry")]
    #[diagnostic(code(stepgraph::graphs::no_entry))]
    NoEntry,

    #[error("entry node {0:?} was never registered with add_node")]
    #[diagnostic(code(stepgraph::graphs::unknown_entry))]
    UnknownEntry(String),

    #[error("node name {0:?} is reserved for the virtual Start/End sentinels")]
    #[diagnostic(code(stepgraph::graphs::reserved_node_name))]
    ReservedNodeName(String),

    #[error("edge {from:?} -> {to:?} targets an unregistered node")]
    #[diagnostic(code(stepgraph::graphs::unknown_edge_target))]
    UnknownEdgeTarget { from: String, to: String },

    #[error("conditional edge from {from:?} label {label:?} targets an unregistered node {to:?}")]
    #[diagnostic(code(stepgraph::graphs::unknown_conditional_target))]
    UnknownConditionalTarget {
        from: String,
        label: String,
        to: String,
    },
}

pub(super) fn compile(builder: GraphBuilder) -> Result<App, GraphCompileError> {
    let (nodes, node_roles, edges, conditional_edges, entry, schema, runtime_config) =
        builder.into_parts();

    for name in nodes.keys() {
        if name.is_start() || name.is_end() {
            return Err(GraphCompileError::ReservedNodeName(name.encode()));
        }
    }

    let entry = entry.ok_or(GraphCompileError::NoEntry)?;
    if !entry.is_start() && !nodes.contains_key(&entry) {
        return Err(GraphCompileError::UnknownEntry(entry.encode()));
    }

    let target_exists = |n: &NodeKind| n.is_end() || n.is_start() || nodes.contains_key(n);

    for (from, tos) in &edges {
        for to in tos {
            if !target_exists(to) {
                return Err(GraphCompileError::UnknownEdgeTarget {
                    from: from.encode(),
                    to: to.encode(),
                });
            }
        }
    }
    for ce in &conditional_edges {
        for (label, to) in &ce.labels {
            if !target_exists(to) {
                return Err(GraphCompileError::UnknownConditionalTarget {
                    from: ce.from.encode(),
                    label: label.clone(),
                    to: to.encode(),
                });
            }
        }
    }

    warn_on_unreachable(&entry, &nodes, &edges, &conditional_edges);

    Ok(App::from_parts(
        nodes,
        node_roles,
        edges,
        conditional_edges,
        entry,
        schema,
        runtime_config,
    ))
}

/// Logs (does not fail compilation on) nodes unreachable from `entry`, and
/// whether `End` is reachable at all — both informational per §4.B.
fn warn_on_unreachable(
    entry: &NodeKind,
    nodes: &FxHashMap<NodeKind, std::sync::Arc<dyn crate::node::Node>>,
    edges: &FxHashMap<NodeKind, Vec<NodeKind>>,
    conditional_edges: &[ConditionalEdge],
) {
    let mut visited: FxHashSet<NodeKind> = FxHashSet::default();
    let mut queue = VecDeque::new();
    queue.push_back(entry.clone());
    visited.insert(entry.clone());
    let mut reached_end = false;

    while let Some(current) = queue.pop_front() {
        if current.is_end() {
            reached_end = true;
        }
        if let Some(targets) = edges.get(&current) {
            for target in targets {
                if visited.insert(target.clone()) {
                    queue.push_back(target.clone());
                }
            }
        }
        for ce in conditional_edges.iter().filter(|ce| ce.from == current) {
            for target in ce.labels.values() {
                if visited.insert(target.clone()) {
                    queue.push_back(target.clone());
                }
            }
        }
    }

    if !reached_end {
        tracing::warn!(entry = %entry, "no path from entry to End was found during compilation");
    }
    for name in nodes.keys() {
        if !visited.contains(name) {
            tracing::warn!(node = %name, "node is unreachable from the entry point");
        }
    }
}
