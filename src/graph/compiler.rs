//! Flow graph → compiled sequence.
//!
//! The compiler picks one linear path through the graph:
//! 1. start candidates are nodes without incoming edges, tried in creation order;
//! 2. from each, a depth-first walk follows outgoing edges in creation order,
//!    abandoning any branch that would revisit a node already on the path;
//! 3. the first walk to reach a sink (no outgoing edges) is the result.
//!
//! Nodes off that path are not merged or branched into the sequence. They are
//! dropped with a warning, or rejected under `UnreachablePolicy::Reject`.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use thiserror::Error;
use tracing::{debug, info, warn};

use super::model::{FlowGraph, NodeId};
use crate::model::{CompiledSequence, Step};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CompileError {
    #[error("the graph has no nodes to start from")]
    NoStartNode,

    #[error("every path through the graph runs into a cycle")]
    Cyclic,

    #[error("nodes not on the compiled path: {}", excluded.join(", "))]
    Disconnected { excluded: Vec<String> },
}

/// What to do with nodes that are not on the chosen path.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum UnreachablePolicy {
    /// Leave them out and log them.
    #[default]
    Exclude,
    /// Fail with `CompileError::Disconnected`.
    Reject,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct CompileOptions {
    pub unreachable: UnreachablePolicy,
}

impl CompileOptions {
    pub fn strict() -> Self {
        Self {
            unreachable: UnreachablePolicy::Reject,
        }
    }
}

/// Compile with default options.
pub fn compile(graph: &FlowGraph) -> Result<CompiledSequence, CompileError> {
    compile_with(graph, CompileOptions::default())
}

pub fn compile_with(
    graph: &FlowGraph,
    options: CompileOptions,
) -> Result<CompiledSequence, CompileError> {
    if graph.is_empty() {
        return Err(CompileError::NoStartNode);
    }

    let mut adjacency: BTreeMap<NodeId, Vec<NodeId>> =
        graph.nodes().map(|n| (n.id(), Vec::new())).collect();
    let mut has_incoming = BTreeSet::new();
    for edge in graph.edges() {
        if let Some(targets) = adjacency.get_mut(&edge.from) {
            targets.push(edge.to);
        }
        has_incoming.insert(edge.to);
    }

    let starts: Vec<NodeId> = adjacency
        .keys()
        .copied()
        .filter(|id| !has_incoming.contains(id))
        .collect();
    if starts.is_empty() {
        return Err(CompileError::Cyclic);
    }

    // Nodes that cannot reach any sink never end up on an accepted path.
    let live = reaching_sink(&adjacency);
    for targets in adjacency.values_mut() {
        targets.retain(|t| live.contains(t));
    }

    let path = starts
        .iter()
        .find_map(|&start| {
            let walk = walk_to_sink(&adjacency, &live, start);
            if walk.is_none() {
                debug!(target: "clickflow::graph", %start, "Every walk from start node hits a cycle");
            }
            walk
        })
        .ok_or(CompileError::Cyclic)?;

    let on_path: BTreeSet<NodeId> = path.iter().copied().collect();
    let excluded: Vec<String> = graph
        .nodes()
        .filter(|n| !on_path.contains(&n.id()))
        .map(|n| n.name().to_string())
        .collect();
    if !excluded.is_empty() {
        match options.unreachable {
            UnreachablePolicy::Exclude => warn!(
                target: "clickflow::graph",
                excluded = %excluded.join(", "),
                "Nodes not on the compiled path were left out"
            ),
            UnreachablePolicy::Reject => return Err(CompileError::Disconnected { excluded }),
        }
    }

    let sequence: CompiledSequence = path
        .iter()
        .filter_map(|id| graph.node(*id))
        .map(|node| Step::new(node.image().clone(), *node.settings()))
        .collect();
    info!(
        target: "clickflow::graph",
        steps = sequence.len(),
        order = %sequence.names().join(" -> "),
        "Graph compiled"
    );
    Ok(sequence)
}

/// Nodes with a path to some sink, found by walking edges backwards from the sinks.
fn reaching_sink(adjacency: &BTreeMap<NodeId, Vec<NodeId>>) -> BTreeSet<NodeId> {
    let mut reverse: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
    for (&from, targets) in adjacency {
        for &to in targets {
            reverse.entry(to).or_default().push(from);
        }
    }

    let mut live: BTreeSet<NodeId> = adjacency
        .iter()
        .filter(|(_, targets)| targets.is_empty())
        .map(|(&id, _)| id)
        .collect();
    let mut queue: VecDeque<NodeId> = live.iter().copied().collect();
    while let Some(id) = queue.pop_front() {
        for &pred in reverse.get(&id).into_iter().flatten() {
            if live.insert(pred) {
                queue.push_back(pred);
            }
        }
    }
    live
}

/// Depth-first walk from `start`; returns the first path ending at a sink.
///
/// `adjacency` must already be pruned to `live` nodes, so a node whose target
/// list is empty is a real sink.
fn walk_to_sink(
    adjacency: &BTreeMap<NodeId, Vec<NodeId>>,
    live: &BTreeSet<NodeId>,
    start: NodeId,
) -> Option<Vec<NodeId>> {
    if !live.contains(&start) {
        return None;
    }

    let mut path = vec![start];
    let mut cursors = vec![0usize];
    let mut on_path = BTreeSet::from([start]);

    while let (Some(&node), Some(cursor)) = (path.last(), cursors.last_mut()) {
        let targets = adjacency.get(&node).map(Vec::as_slice).unwrap_or_default();
        if targets.is_empty() {
            return Some(path);
        }
        match targets.get(*cursor) {
            Some(&next) => {
                *cursor += 1;
                if on_path.contains(&next) {
                    debug!(target: "clickflow::graph", from = %node, to = %next, "Cycle; abandoning branch");
                    continue;
                }
                on_path.insert(next);
                path.push(next);
                cursors.push(0);
            }
            None => {
                on_path.remove(&node);
                path.pop();
                cursors.pop();
            }
        }
    }
    None
}
