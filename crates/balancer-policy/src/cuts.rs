//! Epoch and ribbon graph cuts.
//!
//! Edges that cross a committed epoch or ribbon boundary are handed to the
//! legality tracker to be cut, which materializes them through memory.
//! Cuts are never undone.

use std::collections::HashSet;

use tracing::debug;

use balancer_core::{BalancerResult, CutKind, Edge, Graph, GraphSolver, InteractivePlacer, NodeId};

/// Cut every data edge from an op in the open epoch to an op outside it.
///
/// Returns the number of newly cut edges.
pub fn cut_graph_solver_epoch(
    graph: &Graph,
    placer: &impl InteractivePlacer,
    solver: &mut impl GraphSolver,
) -> BalancerResult<usize> {
    let current_epoch_ops = placer.current_epoch_ops();
    let in_epoch: HashSet<&str> = current_epoch_ops.iter().map(String::as_str).collect();
    let already_cut = solver.cut_edges();

    let mut edges_to_cut: Vec<Edge> = Vec::new();
    for name in current_epoch_ops {
        let op = graph.id_of(name)?;
        for edge in graph.user_data_edges(op) {
            let user = graph.node(edge.consumer);
            if !user.is_op() || already_cut.contains_key(&edge) || in_epoch.contains(user.name.as_str()) {
                continue;
            }
            edges_to_cut.push(edge);
        }
    }

    if edges_to_cut.is_empty() {
        return Ok(0);
    }
    let cut = solver.cut(&edges_to_cut, CutKind::Epoch);
    debug!(ops = current_epoch_ops.len(), edges = cut, "epoch cut");
    Ok(cut)
}

/// Cut the operand edges of `op` whose producers are already placed.
///
/// Returns the number of newly cut edges.
pub fn cut_graph_solver_ribbon(
    graph: &Graph,
    op: NodeId,
    placer: &impl InteractivePlacer,
    solver: &mut impl GraphSolver,
) -> usize {
    let already_cut = solver.cut_edges();
    let edges_to_cut: Vec<Edge> = graph
        .operand_data_edges(op)
        .into_iter()
        .filter(|edge| placer.op_placed(&graph.node(edge.producer).name) && !already_cut.contains_key(edge))
        .collect();

    if edges_to_cut.is_empty() {
        return 0;
    }
    debug!(op = %graph.node(op).name, edges = edges_to_cut.len(), "cutting edges into op");
    solver.cut(&edges_to_cut, CutKind::Ribbon)
}

/// Drop every break group that names an already processed node.
///
/// A group's break decision is void once any of its ops is placed.
pub fn remove_processed_break_groups(graph: &Graph, groups: &mut Vec<Vec<String>>, processed: &HashSet<NodeId>) {
    if processed.is_empty() {
        return;
    }
    let before = groups.len();
    groups.retain(|group| {
        !group
            .iter()
            .any(|name| graph.find(name).is_some_and(|id| processed.contains(&id)))
    });
    if groups.len() != before {
        debug!(removed = before - groups.len(), "dropped processed break groups");
    }
}
