//! Ribbon sizing.
//!
//! A ribbon is a run of scheduled ops that share one row count. Sizing
//! intersects the row counts each op can legally take; the window ends at
//! the next matmul whose output row dimension differs.

use std::collections::BTreeSet;

use tracing::{debug, trace};

use balancer_core::{BalancerResult, Graph, GraphSolver, Node, OpModel, RibbonConfig};

use crate::compare::prologue_ok;

/// A matmul that drives ribbon changes.
///
/// Sparse matmuls and matmuls tagged `reduce_r` / `reduce_c` do not.
pub fn is_ribbon_matmul(node: &Node) -> bool {
    node.is_matmul_not_sparse() && !node.has_tag("reduce_r") && !node.has_tag("reduce_c")
}

/// Buffering needed on a queue feeding a model, in rows.
pub fn ribbon_buffering_factor(model: &OpModel) -> u32 {
    model.grid_shape.r
}

/// Whether `model` may take part in a ribbon of its row count.
fn is_legal_for_ribbon(node: &Node, model: &OpModel, config: &RibbonConfig) -> bool {
    if config.skip_streaming && model.t_stream_factor.r > 1 {
        return false;
    }
    let rt = model.block_shape().rt();
    prologue_ok(node, model) && rt >= config.min_tile_height && rt <= config.max_tile_height
}

/// Row count for every op in `scheduled_ops[start..end]`.
///
/// Returns the smallest (or, with `maximize`, the largest) row count legal
/// for all ops. The search stops at the first op that empties the common
/// set. If that was the window's last op, returns the first row count, in
/// the same direction, that at least one op can take exactly and that every
/// op can take at or below. Otherwise, or when no row count qualifies,
/// falls back to 1.
pub fn pick_ribbon_size(
    start: usize,
    end: usize,
    graph: &Graph,
    solver: &impl GraphSolver,
    scheduled_ops: &[String],
    device_rows: u32,
    config: &RibbonConfig,
) -> BalancerResult<u32> {
    let max_ribbon_size = config.max_ribbon_size(device_rows);
    let end = end.min(scheduled_ops.len());
    let start = start.min(end);

    let mut candidates: BTreeSet<u32> = (1..=max_ribbon_size).collect();
    let mut valid_per_op: Vec<BTreeSet<u32>> = Vec::with_capacity(end - start);

    trace!(ops = end - start, max_ribbon_size, "starting ribbon size search");
    for name in &scheduled_ops[start..end] {
        let id = graph.id_of(name)?;
        let node = graph.node(id);
        let valid: BTreeSet<u32> = solver
            .candidates(id)?
            .iter()
            .filter(|model| is_legal_for_ribbon(node, model, config))
            .map(|model| model.grid_shape.r)
            .collect();
        trace!(op = %name, ?valid, "legal ribbon rows");

        candidates.retain(|r| valid.contains(r));
        valid_per_op.push(valid);
        if candidates.is_empty() {
            break;
        }
    }

    let common = if config.maximize {
        candidates.last()
    } else {
        candidates.first()
    };
    if let Some(size) = common {
        debug!(start, end, ribbon = *size, "ribbon size");
        return Ok(*size);
    }
    // Ops after the break have no legal rows on record and fit nothing.
    if valid_per_op.len() < end - start {
        debug!(start, end, examined = valid_per_op.len(), "no common ribbon size, using 1");
        return Ok(1);
    }

    let fits_at_or_below = |valid: &BTreeSet<u32>, limit: u32| valid.range(..=limit).next().is_some();
    let order: Vec<u32> = if config.maximize {
        (1..=max_ribbon_size).rev().collect()
    } else {
        (1..=max_ribbon_size).collect()
    };
    for candidate in order {
        let one_match = valid_per_op.iter().any(|valid| valid.contains(&candidate));
        if one_match && valid_per_op.iter().all(|valid| fits_at_or_below(valid, candidate)) {
            debug!(start, end, ribbon = candidate, "partial ribbon size");
            return Ok(candidate);
        }
    }

    debug!(start, end, "no ribbon size fits every op, using 1");
    Ok(1)
}

/// Where the next ribbon starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RibbonChange {
    /// Index of the first op of the next ribbon, or the schedule length.
    pub index: usize,
    /// Row dimension, in tiles, of the matmuls in the current ribbon.
    pub matmul_dim_r: u32,
}

/// Find the next index at or after `current_index` where the ribbon must change.
///
/// Pass `current_matmul_dim_r = 0` to start fresh; the first ribbon matmul
/// found then sets it. When the changing matmul is fed by a sparse matmul,
/// directly or through one buffering queue, the sparse matmul's index is
/// returned so the pair is resized together.
pub fn next_ribbon_change_op(
    graph: &Graph,
    current_index: usize,
    scheduled_ops: &[String],
    current_matmul_dim_r: u32,
) -> BalancerResult<RibbonChange> {
    let mut dim_r_tracked = current_matmul_dim_r;

    for i in current_index..scheduled_ops.len() {
        let node = graph.node_by_name(&scheduled_ops[i])?;
        if !node.is_op() || !is_ribbon_matmul(node) {
            continue;
        }

        let dim_r = node.shape.rt();
        if dim_r_tracked == 0 {
            dim_r_tracked = dim_r;
            continue;
        }
        if dim_r == dim_r_tracked {
            continue;
        }

        let change_at = |index: usize| RibbonChange {
            index,
            matmul_dim_r: dim_r_tracked,
        };

        for mut operand in graph.data_operands(node.id) {
            if graph.node(operand).is_buffering_queue()
                && let &[source] = graph.data_operands(operand).as_slice()
            {
                operand = source;
            }
            let operand_node = graph.node(operand);
            if !operand_node.is_op() {
                continue;
            }
            if operand_node.is_sparse_matmul()
                && let Some(sparse_index) = scheduled_ops[..i].iter().rposition(|name| *name == operand_node.name)
            {
                return Ok(change_at(sparse_index));
            }
            return Ok(change_at(i));
        }
    }

    Ok(RibbonChange {
        index: scheduled_ops.len(),
        matmul_dim_r: dim_r_tracked,
    })
}
