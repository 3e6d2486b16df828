//! Sparse/dense matmul pairing.
//!
//! A sparse matmul and the dense matmul it feeds can be placed as one
//! block when they share a row count and fit side by side in one epoch.

use balancer_core::{BalancerError, BalancerResult, GridShape, Graph, InteractivePlacer, NodeId, OpModel};

/// Whether `sparse` and `dense` may be bound and placed atomically.
pub fn can_bind_sparse_dense_matmul_pair(
    graph: &Graph,
    sparse: NodeId,
    sparse_model: &OpModel,
    dense: NodeId,
    dense_model: &OpModel,
    placer: &impl InteractivePlacer,
    allow_transpose: bool,
) -> bool {
    graph.node(sparse).is_sparse_matmul()
        && graph.should_pair_with_sparse(dense, sparse)
        && sparse_model.grid_shape.r == dense_model.grid_shape.r
        && is_sole_consumer(graph, sparse, dense)
        && placer.can_fit_on_single_epoch(
            sparse_model.grid_shape.r,
            sparse_model.grid_shape.c + dense_model.grid_shape.c,
            allow_transpose,
        )
}

fn is_sole_consumer(graph: &Graph, producer: NodeId, consumer: NodeId) -> bool {
    graph.data_users(producer) == [consumer]
}

/// Check whether two ops fit together in an empty epoch.
///
/// Places both on `scratch` and rewinds it. The scratch epoch must start
/// empty and the first op must fit on its own.
pub fn can_fit_on_single_epoch(
    scratch: &mut impl InteractivePlacer,
    first: (&str, GridShape),
    second: (&str, GridShape),
    enable_transpose: bool,
) -> BalancerResult<bool> {
    if !scratch.current_epoch_empty() {
        return Err(BalancerError::precondition("scratch placer epoch must be empty"));
    }
    if scratch.place_op(first.0, first.1, enable_transpose).is_none() {
        scratch.rewind_epoch();
        return Err(BalancerError::precondition(format!(
            "{} with grid {} does not fit an empty epoch",
            first.0, first.1
        )));
    }
    let fits = scratch.place_op(second.0, second.1, enable_transpose).is_some();
    scratch.rewind_epoch();
    Ok(fits)
}
