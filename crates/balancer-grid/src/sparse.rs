//! Shape-only sparse encoder.
//!
//! Accepts a sparse matmul geometry when the sparse operand's rows split
//! evenly into `grid_r * t_r` strips of whole output micro-blocks and its
//! inner dimension splits into whole weight micro-blocks.

use std::collections::HashMap;

use balancer_core::{Graph, NodeId, Shape, SparseEncodeRequest, SparseEncoder, SparseEncoding};

#[derive(Debug, Clone, Default)]
pub struct TileGridEncoder {
    operand_shapes: HashMap<NodeId, Shape>,
}

impl TileGridEncoder {
    /// Record the sparse operand (operand 0) shape of every sparse matmul in `graph`.
    pub fn from_graph(graph: &Graph) -> Self {
        let operand_shapes = graph
            .nodes()
            .filter(|n| n.is_sparse_matmul())
            .filter_map(|n| {
                let operand = *graph.data_operands(n.id).first()?;
                Some((n.id, graph.node(operand).shape))
            })
            .collect();
        Self { operand_shapes }
    }
}

impl SparseEncoder for TileGridEncoder {
    fn encode(&self, op: NodeId, request: &SparseEncodeRequest) -> Result<SparseEncoding, String> {
        let shape = self
            .operand_shapes
            .get(&op)
            .ok_or_else(|| format!("{op} has no sparse operand"))?;

        let strips = request.grid_r * request.t_r;
        let strip_rows = strips * request.u_rt;
        if strip_rows == 0 || shape.rt % strip_rows != 0 {
            return Err(format!(
                "{} sparse rows do not split into {strips} strips of {}-tile micro-blocks",
                shape.rt, request.u_rt
            ));
        }
        if request.u_kt == 0 || shape.ct % request.u_kt != 0 {
            return Err(format!(
                "{} sparse columns do not split into {}-tile micro-blocks",
                shape.ct, request.u_kt
            ));
        }

        Ok(SparseEncoding {
            tiles: shape.rt * shape.ct,
            encodings: strips * request.fracture_factor,
            strips_per_row: shape.ct / request.u_kt,
        })
    }
}
