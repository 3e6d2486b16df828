//! Sparse matmul encodability.
//!
//! Whether a sparse matmul model can be encoded is expensive to find out,
//! so viable models are remembered by [`OpModelId`] for the rest of the
//! pass. Rejections are not cached.

use std::collections::HashSet;

use tracing::trace;

use balancer_core::{
    BalancerError, BalancerResult, Graph, OpModel, OpModelId, SparseEncodeRequest, SparseEncoder, SparseLayout,
};

/// Outcome of validating one sparse matmul model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SparseValidation {
    Viable,
    /// The encoder could not encode the model; carries its reason.
    Rejected(String),
}

impl SparseValidation {
    pub fn is_viable(&self) -> bool {
        matches!(self, SparseValidation::Viable)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SparseValidationCache {
    validated: HashSet<OpModelId>,
    force_buffer_layout: bool,
}

impl SparseValidationCache {
    /// With `force_buffer_layout` every model is encoded with the buffer-op layout.
    pub fn new(force_buffer_layout: bool) -> Self {
        Self {
            validated: HashSet::new(),
            force_buffer_layout,
        }
    }

    /// Encoding geometry for `model`.
    pub fn request(&self, model: &OpModel) -> BalancerResult<SparseEncodeRequest> {
        let weights = model.input_buffers.get(1).ok_or_else(|| {
            BalancerError::precondition(format!("sparse op model {:?} has no weight buffer", model.id))
        })?;
        let layout = SparseLayout::create(
            model.has_sparse_buffer || self.force_buffer_layout,
            model.t_stream_factor.z_major,
            model.fracture_factor,
        );
        Ok(SparseEncodeRequest {
            grid_r: model.grid_shape.r,
            t_r: model.t_stream_factor.r,
            t_c: model.t_stream_factor.c,
            u_rt: model.block_shape().ublock.rt,
            u_kt: weights.block_shape.ublock.rt,
            fracture_factor: model.fracture_factor,
            layout,
        })
    }

    /// Validate a model of a sparse matmul, consulting the cache first.
    pub fn validate(
        &mut self,
        graph: &Graph,
        model: &OpModel,
        encoder: &impl SparseEncoder,
    ) -> BalancerResult<SparseValidation> {
        if self.validated.contains(&model.id) {
            return Ok(SparseValidation::Viable);
        }
        if model.op.0 >= graph.len() {
            return Err(BalancerError::UnknownNode(model.op.to_string()));
        }
        let node = graph.node(model.op);
        if !node.is_sparse_matmul() {
            return Err(BalancerError::precondition(format!("{} is not a sparse matmul", node.name)));
        }

        let request = self.request(model)?;
        match encoder.encode(model.op, &request) {
            Ok(encoding) => {
                trace!(op = %node.name, model = model.id.0, tiles = encoding.tiles, "sparse model encodable");
                self.validated.insert(model.id);
                Ok(SparseValidation::Viable)
            }
            Err(reason) => {
                trace!(op = %node.name, model = model.id.0, %reason, "rejecting sparse matmul that can't be encoded");
                Ok(SparseValidation::Rejected(reason))
            }
        }
    }

    pub fn len(&self) -> usize {
        self.validated.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validated.is_empty()
    }

    /// Forget every validated model; call between independent passes.
    pub fn reset(&mut self) {
        self.validated.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use balancer_core::{
        BlockShape, BufferModel, GridShape, MatmulKind, NodeId, OpAttrs, Shape, SparseEncoding, TStreamFactor,
        UBlockShape,
    };

    struct CountingEncoder {
        calls: Cell<u32>,
        max_grid_r: u32,
    }

    impl SparseEncoder for CountingEncoder {
        fn encode(&self, _op: NodeId, request: &SparseEncodeRequest) -> Result<SparseEncoding, String> {
            self.calls.set(self.calls.get() + 1);
            if request.grid_r > self.max_grid_r {
                return Err(format!("grid_r {} too tall", request.grid_r));
            }
            Ok(SparseEncoding {
                tiles: 4,
                encodings: 1,
                strips_per_row: 1,
            })
        }
    }

    fn make_graph() -> (Graph, NodeId) {
        let mut g = Graph::new("sparse");
        let sparse = g
            .add_op("sparse", OpAttrs::matmul(MatmulKind::Sparse), Shape::tiles(8, 8))
            .unwrap();
        (g, sparse)
    }

    fn make_model(id: u64, op: NodeId, r: u32) -> OpModel {
        let block = BlockShape::new(1, 1, 1, UBlockShape::new(2, 1));
        OpModel::new(OpModelId(id), op, GridShape::new(r, 1), block).with_inputs(vec![
            BufferModel::new(block, 0).prologue(),
            BufferModel::new(BlockShape::new(1, 1, 1, UBlockShape::new(4, 1)), 0),
            BufferModel::new(block, 0).prologue(),
        ])
    }

    #[test]
    fn viable_models_are_encoded_once() {
        let (g, sparse) = make_graph();
        let encoder = CountingEncoder {
            calls: Cell::new(0),
            max_grid_r: 4,
        };
        let mut cache = SparseValidationCache::new(false);
        let model = make_model(1, sparse, 2);
        assert_eq!(cache.validate(&g, &model, &encoder).unwrap(), SparseValidation::Viable);
        assert_eq!(cache.validate(&g, &model, &encoder).unwrap(), SparseValidation::Viable);
        assert_eq!(encoder.calls.get(), 1);
        assert_eq!(cache.len(), 1);

        cache.reset();
        assert!(cache.is_empty());
        cache.validate(&g, &model, &encoder).unwrap();
        assert_eq!(encoder.calls.get(), 2);
    }

    #[test]
    fn unencodable_models_are_rejected_not_errors() {
        let (g, sparse) = make_graph();
        let encoder = CountingEncoder {
            calls: Cell::new(0),
            max_grid_r: 4,
        };
        let mut cache = SparseValidationCache::new(false);
        let result = cache.validate(&g, &make_model(1, sparse, 8), &encoder).unwrap();
        assert!(!result.is_viable());
        assert!(cache.is_empty());
    }

    #[test]
    fn request_geometry() {
        let (_, sparse) = make_graph();
        let mut model = make_model(1, sparse, 3).with_t_stream(TStreamFactor {
            r: 2,
            c: 1,
            z_major: true,
        });
        let request = SparseValidationCache::new(false).request(&model).unwrap();
        assert_eq!(request.grid_r, 3);
        assert_eq!(request.t_r, 2);
        assert_eq!(request.u_rt, 2);
        assert_eq!(request.u_kt, 4);
        assert_eq!(request.layout, SparseLayout::ZMajor);

        let forced = SparseValidationCache::new(true).request(&model).unwrap();
        assert_eq!(forced.layout, SparseLayout::BufferOp);

        model.input_buffers.truncate(1);
        assert!(SparseValidationCache::new(false).request(&model).is_err());
    }

    #[test]
    fn non_sparse_op_is_a_precondition_error() {
        let mut g = Graph::new("dense");
        let dense = g.add_op("dense", OpAttrs::matmul(MatmulKind::Dense), Shape::tiles(8, 8)).unwrap();
        let encoder = CountingEncoder {
            calls: Cell::new(0),
            max_grid_r: 4,
        };
        let mut cache = SparseValidationCache::new(false);
        assert!(cache.validate(&g, &make_model(1, dense, 1), &encoder).is_err());
        assert_eq!(encoder.calls.get(), 0);
    }
}
