//! In-memory legality tracker.
//!
//! Owns the candidate op models of every op, the chosen binding per op,
//! the cut-edge set and the buffering log. The cut set only ever grows:
//! there is no way to uncut an edge through this type.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::error::{BalancerError, BalancerResult};
use crate::graph::{Edge, Graph, NodeId};
use crate::interfaces::{BufferInfo, BufferResult, CutEdges, CutKind, GraphSolver};
use crate::model::OpModel;

#[derive(Debug, Clone, Default)]
pub struct LegalityTracker {
    candidates: HashMap<NodeId, Vec<OpModel>>,
    selected: HashMap<NodeId, OpModel>,
    cut_edges: CutEdges,
    buffered: Vec<BufferResult>,
    nops_inserted: u32,
}

impl LegalityTracker {
    /// Build a tracker from per-op candidates.
    ///
    /// Each model's `op` is overwritten with the key it is listed under.
    /// An op with no candidates is rejected.
    pub fn new(candidates: HashMap<NodeId, Vec<OpModel>>) -> BalancerResult<Self> {
        let mut bound = HashMap::with_capacity(candidates.len());
        for (op, mut models) in candidates {
            if models.is_empty() {
                return Err(BalancerError::EmptyCandidates(op.to_string()));
            }
            for model in &mut models {
                model.op = op;
            }
            bound.insert(op, models);
        }
        Ok(Self {
            candidates: bound,
            ..Self::default()
        })
    }

    /// Build a tracker from candidates keyed by op name.
    pub fn from_named(graph: &Graph, candidates: HashMap<String, Vec<OpModel>>) -> BalancerResult<Self> {
        let mut by_id = HashMap::with_capacity(candidates.len());
        for (name, models) in candidates {
            let id = graph.id_of(&name)?;
            if models.is_empty() {
                return Err(BalancerError::EmptyCandidates(name));
            }
            by_id.insert(id, models);
        }
        Self::new(by_id)
    }

    pub fn selected(&self, op: NodeId) -> Option<&OpModel> {
        self.selected.get(&op)
    }

    /// All bindings made so far, ordered by node id.
    pub fn selected_op_models(&self) -> Vec<(NodeId, &OpModel)> {
        let mut selected: Vec<(NodeId, &OpModel)> = self.selected.iter().map(|(id, m)| (*id, m)).collect();
        selected.sort_by_key(|(id, _)| *id);
        selected
    }

    pub fn is_cut(&self, edge: &Edge) -> bool {
        self.cut_edges.contains_key(edge)
    }

    pub fn buffered(&self) -> &[BufferResult] {
        &self.buffered
    }
}

impl GraphSolver for LegalityTracker {
    fn candidates(&self, op: NodeId) -> BalancerResult<&[OpModel]> {
        self.candidates
            .get(&op)
            .map(|m| m.as_slice())
            .ok_or_else(|| BalancerError::EmptyCandidates(op.to_string()))
    }

    fn set(&mut self, op: NodeId, model: &OpModel) -> BalancerResult<()> {
        let models = self
            .candidates
            .get_mut(&op)
            .ok_or_else(|| BalancerError::EmptyCandidates(op.to_string()))?;
        let chosen = models
            .iter()
            .find(|m| m.id == model.id)
            .cloned()
            .ok_or_else(|| {
                BalancerError::precondition(format!("op model {:?} is not a candidate of {op}", model.id))
            })?;
        // Binding narrows the op to its choice.
        *models = vec![chosen.clone()];
        self.selected.insert(op, chosen);
        Ok(())
    }

    fn cut(&mut self, edges: &[Edge], kind: CutKind) -> usize {
        let mut newly_cut = 0;
        for edge in edges {
            if !self.cut_edges.contains_key(edge) {
                self.cut_edges.insert(*edge, kind);
                newly_cut += 1;
            }
        }
        debug!(requested = edges.len(), newly_cut, ?kind, "cut edges");
        newly_cut
    }

    fn buffer(&mut self, requests: &[BufferInfo]) -> Vec<BufferResult> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            if request.nop_count == 0 {
                continue;
            }
            let nop_names: Vec<String> = (0..request.nop_count)
                .map(|i| {
                    format!(
                        "buffer_{}_{}_{}_{i}",
                        self.nops_inserted, request.edge.producer.0, request.edge.consumer.0
                    )
                })
                .collect();
            self.nops_inserted += 1;
            trace!(edge = ?request.edge, nops = request.nop_count, hoist_tms = request.hoist_tms, "buffered edge");
            let result = BufferResult {
                edge: request.edge,
                nop_names,
            };
            self.buffered.push(result.clone());
            results.push(result);
        }
        results
    }

    fn cut_edges(&self) -> &CutEdges {
        &self.cut_edges
    }
}
