//! Collaborator seams.
//!
//! The balancer consumes the legalizer, the topological scheduler, the grid
//! packers and the sparse encoder through these traits. Reference
//! implementations live in `balancer-grid` and [`crate::legality`].

use std::collections::{BTreeMap, HashSet};

use crate::error::BalancerResult;
use crate::graph::{Edge, Graph, NodeEpochType, NodeId};
use crate::model::{GridShape, OpModel};
use crate::placement::{CoordRange, PlacerConfig, PlacerSolution};

/// Linear op order.
pub type Schedule = Vec<String>;

/// Why an edge was cut.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CutKind {
    /// Cut while resizing a ribbon or inserting a queue.
    Ribbon,
    /// Cut when sealing an epoch.
    Epoch,
}

/// Edges materialized through memory, with the reason they were cut.
pub type CutEdges = BTreeMap<Edge, CutKind>;

/// NOP buffering request for one edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferInfo {
    pub edge: Edge,
    pub nop_count: u32,
    /// Move the edge's tensor manipulations onto the inserted NOPs.
    pub hoist_tms: bool,
}

/// NOPs actually inserted for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferResult {
    pub edge: Edge,
    pub nop_names: Vec<String>,
}

/// Legality tracker: owns candidate op models, bindings and cuts.
pub trait GraphSolver {
    /// Legal op models for `op`, in legalizer order.
    fn candidates(&self, op: NodeId) -> BalancerResult<&[OpModel]>;

    /// Bind `model` as the choice for `op`.
    fn set(&mut self, op: NodeId, model: &OpModel) -> BalancerResult<()>;

    /// Cut `edges`; returns how many were not already cut.
    fn cut(&mut self, edges: &[Edge], kind: CutKind) -> usize;

    /// Insert NOPs on the requested edges in one batch.
    fn buffer(&mut self, requests: &[BufferInfo]) -> Vec<BufferResult>;

    fn cut_edges(&self) -> &CutEdges;
}

/// Rewindable placer that fills one epoch at a time.
pub trait InteractivePlacer {
    /// Place `name` in the open epoch, or `None` if it does not fit.
    fn place_op(&mut self, name: &str, shape: GridShape, enable_transpose: bool) -> Option<CoordRange>;

    /// Undo every placement in the open epoch.
    fn rewind_epoch(&mut self);

    /// Seal the open epoch and open a new one; returns the new epoch id.
    fn next_epoch(&mut self, epoch_type: NodeEpochType) -> u32;

    fn current_epoch_ops(&self) -> &[String];

    /// Placed in any epoch, sealed or open.
    fn op_placed(&self, name: &str) -> bool;

    /// Whether a `rows` x `cols` block fits in an empty epoch.
    fn can_fit_on_single_epoch(&self, rows: u32, cols: u32, enable_transpose: bool) -> bool;

    fn current_epoch_empty(&self) -> bool;
}

/// Inputs to a scheduling run.
#[derive(Debug, Clone, Default)]
pub struct SchedulerConfig {
    /// Nodes already processed; they are left out of the new schedule.
    pub ignored_nodes: HashSet<NodeId>,
    /// Each inner schedule must appear in this relative order.
    pub constraints: Vec<Schedule>,
}

pub trait Scheduler {
    fn schedule(&self, graph: &Graph, config: &SchedulerConfig) -> BalancerResult<Schedule>;
}

/// Places a whole schedule at once.
pub trait BatchPlacer {
    fn place(&self, config: &PlacerConfig, schedule: &[String]) -> BalancerResult<PlacerSolution>;
}

/// Tile layout used when encoding a sparse operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SparseLayout {
    Default,
    BufferOp,
    ZMajor,
}

impl SparseLayout {
    pub fn create(buffer_op: bool, z_major: bool, fracture_factor: u32) -> Self {
        if buffer_op {
            SparseLayout::BufferOp
        } else if z_major && fracture_factor == 1 {
            SparseLayout::ZMajor
        } else {
            SparseLayout::Default
        }
    }
}

/// Geometry a sparse matmul model would be encoded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseEncodeRequest {
    pub grid_r: u32,
    pub t_r: u32,
    pub t_c: u32,
    /// Output micro-block rows.
    pub u_rt: u32,
    /// Weight micro-block rows.
    pub u_kt: u32,
    pub fracture_factor: u32,
    pub layout: SparseLayout,
}

/// Summary of a successful encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseEncoding {
    pub tiles: u32,
    pub encodings: u32,
    pub strips_per_row: u32,
}

pub trait SparseEncoder {
    /// Encode the sparse operand of `op`; `Err` carries the reason it cannot be encoded.
    fn encode(&self, op: NodeId, request: &SparseEncodeRequest) -> Result<SparseEncoding, String>;
}
