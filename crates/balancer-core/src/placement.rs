//! Placement results and the config handed to a batch placer.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::config::PlacerOverride;
use crate::graph::NodeEpochType;
use crate::model::GridShape;

/// Core coordinate within one chip's worker grid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Coord {
    pub row: u32,
    pub col: u32,
}

impl Coord {
    pub fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }
}

/// Rectangle of cores, `end` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CoordRange {
    pub start: Coord,
    pub end: Coord,
}

impl CoordRange {
    pub fn new(start: Coord, shape: GridShape) -> Self {
        Self {
            start,
            end: Coord::new(start.row + shape.r, start.col + shape.c),
        }
    }

    pub fn size_r(&self) -> u32 {
        self.end.row - self.start.row
    }

    pub fn size_c(&self) -> u32 {
        self.end.col - self.start.col
    }

    pub fn volume(&self) -> u32 {
        self.size_r() * self.size_c()
    }

    pub fn overlaps(&self, other: &CoordRange) -> bool {
        self.start.row < other.end.row
            && other.start.row < self.end.row
            && self.start.col < other.end.col
            && other.start.col < self.end.col
    }

    pub fn within(&self, grid: GridShape) -> bool {
        self.end.row <= grid.r && self.end.col <= grid.c
    }
}

/// Where one op landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpPlacement {
    pub name: String,
    pub chip_id: u32,
    pub epoch_id: u32,
    pub placed_cores: CoordRange,
    pub transposed: bool,
}

/// Complete placement of a schedule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlacerSolution {
    pub name_to_op_placement: BTreeMap<String, OpPlacement>,
    pub num_epochs: u32,
    pub epoch_id_to_chip: BTreeMap<u32, u32>,
    pub epoch_id_to_epoch_type: BTreeMap<u32, NodeEpochType>,
    pub epoch_id_to_temporal_epoch: BTreeMap<u32, u32>,
}

impl PlacerSolution {
    pub fn temporal_epoch_id(&self, op_name: &str) -> Option<u32> {
        let placement = self.name_to_op_placement.get(op_name)?;
        self.epoch_id_to_temporal_epoch.get(&placement.epoch_id).copied()
    }

    /// Distinct temporal epochs holding epochs of `epoch_type`.
    pub fn num_temporal_epochs(&self, epoch_type: NodeEpochType) -> u32 {
        let temporal: HashSet<u32> = self
            .epoch_id_to_epoch_type
            .iter()
            .filter(|(_, t)| **t == epoch_type)
            .filter_map(|(epoch, _)| self.epoch_id_to_temporal_epoch.get(epoch).copied())
            .collect();
        temporal.len() as u32
    }

    pub fn chip_id(&self, epoch_id: u32) -> Option<u32> {
        self.epoch_id_to_chip.get(&epoch_id).copied()
    }

    /// Op names per epoch, in name order.
    pub fn epoch_ops(&self, epoch_id: u32) -> Vec<&str> {
        self.name_to_op_placement
            .values()
            .filter(|p| p.epoch_id == epoch_id)
            .map(|p| p.name.as_str())
            .collect()
    }
}

/// Everything a batch placer needs beyond the schedule itself.
#[derive(Debug, Clone, Default)]
pub struct PlacerConfig {
    pub chip_ids: Vec<u32>,
    pub device_grid: GridShape,
    pub contains_recompute: bool,
    pub output_queues_on_host: bool,
    pub op_to_grid_shape: HashMap<String, GridShape>,
    pub input_queue_to_grid_shape: HashMap<String, GridShape>,
    pub op_to_epoch_type: HashMap<String, NodeEpochType>,
    pub op_to_grad_op: HashMap<String, bool>,
    pub op_to_recompute_op: HashMap<String, bool>,
    pub ops_tagged_for_chip_id_break: HashSet<String>,
    pub ops_tagged_for_epoch_break: HashSet<String>,
    pub ops_tagged_for_temporal_epoch_break: HashSet<String>,
    pub output_ops: HashSet<String>,
    pub op_to_chip_id_assignment: HashMap<String, u32>,
    pub op_to_overrides: HashMap<String, PlacerOverride>,
    pub enable_auto_transposing_placement: bool,
}
