//! Rewindable first-fit grid packer.
//!
//! Fills one epoch at a time, scanning columns left to right and rows top
//! to bottom for the first free rectangle. The open epoch can be rewound,
//! which is how callers test whether ops could share an epoch without
//! committing to it.

use std::collections::{BTreeMap, HashSet};

use tracing::{debug, trace};

use balancer_core::{
    Coord, CoordRange, GridShape, InteractivePlacer, NodeEpochType, OpPlacement, PlacerSolution,
};

/// Per-epoch bookkeeping of a sealed epoch.
#[derive(Debug, Clone, Copy)]
struct SealedEpoch {
    chip_id: u32,
    epoch_type: NodeEpochType,
    temporal_epoch: u32,
}

#[derive(Debug, Clone)]
pub struct GridPlacer {
    device_grid: GridShape,
    chip_ids: Vec<u32>,
    chip_index: usize,
    epoch_id: u32,
    temporal_epoch: u32,
    epoch_type: NodeEpochType,
    current_epoch_ops: Vec<String>,
    open: Vec<OpPlacement>,
    placed: BTreeMap<String, OpPlacement>,
    sealed: BTreeMap<u32, SealedEpoch>,
    placed_names: HashSet<String>,
}

impl GridPlacer {
    pub fn new(device_grid: GridShape, chip_ids: Vec<u32>) -> Self {
        let chip_ids = if chip_ids.is_empty() { vec![0] } else { chip_ids };
        Self {
            device_grid,
            chip_ids,
            chip_index: 0,
            epoch_id: 0,
            temporal_epoch: 0,
            epoch_type: NodeEpochType::Forward,
            current_epoch_ops: Vec::new(),
            open: Vec::new(),
            placed: BTreeMap::new(),
            sealed: BTreeMap::new(),
            placed_names: HashSet::new(),
        }
    }

    pub fn device_grid(&self) -> GridShape {
        self.device_grid
    }

    pub fn current_epoch_id(&self) -> u32 {
        self.epoch_id
    }

    pub fn current_chip_id(&self) -> u32 {
        self.chip_ids[self.chip_index]
    }

    pub fn current_epoch_type(&self) -> NodeEpochType {
        self.epoch_type
    }

    /// Place `name` with its top-left core pinned at `start`.
    pub fn place_op_at(&mut self, name: &str, shape: GridShape, start: Coord) -> Option<CoordRange> {
        let range = CoordRange::new(start, shape);
        if self.placed_names.contains(name) || !self.is_free(&range) {
            return None;
        }
        self.commit_open(name, range, false);
        Some(range)
    }

    /// Seal the open epoch and continue on the next chip within the same temporal epoch.
    ///
    /// Past the last chip a new temporal epoch starts on the first chip.
    pub fn next_chip(&mut self, epoch_type: NodeEpochType) -> u32 {
        if !self.open.is_empty() {
            self.seal();
            self.epoch_id += 1;
        }
        self.chip_index += 1;
        if self.chip_index == self.chip_ids.len() {
            self.chip_index = 0;
            self.temporal_epoch += 1;
        }
        self.epoch_type = epoch_type;
        debug!(epoch = self.epoch_id, chip = self.current_chip_id(), "opened epoch on next chip");
        self.epoch_id
    }

    /// Seal the open epoch and continue on `chip_id` within the same temporal epoch.
    pub fn switch_chip(&mut self, chip_id: u32, epoch_type: NodeEpochType) -> Option<u32> {
        let index = self.chip_ids.iter().position(|c| *c == chip_id)?;
        if self.open.is_empty() {
            self.chip_index = index;
            self.epoch_type = epoch_type;
            return Some(self.epoch_id);
        }
        self.seal();
        self.epoch_id += 1;
        if index <= self.chip_index {
            self.temporal_epoch += 1;
        }
        self.chip_index = index;
        self.epoch_type = epoch_type;
        Some(self.epoch_id)
    }

    /// Everything placed so far, including the open epoch when it is not empty.
    pub fn solution(&self) -> PlacerSolution {
        let mut solution = PlacerSolution::default();
        for (epoch, sealed) in &self.sealed {
            solution.epoch_id_to_chip.insert(*epoch, sealed.chip_id);
            solution.epoch_id_to_epoch_type.insert(*epoch, sealed.epoch_type);
            solution.epoch_id_to_temporal_epoch.insert(*epoch, sealed.temporal_epoch);
        }
        solution.name_to_op_placement = self.placed.clone();
        if !self.open.is_empty() {
            solution.epoch_id_to_chip.insert(self.epoch_id, self.current_chip_id());
            solution.epoch_id_to_epoch_type.insert(self.epoch_id, self.epoch_type);
            solution.epoch_id_to_temporal_epoch.insert(self.epoch_id, self.temporal_epoch);
            for placement in &self.open {
                solution
                    .name_to_op_placement
                    .insert(placement.name.clone(), placement.clone());
            }
        }
        solution.num_epochs = solution.epoch_id_to_chip.len() as u32;
        solution
    }

    fn is_free(&self, range: &CoordRange) -> bool {
        range.within(self.device_grid) && self.open.iter().all(|p| !p.placed_cores.overlaps(range))
    }

    fn first_fit(&self, shape: GridShape) -> Option<CoordRange> {
        if shape.r == 0 || shape.c == 0 || shape.r > self.device_grid.r || shape.c > self.device_grid.c {
            return None;
        }
        for col in 0..=(self.device_grid.c - shape.c) {
            for row in 0..=(self.device_grid.r - shape.r) {
                let range = CoordRange::new(Coord::new(row, col), shape);
                if self.is_free(&range) {
                    return Some(range);
                }
            }
        }
        None
    }

    fn commit_open(&mut self, name: &str, range: CoordRange, transposed: bool) {
        self.open.push(OpPlacement {
            name: name.to_string(),
            chip_id: self.current_chip_id(),
            epoch_id: self.epoch_id,
            placed_cores: range,
            transposed,
        });
        self.current_epoch_ops.push(name.to_string());
        self.placed_names.insert(name.to_string());
    }

    fn seal(&mut self) {
        self.sealed.insert(
            self.epoch_id,
            SealedEpoch {
                chip_id: self.current_chip_id(),
                epoch_type: self.epoch_type,
                temporal_epoch: self.temporal_epoch,
            },
        );
        for placement in self.open.drain(..) {
            self.placed.insert(placement.name.clone(), placement);
        }
        self.current_epoch_ops.clear();
    }
}

impl InteractivePlacer for GridPlacer {
    fn place_op(&mut self, name: &str, shape: GridShape, enable_transpose: bool) -> Option<CoordRange> {
        if self.placed_names.contains(name) {
            return None;
        }
        if let Some(range) = self.first_fit(shape) {
            self.commit_open(name, range, false);
            trace!(op = name, %shape, row = range.start.row, col = range.start.col, "placed op");
            return Some(range);
        }
        if enable_transpose && shape.r != shape.c {
            if let Some(range) = self.first_fit(shape.transposed()) {
                self.commit_open(name, range, true);
                trace!(op = name, %shape, "placed op transposed");
                return Some(range);
            }
        }
        None
    }

    fn rewind_epoch(&mut self) {
        for placement in self.open.drain(..) {
            self.placed_names.remove(&placement.name);
        }
        self.current_epoch_ops.clear();
    }

    fn next_epoch(&mut self, epoch_type: NodeEpochType) -> u32 {
        // An empty epoch is reused rather than sealed, keeping epoch ids contiguous.
        if self.open.is_empty() {
            self.epoch_type = epoch_type;
            return self.epoch_id;
        }
        self.seal();
        self.epoch_id += 1;
        self.temporal_epoch += 1;
        self.chip_index = 0;
        self.epoch_type = epoch_type;
        debug!(epoch = self.epoch_id, ?epoch_type, "opened epoch");
        self.epoch_id
    }

    fn current_epoch_ops(&self) -> &[String] {
        &self.current_epoch_ops
    }

    fn op_placed(&self, name: &str) -> bool {
        self.placed_names.contains(name)
    }

    fn can_fit_on_single_epoch(&self, rows: u32, cols: u32, enable_transpose: bool) -> bool {
        let grid = self.device_grid;
        (rows <= grid.r && cols <= grid.c) || (enable_transpose && cols <= grid.r && rows <= grid.c)
    }

    fn current_epoch_empty(&self) -> bool {
        self.current_epoch_ops.is_empty()
    }
}
