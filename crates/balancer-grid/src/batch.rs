//! Batch placement of a full schedule.
//!
//! Walks the schedule in order and packs each op with [`GridPlacer`],
//! opening a new epoch when the current one is full, when the epoch type
//! changes, or when the op is tagged for an epoch break. Chip-break tags
//! and explicit chip assignments move to another chip.

use tracing::{debug, info, warn};

use balancer_core::{
    BalancerError, BalancerResult, BatchPlacer, Coord, CoordRange, GridShape, InteractivePlacer, NodeEpochType,
    PlacerConfig, PlacerSolution,
};

use crate::interactive::GridPlacer;

/// Left-to-right batch placer.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeftToRightPlacer;

impl BatchPlacer for LeftToRightPlacer {
    fn place(&self, config: &PlacerConfig, schedule: &[String]) -> BalancerResult<PlacerSolution> {
        let mut placer = GridPlacer::new(config.device_grid, config.chip_ids.clone());

        for name in schedule {
            let Some(grid_shape) = config.op_to_grid_shape.get(name).copied() else {
                warn!(op = %name, "no grid shape for scheduled op, skipping");
                continue;
            };
            let epoch_type = config
                .op_to_epoch_type
                .get(name)
                .copied()
                .unwrap_or(NodeEpochType::Forward);
            let overrides = config.op_to_overrides.get(name);

            if !placer.current_epoch_empty() {
                if let Some(chip_id) = config.op_to_chip_id_assignment.get(name) {
                    if *chip_id != placer.current_chip_id() && placer.switch_chip(*chip_id, epoch_type).is_none() {
                        return Err(BalancerError::Config(format!(
                            "{name} assigned to chip {chip_id}, which is not in chip_ids"
                        )));
                    }
                } else if config.ops_tagged_for_chip_id_break.contains(name) {
                    placer.next_chip(epoch_type);
                }
                let temporal_break = overrides.is_some_and(|o| o.temporal_epoch_break);
                if epoch_type != placer.current_epoch_type()
                    || config.ops_tagged_for_epoch_break.contains(name)
                    || config.ops_tagged_for_temporal_epoch_break.contains(name)
                    || temporal_break
                {
                    placer.next_epoch(epoch_type);
                }
            } else {
                if let Some(chip_id) = config.op_to_chip_id_assignment.get(name) {
                    placer.switch_chip(*chip_id, epoch_type);
                }
                placer.next_epoch(epoch_type);
            }

            let shape = if overrides.is_some_and(|o| o.transpose) {
                grid_shape.transposed()
            } else {
                grid_shape
            };

            let mut placed = try_place(&mut placer, name, shape, config, overrides.and_then(|o| o.start));
            if placed.is_none() && !placer.current_epoch_empty() {
                placer.next_epoch(epoch_type);
                placed = try_place(&mut placer, name, shape, config, overrides.and_then(|o| o.start));
            }
            let Some(range) = placed else {
                return Err(BalancerError::precondition(format!(
                    "{name} with grid {shape} does not fit device grid {}",
                    config.device_grid
                )));
            };
            debug!(
                op = %name,
                epoch = placer.current_epoch_id(),
                chip = placer.current_chip_id(),
                row = range.start.row,
                col = range.start.col,
                "placed"
            );
        }

        let solution = placer.solution();
        info!(ops = solution.name_to_op_placement.len(), epochs = solution.num_epochs, "placement complete");
        Ok(solution)
    }
}

fn try_place(
    placer: &mut GridPlacer,
    name: &str,
    shape: GridShape,
    config: &PlacerConfig,
    start: Option<Coord>,
) -> Option<CoordRange> {
    match start {
        Some(start) => placer.place_op_at(name, shape, start),
        None => placer.place_op(name, shape, config.enable_auto_transposing_placement),
    }
}
