//! Human-readable placement report.
//!
//! Ops are renumbered 0..N in node id order ("visual ids") so the core
//! grids stay narrow.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use balancer_core::{BalancerConfig, BalancerError, Graph, NodeId, PlacerSolution};
use balancer_placement::CostModel;

use crate::driver::{EpochCost, OpModelMap, calculate_epoch_costs};
use crate::error::PolicyResult;

const TABLE_HEADER: [&str; 12] = [
    "Visual id",
    "Op id",
    "Op name",
    "Op type",
    "Grid (RxC)",
    "Cores",
    "Cycles",
    "mblock (t)",
    "ublock",
    "Data fmt",
    "Math fdlty",
    "L1 mem (kb)",
];

/// Epoch cost listing with a total line.
pub fn format_epoch_costs(epoch_costs: &[EpochCost]) -> String {
    let mut out = String::new();
    out.push_str("Epoch costs:\n");
    for (epoch, cost) in epoch_costs.iter().enumerate() {
        out.push_str(&format!("  {epoch}: {} cycles\n", cost.total()));
    }
    let total: u64 = epoch_costs.iter().map(EpochCost::total).sum();
    out.push_str(&format!("  Total: {total} cycles\n"));
    out
}

/// Core grids per temporal epoch and chip, the op table and the epoch costs.
pub fn render_placer_data(
    graph: &Graph,
    config: &BalancerConfig,
    solution: &PlacerSolution,
    selected_op_models: &OpModelMap,
    cost: &CostModel<'_>,
) -> PolicyResult<String> {
    let mut placed: Vec<(NodeId, &str)> = solution
        .name_to_op_placement
        .keys()
        .map(|name| graph.id_of(name).map(|id| (id, name.as_str())))
        .collect::<Result<_, BalancerError>>()?;
    placed.sort();
    let visual_ids: HashMap<&str, usize> = placed
        .iter()
        .enumerate()
        .map(|(visual, (_, name))| (*name, visual))
        .collect();

    let mut out = String::new();
    render_grids(&mut out, config, solution, &visual_ids);

    let arch = config.device.arch;
    let mut rows: Vec<[String; 12]> = Vec::with_capacity(placed.len());
    for (visual, (id, name)) in placed.iter().enumerate() {
        let model = selected_op_models
            .get(*name)
            .ok_or_else(|| BalancerError::precondition(format!("no op model selected for placed op {name}")))?;
        let cores = solution.name_to_op_placement[*name].placed_cores;
        let block = model.block_shape();
        rows.push([
            visual.to_string(),
            id.0.to_string(),
            name.to_string(),
            graph.node(*id).type_name().to_string(),
            format!("{}x{}", cores.size_r(), cores.size_c()),
            cores.volume().to_string(),
            model.execution_cycles(arch).to_string(),
            format!("{}x{} {}", block.mblock_m, block.mblock_n, block.t),
            format!("{}x{}", block.ublock.rt, block.ublock.ct),
            model.data_format.to_string(),
            model.math_fidelity.to_string(),
            format!("{:.2}", model.l1_memory_usage() as f64 / 1024.0),
        ]);
    }
    render_table(&mut out, &rows);
    out.push('\n');

    let epoch_costs = calculate_epoch_costs(solution, selected_op_models, cost)?;
    out.push_str(&format_epoch_costs(&epoch_costs));
    Ok(out)
}

/// Write [`render_placer_data`] to `<dir>/<graph>_<policy>.txt`.
///
/// An unnamed graph is written as `noname`. Returns the written path.
pub fn dump_balancer_placer_data(
    graph: &Graph,
    config: &BalancerConfig,
    solution: &PlacerSolution,
    selected_op_models: &OpModelMap,
    cost: &CostModel<'_>,
) -> PolicyResult<PathBuf> {
    let report = render_placer_data(graph, config, solution, selected_op_models, cost)?;
    let graph_name = if graph.name().is_empty() { "noname" } else { graph.name() };

    std::fs::create_dir_all(&config.placer_data.dir)?;
    let path = config
        .placer_data
        .dir
        .join(format!("{graph_name}_{}.txt", config.policy_name));
    std::fs::write(&path, report)?;
    Ok(path)
}

fn render_grids(
    out: &mut String,
    config: &BalancerConfig,
    solution: &PlacerSolution,
    visual_ids: &HashMap<&str, usize>,
) {
    let width = visual_ids.len().saturating_sub(1).to_string().len();
    let rows = config.device.grid_rows as usize;
    let cols = config.device.grid_cols as usize;

    // (temporal epoch, chip) -> epochs drawn into that grid
    let mut grids: BTreeMap<(u32, u32), Vec<u32>> = BTreeMap::new();
    for (epoch, chip) in &solution.epoch_id_to_chip {
        let temporal = solution.epoch_id_to_temporal_epoch.get(epoch).copied().unwrap_or(*epoch);
        grids.entry((temporal, *chip)).or_default().push(*epoch);
    }

    for ((temporal, chip), epochs) in &grids {
        let epoch_type = epochs
            .first()
            .and_then(|e| solution.epoch_id_to_epoch_type.get(e))
            .map(|t| format!("{t:?}").to_lowercase())
            .unwrap_or_default();
        out.push_str(&format!("Temporal epoch {temporal} ({epoch_type}), chip {chip}:\n"));

        let mut cells: Vec<Vec<Option<usize>>> = vec![vec![None; cols]; rows];
        for placement in solution.name_to_op_placement.values() {
            if !epochs.contains(&placement.epoch_id) {
                continue;
            }
            let visual = visual_ids.get(placement.name.as_str()).copied();
            let range = placement.placed_cores;
            for row in range.start.row..range.end.row {
                for col in range.start.col..range.end.col {
                    if let Some(cell) = cells.get_mut(row as usize).and_then(|r| r.get_mut(col as usize)) {
                        *cell = visual;
                    }
                }
            }
        }

        for row in &cells {
            out.push_str("  ");
            let line: Vec<String> = row
                .iter()
                .map(|cell| match cell {
                    Some(visual) => format!("{visual:>width$}"),
                    None => format!("{:>width$}", "."),
                })
                .collect();
            out.push_str(&line.join(" "));
            out.push('\n');
        }
        out.push('\n');
    }
}

fn render_table(out: &mut String, rows: &[[String; 12]]) {
    let mut widths = TABLE_HEADER.map(str::len);
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let separator: String = widths
        .iter()
        .map(|w| "-".repeat(w + 2))
        .collect::<Vec<_>>()
        .join("+");
    out.push_str(&format!("+{separator}+\n"));
    push_row(out, TABLE_HEADER.iter().copied(), &widths);
    out.push_str(&format!("+{separator}+\n"));
    for row in rows {
        push_row(out, row.iter().map(String::as_str), &widths);
    }
    out.push_str(&format!("+{separator}+\n"));
}

fn push_row<'a>(out: &mut String, cells: impl Iterator<Item = &'a str>, widths: &[usize]) {
    out.push('|');
    for (cell, width) in cells.zip(widths.iter().copied()) {
        out.push_str(&format!(" {cell:<width$} |"));
    }
    out.push('\n');
}
