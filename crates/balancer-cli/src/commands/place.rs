use std::collections::BTreeMap;

use serde::Serialize;
use tracing::info;

use balancer_core::OpPlacement;
use balancer_grid::{TileGridEncoder, TopologicalScheduler};
use balancer_policy::{BalanceResult, EpochCost, balance, buffer_graph, format_epoch_costs, num_epochs_per_epoch_type};

use super::{LoadedWorkload, load_config, load_workload};

#[derive(Serialize)]
struct PlaceSummary<'a> {
    graph: &'a str,
    schedule: &'a [String],
    placements: &'a BTreeMap<String, OpPlacement>,
    epochs_per_type: Vec<u32>,
    epoch_costs: &'a [EpochCost],
    total_cycles: u64,
}

pub fn place(workload: &str, config: Option<&str>, format: &str) -> anyhow::Result<String> {
    let config = load_config(config)?;
    let LoadedWorkload {
        graph,
        mut solver,
        insertions,
    } = load_workload(workload)?;

    if buffer_graph(&graph, &insertions, &mut solver)? {
        info!(instructions = insertions.len(), "applied buffering");
    }
    let encoder = TileGridEncoder::from_graph(&graph);
    let result = balance(&graph, &config, &mut solver, &TopologicalScheduler, &encoder)?;

    match format {
        "json" => {
            let summary = PlaceSummary {
                graph: graph.name(),
                schedule: &result.policy.schedule,
                placements: &result.solution.name_to_op_placement,
                epochs_per_type: num_epochs_per_epoch_type(&result.solution),
                epoch_costs: &result.epoch_costs,
                total_cycles: result.total_cycles(),
            };
            Ok(format!("{}\n", serde_json::to_string_pretty(&summary)?))
        }
        _ => Ok(format_placement(graph.name(), &result)),
    }
}

fn format_placement(graph_name: &str, result: &BalanceResult) -> String {
    let solution = &result.solution;
    let mut out = String::new();
    out.push_str(&format!(
        "Balanced {graph_name}: {} ops in {} epochs\n\n",
        solution.name_to_op_placement.len(),
        solution.num_epochs
    ));

    for name in &result.policy.schedule {
        let Some(placement) = solution.name_to_op_placement.get(name) else {
            continue;
        };
        let cores = placement.placed_cores;
        out.push_str(&format!(
            "  {name:<24} epoch {:<3} chip {:<2} grid {}x{} at ({}, {}){}\n",
            placement.epoch_id,
            placement.chip_id,
            cores.size_r(),
            cores.size_c(),
            cores.start.row,
            cores.start.col,
            if placement.transposed { " transposed" } else { "" }
        ));
    }

    out.push_str(&format!(
        "\nEpochs per type: {:?}\n",
        num_epochs_per_epoch_type(solution)
    ));
    out.push_str(&format_epoch_costs(&result.epoch_costs));
    out
}
