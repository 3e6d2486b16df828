use balancer_grid::{TileGridEncoder, TopologicalScheduler};
use balancer_policy::{PolicyOutcome, RibbonPolicy, buffer_graph};

use super::{LoadedWorkload, load_config, load_workload};

pub fn ribbon(workload: &str, config: Option<&str>, format: &str) -> anyhow::Result<String> {
    let config = load_config(config)?;
    let LoadedWorkload {
        graph,
        mut solver,
        insertions,
    } = load_workload(workload)?;
    buffer_graph(&graph, &insertions, &mut solver)?;

    let outcome = RibbonPolicy::new(&graph, &config).run(
        &mut solver,
        &TopologicalScheduler,
        &TileGridEncoder::from_graph(&graph),
    )?;

    match format {
        "json" => Ok(format!("{}\n", serde_json::to_string_pretty(&outcome)?)),
        _ => Ok(format_windows(&outcome)),
    }
}

fn format_windows(outcome: &PolicyOutcome) -> String {
    let mut out = String::new();
    for window in &outcome.ribbons {
        out.push_str(&format!(
            "Ops {}..{}: ribbon {}\n",
            window.start, window.end, window.ribbon_size
        ));
        for name in &outcome.schedule[window.start..window.end] {
            if let Some(model) = outcome.selected.get(name) {
                out.push_str(&format!("  {name}: model {} grid {}\n", model.id.0, model.grid_shape));
            }
        }
    }
    out.push_str(&format!("{} interactive epochs\n", outcome.interactive_epochs));
    out
}
