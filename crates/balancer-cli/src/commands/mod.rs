pub mod config;
pub mod place;
pub mod ribbon;

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use balancer_core::{BalancerConfig, Graph, GraphSpec, LegalityTracker, OpModel};
use balancer_policy::InsertionInstruction;

/// Everything a balancing run consumes besides the config.
#[derive(Debug, Deserialize)]
pub struct Workload {
    pub graph: GraphSpec,
    /// Legal op models per op name.
    pub candidates: HashMap<String, Vec<OpModel>>,
    #[serde(default)]
    pub insertions: Vec<InsertionInstruction>,
}

/// A parsed workload with its graph built and candidates bound.
pub struct LoadedWorkload {
    pub graph: Graph,
    pub solver: LegalityTracker,
    pub insertions: Vec<InsertionInstruction>,
}

pub fn load_workload(path: &str) -> anyhow::Result<LoadedWorkload> {
    let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read workload {path}"))?;
    let workload: Workload =
        serde_json::from_str(&content).with_context(|| format!("Failed to parse workload {path}"))?;
    let graph = Graph::from_spec(&workload.graph)?;
    let solver = LegalityTracker::from_named(&graph, workload.candidates)?;
    Ok(LoadedWorkload {
        graph,
        solver,
        insertions: workload.insertions,
    })
}

pub fn load_config(path: Option<&str>) -> anyhow::Result<BalancerConfig> {
    match path {
        Some(path) => BalancerConfig::from_file(Path::new(path)).with_context(|| format!("Failed to load config {path}")),
        None => Ok(BalancerConfig::default()),
    }
}
