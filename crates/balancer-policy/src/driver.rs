//! Placement driver and validator.
//!
//! Turns the selected op models into a [`PlacerConfig`], runs the batch
//! placer over a fresh schedule, checks that every scheduled op landed and
//! aggregates per-epoch costs.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;
use tracing::{debug, error, info, trace};

use balancer_core::{
    Arch, BalancerConfig, BalancerError, BalancerResult, BatchPlacer, GraphSolver, Graph, GridShape, NodeEpochType,
    NodeId, NodeKind, OpModel, PlacerConfig, PlacerSolution, Scheduler, SchedulerConfig,
};
use balancer_placement::CostModel;

use crate::coordinator::policy_run_scheduler;
use crate::error::{PolicyError, PolicyResult};
use crate::report::dump_balancer_placer_data;

/// Selected op model per node name.
pub type OpModelMap = BTreeMap<String, OpModel>;

/// Estimated cost of one epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EpochCost {
    pub setup_cycles: u32,
    pub runtime_cycles: u32,
}

impl EpochCost {
    pub fn total(&self) -> u64 {
        u64::from(self.setup_cycles) + u64::from(self.runtime_cycles)
    }
}

pub fn to_op_model_map(graph: &Graph, selected: &[(NodeId, &OpModel)]) -> OpModelMap {
    selected
        .iter()
        .map(|(node, model)| (graph.node(*node).name.clone(), (*model).clone()))
        .collect()
}

/// Schedule, configure and run the batch placer for the selected models.
///
/// Input nodes contribute queue grid shapes; every other non-op node is ignored.
/// The solution is validated before it is returned, and dumped when
/// `config.placer_data.enabled` is set.
pub fn run_placer(
    graph: &Graph,
    config: &BalancerConfig,
    selected_op_models: &OpModelMap,
    scheduler: &impl Scheduler,
    placer: &impl BatchPlacer,
) -> PolicyResult<PlacerSolution> {
    let mut op_to_grid_shape: HashMap<String, GridShape> = HashMap::new();
    let mut input_queue_to_grid_shape: HashMap<String, GridShape> = HashMap::new();
    for (name, model) in selected_op_models {
        let node = graph.node_by_name(name)?;
        match node.kind {
            NodeKind::Input => {
                input_queue_to_grid_shape.insert(name.clone(), model.grid_shape);
            }
            NodeKind::Op(_) => {
                op_to_grid_shape.insert(name.clone(), model.grid_shape);
            }
            _ => {}
        }
    }

    let mut epoch_breaks = config.op_names_to_epoch_break.clone();
    let mut chip_breaks = config.op_names_to_chip_break.clone();
    let outcome = policy_run_scheduler(
        graph,
        scheduler,
        &SchedulerConfig::default(),
        &HashSet::new(),
        &[],
        &mut epoch_breaks,
        &mut chip_breaks,
    )?;
    let schedule = outcome.schedule;

    let mut placer_config = PlacerConfig {
        chip_ids: config.chip_ids.clone(),
        device_grid: GridShape::new(config.device.grid_rows, config.device.grid_cols),
        contains_recompute: graph.contains_recompute_nodes(),
        output_queues_on_host: config.output_queues_on_host,
        op_to_grid_shape,
        input_queue_to_grid_shape,
        ops_tagged_for_chip_id_break: outcome.chip_break_ops,
        ops_tagged_for_epoch_break: outcome.epoch_break_ops,
        output_ops: graph
            .output_ops()
            .into_iter()
            .map(|id| graph.node(id).name.clone())
            .collect(),
        op_to_chip_id_assignment: config.op_to_chip_id_assignment.clone(),
        op_to_overrides: config.placer_overrides.clone(),
        enable_auto_transposing_placement: config.enable_auto_transposing_placement,
        ..PlacerConfig::default()
    };
    for name in &schedule {
        let node = graph.node_by_name(name)?;
        let attrs = node.op();
        placer_config.op_to_epoch_type.insert(name.clone(), node.epoch_type);
        placer_config
            .op_to_grad_op
            .insert(name.clone(), attrs.is_some_and(|a| a.gradient_op));
        placer_config
            .op_to_recompute_op
            .insert(name.clone(), attrs.is_some_and(|a| a.recompute));
        if config.placer_overrides.get(name).is_some_and(|o| o.temporal_epoch_break) {
            placer_config.ops_tagged_for_temporal_epoch_break.insert(name.clone());
        }
    }

    let solution = placer.place(&placer_config, &schedule)?;
    validate_solution(&schedule, &solution)?;

    if config.placer_data.enabled {
        let cost = CostModel::new(graph, config);
        let path = dump_balancer_placer_data(graph, config, &solution, selected_op_models, &cost)?;
        info!(path = %path.display(), "wrote placer data");
    }

    Ok(solution)
}

/// Fail with every scheduled op that is missing from `solution`.
pub fn validate_solution(scheduled_ops: &[String], solution: &PlacerSolution) -> PolicyResult<()> {
    let missing: Vec<String> = scheduled_ops
        .iter()
        .filter(|name| !solution.name_to_op_placement.contains_key(*name))
        .cloned()
        .collect();
    if missing.is_empty() {
        return Ok(());
    }

    error!(count = missing.len(), "some ops haven't been placed");
    for name in &missing {
        error!(op = %name, "  - not placed");
    }
    Err(PolicyError::IncompletePlacement { missing })
}

/// Runtime cost of each epoch: the largest estimate among its ops.
///
/// Estimates are taken with the epoch's nodes as context, so outputs that
/// leave the epoch are costed through DRAM.
pub fn calculate_epoch_costs(
    solution: &PlacerSolution,
    selected_op_models: &OpModelMap,
    cost: &CostModel<'_>,
) -> PolicyResult<Vec<EpochCost>> {
    let graph = cost.graph();
    let mut epoch_ops: Vec<HashSet<NodeId>> = vec![HashSet::new(); solution.num_epochs as usize];
    for (name, placement) in &solution.name_to_op_placement {
        let ops = epoch_ops.get_mut(placement.epoch_id as usize).ok_or_else(|| {
            BalancerError::precondition(format!(
                "{name} placed in epoch {} but the solution has {} epochs",
                placement.epoch_id, solution.num_epochs
            ))
        })?;
        ops.insert(graph.id_of(name)?);
    }
    let epoch_nodes = epoch_ops
        .iter()
        .map(|ops| calculate_current_epoch_nodes(graph, ops))
        .collect::<BalancerResult<Vec<_>>>()?;

    let mut epoch_costs = vec![EpochCost::default(); solution.num_epochs as usize];
    for (name, placement) in &solution.name_to_op_placement {
        let model = selected_op_models
            .get(name)
            .ok_or_else(|| BalancerError::precondition(format!("no op model selected for placed op {name}")))?;
        let epoch = placement.epoch_id as usize;
        let cycles = cost.limiter_cycles_in_epoch(model, &epoch_nodes[epoch]);
        let runtime = &mut epoch_costs[epoch].runtime_cycles;
        *runtime = (*runtime).max(cycles);
    }
    debug!(epochs = epoch_costs.len(), "epoch costs");
    Ok(epoch_costs)
}

/// Temporal epoch counts as `[forward, backward, optimizer]`, with trailing zeros dropped.
pub fn num_epochs_per_epoch_type(solution: &PlacerSolution) -> Vec<u32> {
    let mut counts: Vec<u32> = NodeEpochType::ALL
        .iter()
        .map(|epoch_type| solution.num_temporal_epochs(*epoch_type))
        .collect();
    while counts.last() == Some(&0) {
        counts.pop();
    }
    counts
}

/// Epoch ops plus the buffering queues between them.
///
/// A queue feeding an epoch op from another op of the same epoch must be a
/// buffering queue.
pub fn calculate_current_epoch_nodes(
    graph: &Graph,
    current_epoch_ops: &HashSet<NodeId>,
) -> BalancerResult<HashSet<NodeId>> {
    let mut nodes = current_epoch_ops.clone();
    for op in current_epoch_ops {
        for operand in graph.data_operands(*op) {
            let node = graph.node(operand);
            if !node.is_queue() {
                continue;
            }
            let fed_from_epoch = graph
                .data_operands(operand)
                .first()
                .is_some_and(|source| current_epoch_ops.contains(source));
            if !fed_from_epoch {
                continue;
            }
            if !node.is_buffering_queue() {
                return Err(BalancerError::precondition(format!(
                    "queue {} inside epoch of {} is not a buffering queue",
                    node.name,
                    graph.node(*op).name
                )));
            }
            nodes.insert(operand);
        }
    }
    Ok(nodes)
}

/// Bind `model` to `op` and log the choice.
pub fn set_op_model_for_node(
    solver: &mut impl GraphSolver,
    graph: &Graph,
    op: NodeId,
    model: &OpModel,
    arch: Arch,
) -> BalancerResult<()> {
    solver.set(op, model)?;
    debug!(
        op = %graph.node(op).name,
        grid = %model.grid_shape,
        t_stream = %model.t_stream_factor,
        ublock = ?model.block_shape().ublock,
        cycles = model.execution_cycles(arch),
        "selected grid"
    );
    Ok(())
}

/// Bind `model` to `op` while sizing ribbons.
pub fn set_op_model_for_node_ribbon(
    solver: &mut impl GraphSolver,
    graph: &Graph,
    op: NodeId,
    model: &OpModel,
    ribbon_size: u32,
) -> BalancerResult<()> {
    trace!(
        op = %graph.node(op).name,
        rows = model.grid_shape.r,
        cols = model.grid_shape.c,
        t_stream = %model.t_stream_factor,
        ribbon_size,
        "selected grid"
    );
    solver.set(op, model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use balancer_core::{
        BlockShape, Coord, CoordRange, LegalityTracker, OpAttrs, OpModelId, OpPlacement, PlacerOverride, Shape,
    };
    use balancer_grid::{LeftToRightPlacer, TopologicalScheduler};

    fn make_model(id: u64, op: NodeId, r: u32, c: u32, cycles: u32) -> OpModel {
        OpModel::new(OpModelId(id), op, GridShape::new(r, c), BlockShape::default()).with_cycles(Arch::Wormhole, cycles)
    }

    /// in -> a -> b -> c -> out
    fn make_chain() -> Graph {
        let mut g = Graph::new("chain");
        let input = g.add_input("in", Shape::tiles(1, 1)).unwrap();
        let a = g.add_op("a", OpAttrs::new("add"), Shape::tiles(1, 1)).unwrap();
        let b = g.add_op("b", OpAttrs::new("gelu"), Shape::tiles(1, 1)).unwrap();
        let c = g.add_op("c", OpAttrs::new("add"), Shape::tiles(1, 1)).unwrap();
        let out = g.add_output("out", Shape::tiles(1, 1)).unwrap();
        g.connect(input, 0, a, 0);
        g.connect(a, 0, b, 0);
        g.connect(b, 0, c, 0);
        g.connect(c, 0, out, 0);
        g
    }

    fn make_selection(g: &Graph, shapes: &[(&str, u32, u32, u32)]) -> OpModelMap {
        shapes
            .iter()
            .enumerate()
            .map(|(i, (name, r, c, cycles))| {
                let op = g.find(name).unwrap();
                (name.to_string(), make_model(i as u64, op, *r, *c, *cycles))
            })
            .collect()
    }

    fn make_config(rows: u32, cols: u32) -> BalancerConfig {
        let mut config = BalancerConfig::default();
        config.device.grid_rows = rows;
        config.device.grid_cols = cols;
        config
    }

    fn placement(name: &str, epoch_id: u32) -> OpPlacement {
        OpPlacement {
            name: name.to_string(),
            chip_id: 0,
            epoch_id,
            placed_cores: CoordRange::new(Coord::new(0, 0), GridShape::new(1, 1)),
            transposed: false,
        }
    }

    #[test]
    fn run_placer_places_every_scheduled_op() {
        let g = make_chain();
        let selected = make_selection(&g, &[("a", 2, 2, 100), ("b", 2, 2, 100), ("c", 2, 2, 100)]);
        let solution = run_placer(&g, &make_config(2, 4), &selected, &TopologicalScheduler, &LeftToRightPlacer).unwrap();
        assert_eq!(solution.name_to_op_placement.len(), 3);
        assert_eq!(solution.num_epochs, 2);
        assert_eq!(solution.name_to_op_placement["c"].epoch_id, 1);
    }

    #[test]
    fn run_placer_honors_break_groups_and_overrides() {
        let g = make_chain();
        let selected = make_selection(&g, &[("a", 1, 1, 100), ("b", 1, 1, 100), ("c", 1, 1, 100)]);
        let mut config = make_config(4, 4);
        config.op_names_to_epoch_break = vec![vec!["c".to_string(), "b".to_string()]];
        config.placer_overrides.insert(
            "c".to_string(),
            PlacerOverride {
                temporal_epoch_break: true,
                ..PlacerOverride::default()
            },
        );
        let solution = run_placer(&g, &config, &selected, &TopologicalScheduler, &LeftToRightPlacer).unwrap();
        assert_eq!(solution.name_to_op_placement["a"].epoch_id, 0);
        assert_eq!(solution.name_to_op_placement["b"].epoch_id, 1);
        assert_eq!(solution.name_to_op_placement["c"].epoch_id, 2);
    }

    #[test]
    fn run_placer_fails_on_unselected_op() {
        let g = make_chain();
        let selected = make_selection(&g, &[("a", 1, 1, 100), ("c", 1, 1, 100)]);
        let err = run_placer(&g, &make_config(4, 4), &selected, &TopologicalScheduler, &LeftToRightPlacer).unwrap_err();
        match err {
            PolicyError::IncompletePlacement { missing } => assert_eq!(missing, vec!["b".to_string()]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn validator_lists_exactly_the_missing_ops() {
        let mut solution = PlacerSolution {
            num_epochs: 1,
            ..PlacerSolution::default()
        };
        solution.name_to_op_placement.insert("b".to_string(), placement("b", 0));
        let schedule: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();

        let err = validate_solution(&schedule, &solution).unwrap_err();
        assert!(matches!(
            &err,
            PolicyError::IncompletePlacement { missing } if *missing == vec!["a".to_string(), "c".to_string()]
        ));
        assert!(err.to_string().contains("a, c"));

        assert!(validate_solution(&schedule[1..2], &solution).is_ok());
    }

    #[test]
    fn epoch_cost_is_the_slowest_op() {
        let g = make_chain();
        let selected = make_selection(&g, &[("a", 1, 1, 100), ("b", 1, 1, 700), ("c", 1, 1, 300)]);
        let mut config = make_config(4, 4);
        config.legacy_cycles_calc = true;
        let mut solution = PlacerSolution {
            num_epochs: 2,
            ..PlacerSolution::default()
        };
        for (name, epoch) in [("a", 0), ("b", 0), ("c", 1)] {
            solution.name_to_op_placement.insert(name.to_string(), placement(name, epoch));
        }

        let costs = calculate_epoch_costs(&solution, &selected, &CostModel::new(&g, &config)).unwrap();
        assert_eq!(costs.len(), 2);
        assert_eq!(costs[0].runtime_cycles, 700);
        assert_eq!(costs[1].runtime_cycles, 300);
        assert_eq!(costs.iter().map(EpochCost::total).sum::<u64>(), 1000);
    }

    #[test]
    fn epoch_cost_needs_a_model_for_every_placed_op() {
        let g = make_chain();
        let selected = make_selection(&g, &[("a", 1, 1, 100)]);
        let config = make_config(4, 4);
        let mut solution = PlacerSolution {
            num_epochs: 1,
            ..PlacerSolution::default()
        };
        solution.name_to_op_placement.insert("b".to_string(), placement("b", 0));
        assert!(calculate_epoch_costs(&solution, &selected, &CostModel::new(&g, &config)).is_err());
    }

    #[test]
    fn epoch_counts_drop_trailing_types() {
        let mut solution = PlacerSolution::default();
        solution.epoch_id_to_epoch_type.insert(0, NodeEpochType::Forward);
        solution.epoch_id_to_temporal_epoch.insert(0, 0);
        assert_eq!(num_epochs_per_epoch_type(&solution), vec![1]);

        solution.epoch_id_to_epoch_type.insert(1, NodeEpochType::Optimizer);
        solution.epoch_id_to_temporal_epoch.insert(1, 1);
        assert_eq!(num_epochs_per_epoch_type(&solution), vec![1, 0, 1]);

        assert!(num_epochs_per_epoch_type(&PlacerSolution::default()).is_empty());
    }

    #[test]
    fn epoch_nodes_include_buffering_queues_between_epoch_ops() {
        let mut g = Graph::new("queues");
        let a = g.add_op("a", OpAttrs::new("add"), Shape::tiles(1, 1)).unwrap();
        let q = g.add_queue("q", true, Shape::tiles(1, 1)).unwrap();
        let b = g.add_op("b", OpAttrs::new("add"), Shape::tiles(1, 1)).unwrap();
        g.connect(a, 0, q, 0);
        g.connect(q, 0, b, 0);

        let ops: HashSet<NodeId> = [a, b].into_iter().collect();
        let nodes = calculate_current_epoch_nodes(&g, &ops).unwrap();
        assert_eq!(nodes, HashSet::from([a, q, b]));

        let only_b: HashSet<NodeId> = [b].into_iter().collect();
        assert_eq!(calculate_current_epoch_nodes(&g, &only_b).unwrap(), only_b);
    }

    #[test]
    fn non_buffering_queue_inside_epoch_is_fatal() {
        let mut g = Graph::new("queues");
        let a = g.add_op("a", OpAttrs::new("add"), Shape::tiles(1, 1)).unwrap();
        let q = g.add_queue("q", false, Shape::tiles(1, 1)).unwrap();
        let b = g.add_op("b", OpAttrs::new("add"), Shape::tiles(1, 1)).unwrap();
        g.connect(a, 0, q, 0);
        g.connect(q, 0, b, 0);

        let ops: HashSet<NodeId> = [a, b].into_iter().collect();
        assert!(matches!(
            calculate_current_epoch_nodes(&g, &ops),
            Err(BalancerError::Precondition(_))
        ));
    }

    #[test]
    fn binding_helpers_set_the_model() {
        let g = make_chain();
        let a = g.find("a").unwrap();
        let b = g.find("b").unwrap();
        let models_a = vec![make_model(1, a, 1, 1, 10), make_model(2, a, 2, 1, 10)];
        let models_b = vec![make_model(3, b, 1, 1, 10)];
        let mut solver = LegalityTracker::new(HashMap::from([(a, models_a.clone()), (b, models_b.clone())])).unwrap();

        set_op_model_for_node(&mut solver, &g, a, &models_a[1], Arch::Wormhole).unwrap();
        set_op_model_for_node_ribbon(&mut solver, &g, b, &models_b[0], 1).unwrap();
        assert_eq!(solver.selected(a).map(|m| m.id), Some(OpModelId(2)));

        let selected = solver.selected_op_models();
        let map = to_op_model_map(&g, &selected);
        assert_eq!(map.len(), 2);
        assert_eq!(map["a"].id, OpModelId(2));
        assert_eq!(map["b"].id, OpModelId(3));
    }
}
