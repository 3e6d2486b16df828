//! The ribbon balancing pass.
//!
//! Walks the schedule one ribbon window at a time. Each window gets a
//! single row count, every op in it gets the op model the comparator
//! prefers for that row count, and ops are packed into epochs with the
//! interactive placer. A full epoch is sealed, cutting the edges that
//! leave it, and packing continues in a fresh one.

use std::collections::HashSet;

use serde::Serialize;
use tracing::{debug, info, trace};

use balancer_core::{
    BalancerConfig, BalancerError, BalancerResult, GraphSolver, Graph, GridShape, InteractivePlacer,
    Node, NodeEpochType, OpModel, PlacerSolution, Schedule, Scheduler, SchedulerConfig, SparseEncoder,
};
use balancer_grid::GridPlacer;
use balancer_placement::{
    CostModel, OpModelComparator, SparseValidation, SparseValidationCache, can_bind_sparse_dense_matmul_pair,
    can_fit_on_single_epoch, is_output_write_to_dram_over_target, next_ribbon_change_op, pick_ribbon_size,
};

use crate::coordinator::policy_run_scheduler;
use crate::cuts::{cut_graph_solver_epoch, cut_graph_solver_ribbon};
use crate::driver::{EpochCost, OpModelMap, calculate_epoch_costs, set_op_model_for_node_ribbon, validate_solution};
use crate::error::{PolicyError, PolicyResult};
use crate::report::dump_balancer_placer_data;

/// One window of the schedule sharing a row count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RibbonWindow {
    pub start: usize,
    pub end: usize,
    pub ribbon_size: u32,
}

/// What the ribbon pass decided.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyOutcome {
    pub schedule: Schedule,
    pub selected: OpModelMap,
    pub ribbons: Vec<RibbonWindow>,
    /// Epochs the interactive placer needed.
    pub interactive_epochs: u32,
    /// Where the pass placed every op. Cuts line up with these epochs.
    pub placement: PlacerSolution,
}

/// A balanced and placed graph.
#[derive(Debug, Clone, Serialize)]
pub struct BalanceResult {
    pub policy: PolicyOutcome,
    pub solution: PlacerSolution,
    pub epoch_costs: Vec<EpochCost>,
}

impl BalanceResult {
    pub fn total_cycles(&self) -> u64 {
        self.epoch_costs.iter().map(EpochCost::total).sum()
    }
}

/// Mutable state of one pass.
struct PassState {
    placer: GridPlacer,
    sparse_cache: SparseValidationCache,
    selected: OpModelMap,
    epoch_break_ops: HashSet<String>,
    chip_break_ops: HashSet<String>,
}

pub struct RibbonPolicy<'a> {
    graph: &'a Graph,
    config: &'a BalancerConfig,
    comparator: OpModelComparator<'a>,
}

impl<'a> RibbonPolicy<'a> {
    pub fn new(graph: &'a Graph, config: &'a BalancerConfig) -> Self {
        Self {
            graph,
            config,
            comparator: OpModelComparator::new(graph, config),
        }
    }

    fn device_grid(&self) -> GridShape {
        GridShape::new(self.config.device.grid_rows, self.config.device.grid_cols)
    }

    /// Select and bind an op model for every scheduled op.
    pub fn run(
        &self,
        solver: &mut impl GraphSolver,
        scheduler: &impl Scheduler,
        encoder: &impl SparseEncoder,
    ) -> PolicyResult<PolicyOutcome> {
        let mut epoch_breaks = self.config.op_names_to_epoch_break.clone();
        let mut chip_breaks = self.config.op_names_to_chip_break.clone();
        let scheduled = policy_run_scheduler(
            self.graph,
            scheduler,
            &SchedulerConfig::default(),
            &HashSet::new(),
            &[],
            &mut epoch_breaks,
            &mut chip_breaks,
        )?;
        let schedule = scheduled.schedule;

        let device_grid = self.device_grid();
        let mut pass = PassState {
            placer: GridPlacer::new(device_grid, self.config.chip_ids.clone()),
            sparse_cache: SparseValidationCache::new(self.config.force_sparse_buffer_layout),
            selected: OpModelMap::new(),
            epoch_break_ops: scheduled.epoch_break_ops,
            chip_break_ops: scheduled.chip_break_ops,
        };

        let mut ribbons: Vec<RibbonWindow> = Vec::new();
        let mut index = 0;
        while index < schedule.len() {
            let change = next_ribbon_change_op(self.graph, index, &schedule, 0)?;
            // A sparse feeder scheduled before the window cannot move the start back.
            let end = change.index.max(index + 1);
            let ribbon_size = pick_ribbon_size(
                index,
                end,
                self.graph,
                solver,
                &schedule,
                device_grid.r,
                &self.config.ribbon,
            )?;
            debug!(start = index, end, ribbon_size, matmul_dim_r = change.matmul_dim_r, "ribbon window");

            if ribbons.last().is_some_and(|prev| prev.ribbon_size != ribbon_size) {
                let first = self.graph.id_of(&schedule[index])?;
                let cut = cut_graph_solver_ribbon(self.graph, first, &pass.placer, solver);
                debug!(op = %schedule[index], ribbon_size, cut, "ribbon size changed");
            }

            for i in index..end {
                self.balance_op(i, &schedule, ribbon_size, solver, encoder, &mut pass)?;
            }
            ribbons.push(RibbonWindow {
                start: index,
                end,
                ribbon_size,
            });
            index = end;
        }

        let placement = pass.placer.solution();
        let interactive_epochs = placement.num_epochs;
        info!(
            ops = pass.selected.len(),
            windows = ribbons.len(),
            epochs = interactive_epochs,
            "ribbon policy complete"
        );
        Ok(PolicyOutcome {
            schedule,
            selected: pass.selected,
            ribbons,
            interactive_epochs,
            placement,
        })
    }

    fn balance_op(
        &self,
        index: usize,
        schedule: &[String],
        ribbon_size: u32,
        solver: &mut impl GraphSolver,
        encoder: &impl SparseEncoder,
        pass: &mut PassState,
    ) -> PolicyResult<()> {
        let name = &schedule[index];
        if pass.placer.op_placed(name) {
            return Ok(());
        }
        let node = self.graph.node_by_name(name)?;
        let candidates = self.viable_candidates(node, solver, encoder, &mut pass.sparse_cache)?;
        let model = self
            .comparator
            .pick_best(&candidates, ribbon_size, self.config.target_cycles)?
            .clone();

        if node.is_sparse_matmul()
            && let Some(dense_name) = schedule.get(index + 1)
            && self.try_pair(node, &model, dense_name, ribbon_size, solver, encoder, pass)?
        {
            return Ok(());
        }

        self.place(node, model.grid_shape, solver, pass)?;
        set_op_model_for_node_ribbon(solver, self.graph, node.id, &model, ribbon_size)?;
        pass.selected.insert(name.clone(), model);
        Ok(())
    }

    /// Legal candidates of `node`, without unencodable sparse models.
    ///
    /// Models whose output write alone blows the cycle target are dropped
    /// unless that would leave nothing.
    fn viable_candidates(
        &self,
        node: &Node,
        solver: &impl GraphSolver,
        encoder: &impl SparseEncoder,
        sparse_cache: &mut SparseValidationCache,
    ) -> PolicyResult<Vec<OpModel>> {
        let mut candidates = Vec::new();
        for model in solver.candidates(node.id)? {
            if node.is_sparse_matmul()
                && let SparseValidation::Rejected(reason) = sparse_cache.validate(self.graph, model, encoder)?
            {
                trace!(op = %node.name, model = model.id.0, %reason, "skipping sparse model");
                continue;
            }
            candidates.push(model.clone());
        }
        if candidates.is_empty() {
            return Err(BalancerError::EmptyCandidates(node.name.clone()).into());
        }

        let target = self.config.target_cycles;
        let within_target: Vec<OpModel> = candidates
            .iter()
            .filter(|model| !is_output_write_to_dram_over_target(model, &self.config.device, target))
            .cloned()
            .collect();
        if within_target.is_empty() || within_target.len() == candidates.len() {
            return Ok(candidates);
        }
        trace!(
            op = %node.name,
            dropped = candidates.len() - within_target.len(),
            "dropping models with slow output writes"
        );
        Ok(within_target)
    }

    /// Place `sparse` and the dense matmul after it as one unit, if they pair.
    #[allow(clippy::too_many_arguments)]
    fn try_pair(
        &self,
        sparse: &Node,
        sparse_model: &OpModel,
        dense_name: &str,
        ribbon_size: u32,
        solver: &mut impl GraphSolver,
        encoder: &impl SparseEncoder,
        pass: &mut PassState,
    ) -> PolicyResult<bool> {
        let dense = self.graph.node_by_name(dense_name)?;
        if pass.placer.op_placed(dense_name) || !self.graph.should_pair_with_sparse(dense.id, sparse.id) {
            return Ok(false);
        }
        // A break before the dense op wins over pairing.
        if self.breaks_before(dense, pass) || dense.epoch_type != sparse.epoch_type {
            debug!(sparse = %sparse.name, dense = %dense.name, "dense op starts a new epoch, not pairing");
            return Ok(false);
        }

        let same_rows: Vec<OpModel> = self
            .viable_candidates(dense, solver, encoder, &mut pass.sparse_cache)?
            .into_iter()
            .filter(|model| model.grid_shape.r == sparse_model.grid_shape.r)
            .collect();
        if same_rows.is_empty() {
            return Ok(false);
        }
        let dense_model = self
            .comparator
            .pick_best(&same_rows, ribbon_size, self.config.target_cycles)?
            .clone();

        let transpose = self.config.enable_auto_transposing_placement;
        if !can_bind_sparse_dense_matmul_pair(
            self.graph,
            sparse.id,
            sparse_model,
            dense.id,
            &dense_model,
            &pass.placer,
            transpose,
        ) {
            return Ok(false);
        }
        let mut scratch = GridPlacer::new(self.device_grid(), self.config.chip_ids.clone());
        if !can_fit_on_single_epoch(
            &mut scratch,
            (sparse.name.as_str(), sparse_model.grid_shape),
            (dense.name.as_str(), dense_model.grid_shape),
            transpose,
        )? {
            return Ok(false);
        }

        self.apply_breaks(sparse, solver, pass)?;
        let mut attempt = pass.placer.clone();
        let fits_open_epoch = attempt.place_op(&sparse.name, sparse_model.grid_shape, transpose).is_some()
            && attempt.place_op(&dense.name, dense_model.grid_shape, transpose).is_some();
        if fits_open_epoch {
            pass.placer = attempt;
        } else {
            self.close_epoch(sparse.epoch_type, solver, pass)?;
            if pass.placer.place_op(&sparse.name, sparse_model.grid_shape, transpose).is_none()
                || pass.placer.place_op(&dense.name, dense_model.grid_shape, transpose).is_none()
            {
                return Err(PolicyError::Placement(format!(
                    "sparse/dense pair {} and {} does not fit an empty epoch",
                    sparse.name, dense.name
                )));
            }
        }
        debug!(sparse = %sparse.name, dense = %dense.name, rows = sparse_model.grid_shape.r, "placed matmul pair");

        set_op_model_for_node_ribbon(solver, self.graph, sparse.id, sparse_model, ribbon_size)?;
        set_op_model_for_node_ribbon(solver, self.graph, dense.id, &dense_model, ribbon_size)?;
        pass.selected.insert(sparse.name.clone(), sparse_model.clone());
        pass.selected.insert(dense.name.clone(), dense_model);
        Ok(true)
    }

    /// Place one op, sealing the open epoch when it is full.
    fn place(
        &self,
        node: &Node,
        shape: GridShape,
        solver: &mut impl GraphSolver,
        pass: &mut PassState,
    ) -> PolicyResult<()> {
        self.apply_breaks(node, solver, pass)?;
        let transpose = self.config.enable_auto_transposing_placement;
        if pass.placer.place_op(&node.name, shape, transpose).is_some() {
            return Ok(());
        }
        if !pass.placer.current_epoch_empty() {
            self.close_epoch(node.epoch_type, solver, pass)?;
            if pass.placer.place_op(&node.name, shape, transpose).is_some() {
                return Ok(());
            }
        }
        Err(PolicyError::Placement(format!(
            "{} with grid {shape} does not fit an empty epoch",
            node.name
        )))
    }

    /// Whether `node` is tagged for an epoch or chip break, or carries a
    /// temporal break override.
    fn breaks_before(&self, node: &Node, pass: &PassState) -> bool {
        pass.chip_break_ops.contains(&node.name)
            || pass.epoch_break_ops.contains(&node.name)
            || self
                .config
                .placer_overrides
                .get(&node.name)
                .is_some_and(|o| o.temporal_epoch_break)
    }

    /// Start a new epoch or chip before `node` when it is tagged for one,
    /// changes epoch type, or carries a temporal break override.
    fn apply_breaks(&self, node: &Node, solver: &mut impl GraphSolver, pass: &mut PassState) -> BalancerResult<()> {
        if pass.placer.current_epoch_empty() {
            pass.placer.next_epoch(node.epoch_type);
            return Ok(());
        }
        if pass.chip_break_ops.contains(&node.name) {
            let cut = cut_graph_solver_epoch(self.graph, &pass.placer, solver)?;
            let epoch = pass.placer.next_chip(node.epoch_type);
            debug!(op = %node.name, epoch, cut, "chip break");
            return Ok(());
        }
        if node.epoch_type != pass.placer.current_epoch_type() || self.breaks_before(node, pass) {
            self.close_epoch(node.epoch_type, solver, pass)?;
        }
        Ok(())
    }

    fn close_epoch(
        &self,
        epoch_type: NodeEpochType,
        solver: &mut impl GraphSolver,
        pass: &mut PassState,
    ) -> BalancerResult<()> {
        let cut = cut_graph_solver_epoch(self.graph, &pass.placer, solver)?;
        let epoch = pass.placer.next_epoch(epoch_type);
        debug!(epoch, cut, "sealed epoch");
        Ok(())
    }
}

/// Run the ribbon pass and cost the epochs it packed.
///
/// The pass's own placement is the result, so sparse/dense pairs stay in
/// one epoch and every epoch boundary is a cut the pass made. It is
/// validated against the schedule and dumped when `config.placer_data.enabled`
/// is set.
pub fn balance(
    graph: &Graph,
    config: &BalancerConfig,
    solver: &mut impl GraphSolver,
    scheduler: &impl Scheduler,
    encoder: &impl SparseEncoder,
) -> PolicyResult<BalanceResult> {
    let policy = RibbonPolicy::new(graph, config).run(solver, scheduler, encoder)?;
    let solution = policy.placement.clone();
    validate_solution(&policy.schedule, &solution)?;

    let cost = CostModel::new(graph, config);
    let epoch_costs = calculate_epoch_costs(&solution, &policy.selected, &cost)?;
    if config.placer_data.enabled {
        let path = dump_balancer_placer_data(graph, config, &solution, &policy.selected, &cost)?;
        info!(path = %path.display(), "wrote placer data");
    }

    let result = BalanceResult {
        policy,
        solution,
        epoch_costs,
    };
    info!(
        epochs = result.solution.num_epochs,
        total_cycles = result.total_cycles(),
        "balancing complete"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use balancer_core::{
        Arch, BlockShape, BufferModel, CutKind, LegalityTracker, MatmulKind, NodeId, OpAttrs, OpModelId,
        PlacerOverride, Shape, UBlockShape,
    };
    use balancer_grid::{TileGridEncoder, TopologicalScheduler};

    fn make_config(rows: u32, cols: u32) -> BalancerConfig {
        let mut config = BalancerConfig::default();
        config.device.grid_rows = rows;
        config.device.grid_cols = cols;
        config.legacy_cycles_calc = true;
        config
    }

    fn make_model(id: u64, op: NodeId, r: u32, c: u32) -> OpModel {
        OpModel::new(OpModelId(id), op, GridShape::new(r, c), BlockShape::default())
            .with_cycles(Arch::Wormhole, 1000)
    }

    /// in -> a -> b -> c, each elementwise.
    fn make_chain(len: usize) -> (Graph, Vec<NodeId>) {
        let mut g = Graph::new("chain");
        let mut prev = g.add_input("in", Shape::tiles(4, 4)).unwrap();
        let mut ops = Vec::new();
        for i in 0..len {
            let op = g.add_op(&format!("op{i}"), OpAttrs::new("add"), Shape::tiles(4, 4)).unwrap();
            g.connect(prev, 0, op, 0);
            ops.push(op);
            prev = op;
        }
        (g, ops)
    }

    #[test]
    fn full_epochs_are_sealed_and_cut() {
        let (g, ops) = make_chain(3);
        let candidates: HashMap<NodeId, Vec<OpModel>> =
            ops.iter().map(|op| (*op, vec![make_model(op.0 as u64, *op, 2, 2)])).collect();
        let mut solver = LegalityTracker::new(candidates).unwrap();
        let config = make_config(2, 4);

        let outcome = RibbonPolicy::new(&g, &config)
            .run(&mut solver, &TopologicalScheduler, &TileGridEncoder::default())
            .unwrap();
        assert_eq!(outcome.selected.len(), 3);
        assert_eq!(outcome.interactive_epochs, 2);
        // op1 -> op2 crosses the sealed epoch.
        let cut: Vec<_> = solver.cut_edges().iter().collect();
        assert_eq!(cut.len(), 1);
        assert_eq!(cut[0].0.consumer, ops[2]);
        assert_eq!(*cut[0].1, CutKind::Epoch);
    }

    #[test]
    fn picks_models_closest_to_ribbon() {
        let (g, ops) = make_chain(2);
        let candidates: HashMap<NodeId, Vec<OpModel>> = ops
            .iter()
            .map(|op| {
                let base = op.0 as u64 * 10;
                (*op, vec![make_model(base, *op, 4, 1), make_model(base + 1, *op, 1, 1)])
            })
            .collect();
        let mut solver = LegalityTracker::new(candidates).unwrap();
        let config = make_config(4, 4);

        let outcome = RibbonPolicy::new(&g, &config)
            .run(&mut solver, &TopologicalScheduler, &TileGridEncoder::default())
            .unwrap();
        assert_eq!(outcome.ribbons[0].ribbon_size, 1);
        assert!(outcome.selected.values().all(|m| m.grid_shape.r == 1));
        assert!(ops.iter().all(|op| solver.selected(*op).is_some()));
    }

    #[test]
    fn oversized_model_is_a_placement_error() {
        let (g, ops) = make_chain(1);
        let candidates = HashMap::from([(ops[0], vec![make_model(1, ops[0], 3, 3)])]);
        let mut solver = LegalityTracker::new(candidates).unwrap();
        let config = make_config(2, 2);

        let result = RibbonPolicy::new(&g, &config).run(&mut solver, &TopologicalScheduler, &TileGridEncoder::default());
        assert!(matches!(result, Err(PolicyError::Placement(_))));
    }

    /// pick (12x8) and act feed sparse, sparse feeds dense, dense feeds out.
    fn make_sparse_pair() -> (Graph, NodeId, NodeId) {
        let mut g = Graph::new("pair");
        let pick = g.add_input("pick", Shape::tiles(12, 8)).unwrap();
        let act = g.add_input("act", Shape::tiles(8, 4)).unwrap();
        let weights = g.add_input("weights", Shape::tiles(4, 4)).unwrap();
        let sparse = g
            .add_op("sparse", OpAttrs::matmul(MatmulKind::Sparse), Shape::tiles(12, 4))
            .unwrap();
        let mut dense_attrs = OpAttrs::matmul(MatmulKind::Dense);
        dense_attrs.pair_with_sparse = true;
        let dense = g.add_op("dense", dense_attrs, Shape::tiles(12, 4)).unwrap();
        let out = g.add_output("out", Shape::tiles(12, 4)).unwrap();
        g.connect(pick, 0, sparse, 0);
        g.connect(act, 0, sparse, 1);
        g.connect(pick, 0, sparse, 2);
        g.connect(sparse, 0, dense, 0);
        g.connect(weights, 0, dense, 1);
        g.connect(dense, 0, out, 0);
        (g, sparse, dense)
    }

    fn sparse_model(id: u64, op: NodeId, r: u32) -> OpModel {
        let block = BlockShape::new(1, 1, 1, UBlockShape::new(1, 1));
        let weights = BlockShape::new(1, 1, 1, UBlockShape::new(4, 1));
        make_model(id, op, r, 1).with_inputs(vec![
            BufferModel::new(block, 0).prologue(),
            BufferModel::new(weights, 0),
            BufferModel::new(block, 0).prologue(),
        ])
    }

    fn dense_model(id: u64, op: NodeId, r: u32, c: u32) -> OpModel {
        let block = BlockShape::default();
        make_model(id, op, r, c).with_inputs(vec![BufferModel::new(block, 0), BufferModel::new(block, 0).prologue()])
    }

    #[test]
    fn sparse_dense_pair_is_placed_together() {
        let (g, sparse, dense) = make_sparse_pair();
        let candidates = HashMap::from([
            // 12 rows do not split into 5 strips.
            (sparse, vec![sparse_model(1, sparse, 5), sparse_model(2, sparse, 3)]),
            (dense, vec![dense_model(3, dense, 1, 1), dense_model(4, dense, 3, 2)]),
        ]);
        let mut solver = LegalityTracker::new(candidates).unwrap();
        let config = make_config(4, 4);

        let outcome = RibbonPolicy::new(&g, &config)
            .run(&mut solver, &TopologicalScheduler, &TileGridEncoder::from_graph(&g))
            .unwrap();
        assert_eq!(outcome.selected["sparse"].id, OpModelId(2));
        assert_eq!(outcome.selected["dense"].id, OpModelId(4));
        assert_eq!(outcome.interactive_epochs, 1);
    }

    #[test]
    fn break_on_dense_op_is_not_swallowed_by_pairing() {
        for tag_with_override in [false, true] {
            let (g, sparse, dense) = make_sparse_pair();
            let candidates = HashMap::from([
                (sparse, vec![sparse_model(1, sparse, 3)]),
                (dense, vec![dense_model(2, dense, 3, 2)]),
            ]);
            let mut solver = LegalityTracker::new(candidates).unwrap();
            let mut config = make_config(4, 4);
            if tag_with_override {
                config.placer_overrides.insert(
                    "dense".to_string(),
                    PlacerOverride {
                        temporal_epoch_break: true,
                        ..PlacerOverride::default()
                    },
                );
            } else {
                config.op_names_to_epoch_break = vec![vec!["dense".to_string()]];
            }

            let outcome = RibbonPolicy::new(&g, &config)
                .run(&mut solver, &TopologicalScheduler, &TileGridEncoder::from_graph(&g))
                .unwrap();
            let placed = &outcome.placement.name_to_op_placement;
            assert_eq!(outcome.interactive_epochs, 2);
            assert_eq!(placed["sparse"].epoch_id, 0);
            assert_eq!(placed["dense"].epoch_id, 1);
            let boundary = g.edges_between(sparse, dense)[0];
            assert_eq!(solver.cut_edges().get(&boundary), Some(&CutKind::Epoch));
        }
    }

    #[test]
    fn balance_places_and_costs_every_op() {
        let (g, ops) = make_chain(3);
        let candidates: HashMap<NodeId, Vec<OpModel>> =
            ops.iter().map(|op| (*op, vec![make_model(op.0 as u64, *op, 1, 1)])).collect();
        let mut solver = LegalityTracker::new(candidates).unwrap();
        let config = make_config(4, 4);

        let result = balance(
            &g,
            &config,
            &mut solver,
            &TopologicalScheduler,
            &TileGridEncoder::default(),
        )
        .unwrap();
        assert_eq!(result.solution.name_to_op_placement.len(), 3);
        assert_eq!(result.epoch_costs.len(), 1);
        assert_eq!(result.total_cycles(), 1000);
    }
}
