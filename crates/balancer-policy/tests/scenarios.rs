//! End-to-end balancing scenarios.
//!
//! Each test builds a small graph with hand-written candidate op models and
//! drives it through the public pass entry points with the reference
//! scheduler, placers and sparse encoder.

use std::collections::{BTreeMap, HashMap, HashSet};

use balancer_core::{
    Arch, BalancerConfig, BlockShape, BufferModel, Coord, CoordRange, CutKind, Graph, GraphSolver, GridShape,
    InteractivePlacer, LegalityTracker, MatmulKind, NodeId, OpAttrs, OpModel, OpModelId, OpPlacement,
    PlacerSolution, Scheduler, SchedulerConfig, Shape, UBlockShape,
};
use balancer_grid::{GridPlacer, LeftToRightPlacer, TileGridEncoder, TopologicalScheduler};
use balancer_placement::{CostModel, can_bind_sparse_dense_matmul_pair, pick_ribbon_size};
use balancer_policy::{
    InsertionInstruction, OpModelMap, PolicyError, RibbonPolicy, balance, buffer_graph, calculate_epoch_costs,
    num_epochs_per_epoch_type, run_placer, validate_solution,
};

fn make_config(rows: u32, cols: u32) -> BalancerConfig {
    let mut config = BalancerConfig::default();
    config.device.grid_rows = rows;
    config.device.grid_cols = cols;
    config
}

fn matmul_model(id: u64, op: NodeId, rows: u32, mblock_m: u32) -> OpModel {
    let block = BlockShape::new(1, mblock_m, 1, UBlockShape::new(1, 1));
    OpModel::new(OpModelId(id), op, GridShape::new(rows, 1), block)
        .with_cycles(Arch::Wormhole, 1000)
        .with_inputs(vec![BufferModel::new(block, 0), BufferModel::new(block, 0).prologue()])
}

// ── Scenario 1: ribbon sizing over three dense matmuls ──────────────

/// act -> mm0 -> mm1 -> mm2 -> out, each matmul with its own weights.
///
/// Every matmul has plans at 1, 2 and 4 rows. The 1-row plans carry a
/// 16-tile macro-block, taller than the configured maximum of 8.
fn make_matmul_chain() -> (Graph, LegalityTracker) {
    let mut g = Graph::new("scenario1");
    let mut prev = g.add_input("act", Shape::tiles(16, 4)).unwrap();
    let mut candidates: HashMap<NodeId, Vec<OpModel>> = HashMap::new();
    for i in 0..3u64 {
        let weights = g.add_input(&format!("w{i}"), Shape::tiles(4, 4)).unwrap();
        let mm = g
            .add_op(&format!("mm{i}"), OpAttrs::matmul(MatmulKind::Dense), Shape::tiles(16, 4))
            .unwrap();
        g.connect(prev, 0, mm, 0);
        g.connect(weights, 0, mm, 1);
        candidates.insert(
            mm,
            vec![
                matmul_model(i * 10, mm, 1, 16),
                matmul_model(i * 10 + 1, mm, 2, 8),
                matmul_model(i * 10 + 2, mm, 4, 4),
            ],
        );
        prev = mm;
    }
    let out = g.add_output("out", Shape::tiles(16, 4)).unwrap();
    g.connect(prev, 0, out, 0);
    (g, LegalityTracker::new(candidates).unwrap())
}

fn scenario1_config(maximize: bool) -> BalancerConfig {
    let mut config = make_config(4, 4);
    config.ribbon.max_tile_height = 8;
    config.ribbon.maximize = maximize;
    config
}

#[test]
fn scenario1_ribbon_sizing_minimizes_to_two() {
    let (g, solver) = make_matmul_chain();
    let config = scenario1_config(false);
    let schedule = TopologicalScheduler.schedule(&g, &SchedulerConfig::default()).unwrap();
    assert_eq!(schedule, vec!["mm0", "mm1", "mm2"]);

    let ribbon = pick_ribbon_size(0, 3, &g, &solver, &schedule, 4, &config.ribbon).unwrap();
    assert_eq!(ribbon, 2);
}

#[test]
fn scenario1_ribbon_sizing_maximizes_to_four() {
    let (g, solver) = make_matmul_chain();
    let config = scenario1_config(true);
    let schedule = TopologicalScheduler.schedule(&g, &SchedulerConfig::default()).unwrap();

    let ribbon = pick_ribbon_size(0, 3, &g, &solver, &schedule, 4, &config.ribbon).unwrap();
    assert_eq!(ribbon, 4);
}

#[test]
fn scenario1_policy_selects_ribbon_rows() {
    for (maximize, rows) in [(false, 2), (true, 4)] {
        let (g, mut solver) = make_matmul_chain();
        let config = scenario1_config(maximize);
        let outcome = RibbonPolicy::new(&g, &config)
            .run(&mut solver, &TopologicalScheduler, &TileGridEncoder::default())
            .unwrap();

        assert_eq!(outcome.ribbons.len(), 1, "all matmuls share a row dimension");
        assert_eq!(outcome.ribbons[0].ribbon_size, rows);
        assert!(
            outcome.selected.values().all(|m| m.grid_shape.r == rows),
            "maximize={maximize}: every matmul should use {rows} rows"
        );
        assert_eq!(outcome.interactive_epochs, 1);
    }
}

// ── Scenario 2: output edge leaving the epoch ───────────────────────

#[test]
fn scenario2_output_leaving_epoch_is_costed_through_dram() {
    let mut g = Graph::new("scenario2");
    let a = g.add_op("a", OpAttrs::new("add"), Shape::tiles(4, 4)).unwrap();
    let b = g.add_op("b", OpAttrs::new("add"), Shape::tiles(4, 4)).unwrap();
    g.connect(a, 0, b, 0);

    let bytes: u64 = 10 * 102_000;
    let mut selected = OpModelMap::new();
    selected.insert(
        "a".to_string(),
        OpModel::new(OpModelId(1), a, GridShape::new(1, 1), BlockShape::default())
            .with_cycles(Arch::Wormhole, 10)
            .with_output_bytes(bytes),
    );
    selected.insert(
        "b".to_string(),
        OpModel::new(OpModelId(2), b, GridShape::new(1, 1), BlockShape::default()).with_cycles(Arch::Wormhole, 10),
    );

    let mut config = make_config(4, 4);
    config.op_names_to_epoch_break = vec![vec!["b".to_string()]];
    let solution = run_placer(&g, &config, &selected, &TopologicalScheduler, &LeftToRightPlacer).unwrap();
    assert_eq!(solution.num_epochs, 2, "b is forced into its own epoch");

    let cost = CostModel::new(&g, &config);
    let costs = calculate_epoch_costs(&solution, &selected, &cost).unwrap();
    let device = &config.device;
    let dram = (bytes as f64 / f64::from(device.dram_bandwidth_bytes_per_cycle / 2.0)) as u32;
    let noc = (bytes as f64 / f64::from(device.noc_bandwidth_bytes_per_cycle / 2.0)) as u32;
    assert!(dram > noc);
    assert_eq!(costs[0].runtime_cycles, dram, "a writes to b across epochs");
    assert_eq!(costs[1].runtime_cycles, 10);

    // Same graph in one epoch stays on the NOC.
    let mut one_epoch_config = config.clone();
    one_epoch_config.op_names_to_epoch_break.clear();
    let solution = run_placer(&g, &one_epoch_config, &selected, &TopologicalScheduler, &LeftToRightPlacer).unwrap();
    let costs = calculate_epoch_costs(&solution, &selected, &cost).unwrap();
    assert_eq!(costs.len(), 1);
    assert_eq!(costs[0].runtime_cycles, noc);
}

// ── Scenario 3: sparse/dense pairing ────────────────────────────────

fn make_sparse_dense(extra_consumer: bool) -> (Graph, NodeId, NodeId) {
    let mut g = Graph::new("scenario3");
    let pick = g.add_input("pick", Shape::tiles(12, 8)).unwrap();
    let act = g.add_input("act", Shape::tiles(8, 4)).unwrap();
    let weights = g.add_input("weights", Shape::tiles(4, 4)).unwrap();
    let sparse = g
        .add_op("sparse", OpAttrs::matmul(MatmulKind::Sparse), Shape::tiles(12, 4))
        .unwrap();
    let mut dense_attrs = OpAttrs::matmul(MatmulKind::Dense);
    dense_attrs.pair_with_sparse = true;
    let dense = g.add_op("dense", dense_attrs, Shape::tiles(12, 4)).unwrap();
    g.connect(pick, 0, sparse, 0);
    g.connect(act, 0, sparse, 1);
    g.connect(sparse, 0, dense, 0);
    g.connect(weights, 0, dense, 1);
    if extra_consumer {
        let other = g.add_op("other", OpAttrs::new("gelu"), Shape::tiles(12, 4)).unwrap();
        g.connect(sparse, 0, other, 0);
    }
    (g, sparse, dense)
}

#[test]
fn scenario3_exclusive_pair_binds() {
    let (g, sparse, dense) = make_sparse_dense(false);
    let placer = GridPlacer::new(GridShape::new(4, 8), vec![0]);
    let sparse_model = OpModel::new(OpModelId(1), sparse, GridShape::new(3, 2), BlockShape::default());
    let dense_model = OpModel::new(OpModelId(2), dense, GridShape::new(3, 4), BlockShape::default());

    assert!(can_bind_sparse_dense_matmul_pair(
        &g,
        sparse,
        &sparse_model,
        dense,
        &dense_model,
        &placer,
        false
    ));
}

#[test]
fn scenario3_second_consumer_blocks_pairing() {
    let (g, sparse, dense) = make_sparse_dense(true);
    let placer = GridPlacer::new(GridShape::new(4, 8), vec![0]);
    let sparse_model = OpModel::new(OpModelId(1), sparse, GridShape::new(3, 2), BlockShape::default());
    let dense_model = OpModel::new(OpModelId(2), dense, GridShape::new(3, 4), BlockShape::default());

    assert!(placer.can_fit_on_single_epoch(3, 6, false), "the pair would fit");
    assert!(!can_bind_sparse_dense_matmul_pair(
        &g,
        sparse,
        &sparse_model,
        dense,
        &dense_model,
        &placer,
        false
    ));
}

/// act -> op0 -> sparse -> dense -> out on a 3x4 grid.
///
/// op0 takes two of the four columns, so the three-column pair cannot
/// join it and has to open the next epoch together.
fn make_pair_after_wide_op() -> (Graph, LegalityTracker, [NodeId; 3]) {
    let mut g = Graph::new("scenario3_overflow");
    let pick = g.add_input("pick", Shape::tiles(12, 8)).unwrap();
    let act = g.add_input("act", Shape::tiles(8, 4)).unwrap();
    let weights = g.add_input("weights", Shape::tiles(4, 4)).unwrap();
    let op0 = g.add_op("op0", OpAttrs::new("gelu"), Shape::tiles(8, 4)).unwrap();
    let sparse = g
        .add_op("sparse", OpAttrs::matmul(MatmulKind::Sparse), Shape::tiles(12, 4))
        .unwrap();
    let mut dense_attrs = OpAttrs::matmul(MatmulKind::Dense);
    dense_attrs.pair_with_sparse = true;
    let dense = g.add_op("dense", dense_attrs, Shape::tiles(12, 4)).unwrap();
    let out = g.add_output("out", Shape::tiles(12, 4)).unwrap();
    g.connect(act, 0, op0, 0);
    g.connect(pick, 0, sparse, 0);
    g.connect(op0, 0, sparse, 1);
    g.connect(pick, 0, sparse, 2);
    g.connect(sparse, 0, dense, 0);
    g.connect(weights, 0, dense, 1);
    g.connect(dense, 0, out, 0);

    let block = BlockShape::new(1, 1, 1, UBlockShape::new(1, 1));
    let sparse_weights = BlockShape::new(1, 1, 1, UBlockShape::new(4, 1));
    let model = |id: u64, op: NodeId, c: u32| {
        OpModel::new(OpModelId(id), op, GridShape::new(3, c), BlockShape::default()).with_cycles(Arch::Wormhole, 1000)
    };
    let candidates = HashMap::from([
        (op0, vec![model(1, op0, 2)]),
        (
            sparse,
            vec![model(2, sparse, 1).with_inputs(vec![
                BufferModel::new(block, 0).prologue(),
                BufferModel::new(sparse_weights, 0),
                BufferModel::new(block, 0).prologue(),
            ])],
        ),
        (
            dense,
            vec![model(3, dense, 2).with_inputs(vec![
                BufferModel::new(BlockShape::default(), 0),
                BufferModel::new(BlockShape::default(), 0).prologue(),
            ])],
        ),
    ]);
    (g, LegalityTracker::new(candidates).unwrap(), [op0, sparse, dense])
}

#[test]
fn scenario3_pair_overflowing_open_epoch_moves_together() {
    let (g, mut solver, [op0, sparse, dense]) = make_pair_after_wide_op();
    let config = make_config(3, 4);

    let result = balance(&g, &config, &mut solver, &TopologicalScheduler, &TileGridEncoder::from_graph(&g)).unwrap();

    let placed = &result.solution.name_to_op_placement;
    assert_eq!(result.solution.num_epochs, 2);
    assert_eq!(placed["op0"].epoch_id, 0);
    assert_eq!(placed["sparse"].epoch_id, 1);
    assert_eq!(placed["dense"].epoch_id, 1);
    assert_eq!(result.policy.interactive_epochs, 2);

    // The only epoch boundary is op0 -> sparse, and it is the only cut.
    let boundary = g.edges_between(op0, sparse)[0];
    assert_eq!(*solver.cut_edges(), BTreeMap::from([(boundary, CutKind::Epoch)]));
    assert!(g.edges_between(sparse, dense).iter().all(|e| !solver.cut_edges().contains_key(e)));
    assert_eq!(result.epoch_costs.len(), 2);
}

// ── Validation ──────────────────────────────────────────────────────

#[test]
fn validator_enumerates_missing_ops() {
    let mut solution = PlacerSolution {
        num_epochs: 1,
        ..PlacerSolution::default()
    };
    solution.name_to_op_placement.insert(
        "y".to_string(),
        OpPlacement {
            name: "y".to_string(),
            chip_id: 0,
            epoch_id: 0,
            placed_cores: CoordRange::new(Coord::new(0, 0), GridShape::new(1, 1)),
            transposed: false,
        },
    );

    let schedule: Vec<String> = ["x", "y", "z"].iter().map(|s| s.to_string()).collect();
    match validate_solution(&schedule, &solution) {
        Err(PolicyError::IncompletePlacement { missing }) => {
            assert_eq!(missing, vec!["x".to_string(), "z".to_string()]);
        }
        other => panic!("expected incomplete placement, got {other:?}"),
    }
    assert!(validate_solution(&schedule[1..2], &solution).is_ok());
}

// ── Full pass ───────────────────────────────────────────────────────

#[test]
fn full_pass_with_buffering_breaks_and_report() {
    let (g, mut solver) = make_matmul_chain();
    let instructions = vec![
        InsertionInstruction::Nop {
            src: "mm0".to_string(),
            dest: "mm1".to_string(),
            nop_count: 1,
            hoist_tms: false,
        },
        InsertionInstruction::Queue {
            src: "w2".to_string(),
            dest: "mm2".to_string(),
            input_id: 1,
        },
    ];
    assert!(buffer_graph(&g, &instructions, &mut solver).unwrap());
    assert_eq!(solver.cut_edges().len(), 1);

    let dir = tempfile::tempdir().unwrap();
    let mut config = scenario1_config(false);
    config.op_names_to_epoch_break = vec![vec!["mm2".to_string()]];
    config.placer_data.enabled = true;
    config.placer_data.dir = dir.path().to_path_buf();

    let result = balance(
        &g,
        &config,
        &mut solver,
        &TopologicalScheduler,
        &TileGridEncoder::from_graph(&g),
    )
    .unwrap();

    assert_eq!(result.solution.name_to_op_placement.len(), 3);
    assert_eq!(result.solution.num_epochs, 2);
    assert_eq!(result.solution.name_to_op_placement["mm2"].epoch_id, 1);
    assert_eq!(num_epochs_per_epoch_type(&result.solution), vec![2]);
    assert_eq!(result.epoch_costs.len(), 2);
    assert!(result.total_cycles() >= 2000);

    let bound: HashSet<u64> = ["mm0", "mm1", "mm2"]
        .iter()
        .map(|name| solver.selected(g.find(name).unwrap()).unwrap().id.0)
        .collect();
    assert_eq!(bound, HashSet::from([1, 11, 21]));

    let report = std::fs::read_to_string(dir.path().join("scenario1_ribbon.txt")).unwrap();
    assert!(report.contains("Temporal epoch 1 (forward), chip 0:"));
    assert!(report.contains("| mm2 "));
    assert!(report.contains("Total:"));
}
