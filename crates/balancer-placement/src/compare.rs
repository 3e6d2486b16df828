//! Op model preference order.
//!
//! [`OpModelComparator::is_candidate_better_than_current`] walks an ordered
//! list of rules; the first one that tells the two models apart decides:
//!
//! 1. Row count closer to the target ribbon
//! 2. Smaller row count
//! 3. Prologue readiness
//! 4. Fewer columns, when both fit the cycle target
//! 5. Inner micro-block dimension of at least 4 ("ukt")
//! 6. Macro-block volume of at least 8 when t-streaming
//! 7. Closeness to the cycle target, per [`ComparatorVersion`]

use tracing::trace;

use balancer_core::{BalancerConfig, BalancerError, BalancerResult, ComparatorVersion, Graph, Node, OpModel};

use crate::cost::CostModel;

/// Whether the parameter buffers a matmul depends on are prologue-resident.
///
/// Non-matmul ops always pass.
pub fn prologue_ok(node: &Node, model: &OpModel) -> bool {
    if !node.is_matmul() {
        return true;
    }
    if node.is_sparse_matmul() {
        model.has_prologue(0) && model.has_prologue(2)
    } else {
        model.has_prologue(1)
    }
}

/// Inner micro-block dimension check for matmuls.
pub fn ukt_ok(node: &Node, model: &OpModel) -> bool {
    if node.is_matmul_not_sparse() {
        model
            .input_buffers
            .first()
            .is_some_and(|b| b.block_shape.ublock.ct >= 4)
    } else if node.is_sparse_matmul() {
        model
            .input_buffers
            .get(1)
            .is_some_and(|b| b.block_shape.ublock.rt >= 4)
    } else {
        true
    }
}

/// Streaming models need a macro-block of at least 8 tiles.
pub fn mblock_size_ok(model: &OpModel) -> bool {
    let block = model.block_shape();
    block.t <= 1 || block.volume_no_t() >= 8
}

/// Under target, with the kernel itself above 80% of it.
pub fn close_to_target_exec_cycles(kernel_exec_cycles: u32, limiter_cycles: u32, target: u32) -> bool {
    limiter_cycles < target && f64::from(kernel_exec_cycles) > f64::from(target) * 0.8
}

/// Under target and above 80% of it.
pub fn close_to_target(test: u32, target: u32) -> bool {
    test < target && f64::from(test) > f64::from(target) * 0.8
}

/// What the final tie-break looks at for one model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Contender {
    /// Kernel execution cycles.
    pub exec_cycles: u32,
    /// Cost model estimate.
    pub limiter_cycles: u32,
    /// Macro-block volume, excluding t.
    pub volume: u32,
}

impl Contender {
    fn utilization(&self) -> f64 {
        if self.limiter_cycles == 0 {
            return 0.0;
        }
        f64::from(self.exec_cycles) / f64::from(self.limiter_cycles)
    }

    fn larger_block_or_better_utilization(&self, current: &Contender) -> bool {
        self.volume > current.volume
            || (self.volume == current.volume && self.utilization() > current.utilization())
    }
}

/// Closeness is judged on kernel cycles. Two close models prefer the larger
/// block, then better utilization. Two far models prefer fitting the
/// target, then the cheaper one.
pub fn tie_break_v2(current: &Contender, candidate: &Contender, target: u32) -> bool {
    let current_close = close_to_target_exec_cycles(current.exec_cycles, current.limiter_cycles, target);
    let candidate_close = close_to_target_exec_cycles(candidate.exec_cycles, candidate.limiter_cycles, target);

    match (current_close, candidate_close) {
        (true, true) => candidate.larger_block_or_better_utilization(current),
        (true, false) => false,
        (false, true) => true,
        (false, false) => {
            if candidate.limiter_cycles <= target {
                current.limiter_cycles > target || candidate.larger_block_or_better_utilization(current)
            } else {
                candidate.limiter_cycles < current.limiter_cycles
            }
        }
    }
}

/// Closeness is judged on the estimate alone. Two close models prefer the
/// larger block; two far models prefer the one nearer the target.
pub fn tie_break_v1(current: &Contender, candidate: &Contender, target: u32) -> bool {
    let current_close = close_to_target(current.limiter_cycles, target);
    let candidate_close = close_to_target(candidate.limiter_cycles, target);

    match (current_close, candidate_close) {
        (true, true) => candidate.volume > current.volume,
        (true, false) => false,
        (false, true) => true,
        (false, false) => candidate.limiter_cycles.abs_diff(target) < current.limiter_cycles.abs_diff(target),
    }
}

/// Strict preference over op models of the same op.
#[derive(Debug, Clone, Copy)]
pub struct OpModelComparator<'a> {
    cost: CostModel<'a>,
    version: ComparatorVersion,
}

impl<'a> OpModelComparator<'a> {
    pub fn new(graph: &'a Graph, config: &'a BalancerConfig) -> Self {
        Self {
            cost: CostModel::new(graph, config),
            version: config.comparator,
        }
    }

    pub fn with_cost_model(cost: CostModel<'a>, version: ComparatorVersion) -> Self {
        Self { cost, version }
    }

    pub fn cost_model(&self) -> &CostModel<'a> {
        &self.cost
    }

    /// Returns true if `candidate` should replace `current`.
    ///
    /// Both models must belong to the same op.
    pub fn is_candidate_better_than_current(
        &self,
        current: &OpModel,
        candidate: &OpModel,
        ribbon_size: u32,
        target_exec_cycles: u32,
    ) -> BalancerResult<bool> {
        if current.op != candidate.op {
            return Err(BalancerError::precondition(format!(
                "comparing op models of different ops {} and {}",
                current.op, candidate.op
            )));
        }
        let graph = self.cost.graph();
        if current.op.0 >= graph.len() {
            return Err(BalancerError::UnknownNode(current.op.to_string()));
        }
        let node = graph.node(current.op);

        let candidate_r = candidate.grid_shape.r;
        let current_r = current.grid_shape.r;
        let candidate_distance = candidate_r.abs_diff(ribbon_size);
        let current_distance = current_r.abs_diff(ribbon_size);
        if candidate_distance != current_distance {
            return Ok(candidate_distance < current_distance);
        }
        // Equally far from the ribbon: the smaller one disturbs it less.
        if candidate_r != current_r {
            return Ok(candidate_r < current_r);
        }

        let candidate_prologue = prologue_ok(node, candidate);
        let current_prologue = prologue_ok(node, current);
        if candidate_prologue != current_prologue {
            return Ok(candidate_prologue);
        }

        let current_cycles = self.cost.limiter_cycles(current);
        let candidate_cycles = self.cost.limiter_cycles(candidate);

        if candidate_cycles <= target_exec_cycles
            && current_cycles <= target_exec_cycles
            && candidate.grid_shape.c != current.grid_shape.c
        {
            return Ok(candidate.grid_shape.c < current.grid_shape.c);
        }

        let candidate_ukt = ukt_ok(node, candidate);
        let current_ukt = ukt_ok(node, current);
        if candidate_ukt != current_ukt {
            return Ok(candidate_ukt);
        }

        let candidate_mblock = mblock_size_ok(candidate);
        let current_mblock = mblock_size_ok(current);
        if candidate_mblock != current_mblock {
            return Ok(candidate_mblock);
        }

        let arch = self.cost.device().arch;
        let current = Contender {
            exec_cycles: current.execution_cycles(arch),
            limiter_cycles: current_cycles,
            volume: current.block_shape().volume_no_t(),
        };
        let candidate = Contender {
            exec_cycles: candidate.execution_cycles(arch),
            limiter_cycles: candidate_cycles,
            volume: candidate.block_shape().volume_no_t(),
        };
        let better = match self.version {
            ComparatorVersion::V1 => tie_break_v1(&current, &candidate, target_exec_cycles),
            ComparatorVersion::V2 => tie_break_v2(&current, &candidate, target_exec_cycles),
        };
        trace!(op = %node.name, ?current, ?candidate, better, "op model tie-break");
        Ok(better)
    }

    /// The preferred model among `candidates`, scanning in order.
    pub fn pick_best<'m>(
        &self,
        candidates: &'m [OpModel],
        ribbon_size: u32,
        target_exec_cycles: u32,
    ) -> BalancerResult<&'m OpModel> {
        let (first, rest) = candidates
            .split_first()
            .ok_or_else(|| BalancerError::EmptyCandidates("no op models to pick from".to_string()))?;
        let mut best = first;
        for candidate in rest {
            if self.is_candidate_better_than_current(best, candidate, ribbon_size, target_exec_cycles)? {
                best = candidate;
            }
        }
        Ok(best)
    }
}
