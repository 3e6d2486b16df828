//! balancer-placement — per-op model selection heuristics.
//!
//! Decides which op model each op gets and how tall its ribbon is. Nothing
//! here mutates the graph; the policy crate drives these pieces and owns
//! the legality and placer state.
//!
//! # Components
//!
//! - **`cost`** — Bandwidth-aware cycle estimate ([`CostModel`])
//! - **`compare`** — Op model preference order ([`OpModelComparator`])
//! - **`ribbon`** — Ribbon sizing and ribbon boundaries
//! - **`pairing`** — Sparse/dense matmul pairing and the two-op fit check
//! - **`sparse`** — Sparse matmul encodability cache

pub mod compare;
pub mod cost;
pub mod pairing;
pub mod ribbon;
pub mod sparse;

pub use compare::{
    Contender, OpModelComparator, close_to_target, close_to_target_exec_cycles, mblock_size_ok, prologue_ok,
    tie_break_v1, tie_break_v2, ukt_ok,
};
pub use cost::{CostModel, CycleBreakdown, is_output_write_to_dram_over_target};
pub use pairing::{can_bind_sparse_dense_matmul_pair, can_fit_on_single_epoch};
pub use ribbon::{RibbonChange, is_ribbon_matmul, next_ribbon_change_op, pick_ribbon_size, ribbon_buffering_factor};
pub use sparse::{SparseValidation, SparseValidationCache};
