//! balancer-policy — the balancing pass and its bookkeeping.
//!
//! Owns everything that mutates shared pass state: graph cuts, buffering,
//! rescheduling around placed ops, batch placement and validation.
//!
//! # Components
//!
//! - **`policy`** — Ribbon pass: window sizing, model selection, epoch packing ([`RibbonPolicy`], [`balance`])
//! - **`cuts`** — Epoch and ribbon graph cuts, stale break group pruning
//! - **`coordinator`** — Rescheduling of the unprocessed graph and break tagging
//! - **`buffering`** — Applies NOP and queue insertion instructions
//! - **`driver`** — Batch placement, solution validation and epoch costs
//! - **`report`** — Placement grids, op table and cost listing

pub mod buffering;
pub mod coordinator;
pub mod cuts;
pub mod driver;
pub mod error;
pub mod policy;
pub mod report;

pub use buffering::{InsertionInstruction, buffer_graph};
pub use coordinator::{
    ScheduleOutcome, policy_run_scheduler, policy_run_scheduler_epoch_breaks, tag_ops_for_chip_break,
    tag_ops_for_epoch_break,
};
pub use cuts::{cut_graph_solver_epoch, cut_graph_solver_ribbon, remove_processed_break_groups};
pub use driver::{
    EpochCost, OpModelMap, calculate_current_epoch_nodes, calculate_epoch_costs, num_epochs_per_epoch_type,
    run_placer, set_op_model_for_node, set_op_model_for_node_ribbon, to_op_model_map, validate_solution,
};
pub use error::{PolicyError, PolicyResult};
pub use policy::{BalanceResult, PolicyOutcome, RibbonPolicy, RibbonWindow, balance};
pub use report::{dump_balancer_placer_data, format_epoch_costs, render_placer_data};
