//! Rescheduling of the unprocessed part of a graph.
//!
//! Once some ops are placed, the rest of the graph is scheduled again with
//! the placed ops ignored and their realized order kept as a constraint.
//! Break groups that touch placed ops are dropped and the break tags are
//! recomputed against the new schedule.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use balancer_core::{BalancerError, BalancerResult, Graph, NodeId, Schedule, Scheduler, SchedulerConfig};

use crate::cuts::remove_processed_break_groups;

/// A fresh schedule and the break tags that apply to it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleOutcome {
    pub schedule: Schedule,
    pub epoch_break_ops: HashSet<String>,
    pub chip_break_ops: HashSet<String>,
}

/// Schedule everything not yet processed.
///
/// `processed_nodes` and `processed_schedule` describe the same ops and
/// must have the same length. `op_names_to_epoch_break` and
/// `op_names_to_chip_break` are pruned in place.
pub fn policy_run_scheduler(
    graph: &Graph,
    scheduler: &impl Scheduler,
    base_config: &SchedulerConfig,
    processed_nodes: &HashSet<NodeId>,
    processed_schedule: &[String],
    op_names_to_epoch_break: &mut Vec<Vec<String>>,
    op_names_to_chip_break: &mut Vec<Vec<String>>,
) -> BalancerResult<ScheduleOutcome> {
    let mut config = base_config.clone();
    if !processed_nodes.is_empty() {
        if processed_nodes.len() != processed_schedule.len() {
            return Err(BalancerError::precondition(format!(
                "{} processed nodes but processed schedule has {} ops",
                processed_nodes.len(),
                processed_schedule.len()
            )));
        }
        config.ignored_nodes.extend(processed_nodes.iter().copied());
        config.constraints.push(processed_schedule.to_vec());
    }

    let schedule = scheduler.schedule(graph, &config)?;

    remove_processed_break_groups(graph, op_names_to_epoch_break, processed_nodes);
    remove_processed_break_groups(graph, op_names_to_chip_break, processed_nodes);
    let epoch_break_ops = tag_ops_for_epoch_break(op_names_to_epoch_break, op_names_to_chip_break, &schedule);
    let chip_break_ops = tag_ops_for_chip_break(op_names_to_chip_break, &schedule);

    debug!(
        ops = schedule.len(),
        processed = processed_nodes.len(),
        epoch_breaks = epoch_break_ops.len(),
        chip_breaks = chip_break_ops.len(),
        "policy schedule"
    );
    Ok(ScheduleOutcome {
        schedule,
        epoch_break_ops,
        chip_break_ops,
    })
}

/// [`policy_run_scheduler`] for callers that do not track chip breaks.
pub fn policy_run_scheduler_epoch_breaks(
    graph: &Graph,
    scheduler: &impl Scheduler,
    base_config: &SchedulerConfig,
    processed_nodes: &HashSet<NodeId>,
    processed_schedule: &[String],
    op_names_to_epoch_break: &mut Vec<Vec<String>>,
) -> BalancerResult<(Schedule, HashSet<String>)> {
    let mut no_chip_breaks = Vec::new();
    let outcome = policy_run_scheduler(
        graph,
        scheduler,
        base_config,
        processed_nodes,
        processed_schedule,
        op_names_to_epoch_break,
        &mut no_chip_breaks,
    )?;
    Ok((outcome.schedule, outcome.epoch_break_ops))
}

/// Ops that start a new epoch: the earliest scheduled op of every epoch
/// break group and of every chip break group.
pub fn tag_ops_for_epoch_break(
    op_names_to_epoch_break: &[Vec<String>],
    op_names_to_chip_break: &[Vec<String>],
    schedule: &[String],
) -> HashSet<String> {
    let positions = schedule_positions(schedule);
    op_names_to_epoch_break
        .iter()
        .chain(op_names_to_chip_break)
        .filter_map(|group| earliest_scheduled(group, &positions))
        .collect()
}

/// Ops that start a new chip: the earliest scheduled op of every chip break group.
pub fn tag_ops_for_chip_break(op_names_to_chip_break: &[Vec<String>], schedule: &[String]) -> HashSet<String> {
    let positions = schedule_positions(schedule);
    op_names_to_chip_break
        .iter()
        .filter_map(|group| earliest_scheduled(group, &positions))
        .collect()
}

fn schedule_positions(schedule: &[String]) -> HashMap<&str, usize> {
    schedule
        .iter()
        .enumerate()
        .map(|(i, name)| (name.as_str(), i))
        .collect()
}

fn earliest_scheduled(group: &[String], positions: &HashMap<&str, usize>) -> Option<String> {
    group
        .iter()
        .filter_map(|name| positions.get(name.as_str()).map(|pos| (*pos, name)))
        .min_by_key(|(pos, _)| *pos)
        .map(|(_, name)| name.clone())
}
