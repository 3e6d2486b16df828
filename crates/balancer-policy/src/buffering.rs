//! Applying insertion instructions to the legality tracker.
//!
//! NOP instructions become one batched buffering request; queue
//! instructions cut the operand edge the queue would sit on.

use serde::{Deserialize, Serialize};
use tracing::debug;

use balancer_core::{BalancerError, BufferInfo, CutKind, Edge, EdgeType, Graph, GraphSolver};

use crate::error::{PolicyError, PolicyResult};

/// A buffering decision targeting one producer/consumer pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InsertionInstruction {
    /// Insert `nop_count` NOPs on every data edge from `src` to `dest`.
    Nop {
        src: String,
        dest: String,
        nop_count: u32,
        #[serde(default)]
        hoist_tms: bool,
    },
    /// Insert a queue in front of operand `input_id` of `dest`.
    Queue { src: String, dest: String, input_id: u32 },
    /// Any kind this pass does not know how to apply.
    #[serde(other)]
    Unsupported,
}

/// Apply `instructions` to `solver`.
///
/// Returns whether NOPs were inserted. Queue instructions only cut edges.
pub fn buffer_graph(
    graph: &Graph,
    instructions: &[InsertionInstruction],
    solver: &mut impl GraphSolver,
) -> PolicyResult<bool> {
    let mut buffer_info: Vec<BufferInfo> = Vec::new();
    let mut edges_to_cut: Vec<Edge> = Vec::new();

    for (index, instruction) in instructions.iter().enumerate() {
        match instruction {
            InsertionInstruction::Nop {
                src,
                dest,
                nop_count,
                hoist_tms,
            } => {
                let producer = graph.id_of(src)?;
                let consumer = graph.id_of(dest)?;
                buffer_info.extend(
                    graph
                        .edges_between(producer, consumer)
                        .into_iter()
                        .filter(|edge| edge.edge_type == EdgeType::Data)
                        .map(|edge| BufferInfo {
                            edge,
                            nop_count: *nop_count,
                            hoist_tms: *hoist_tms,
                        }),
                );
            }
            InsertionInstruction::Queue { dest, input_id, .. } => {
                let consumer = graph.id_of(dest)?;
                let operand_edges = graph.operand_data_edges_filtered(consumer, |edge| edge.consumer_port == *input_id);
                let &[edge] = operand_edges.as_slice() else {
                    return Err(BalancerError::precondition(format!(
                        "expected exactly one operand edge on {dest} port {input_id}, found {}",
                        operand_edges.len()
                    ))
                    .into());
                };
                edges_to_cut.push(edge);
            }
            InsertionInstruction::Unsupported => {
                return Err(PolicyError::UnexpectedInstruction(format!(
                    "instruction {index} has an unsupported kind"
                )));
            }
        }
    }

    let mut graph_modified = false;
    if !buffer_info.is_empty() {
        let results = solver.buffer(&buffer_info);
        if results.is_empty() {
            return Err(PolicyError::NothingBuffered);
        }
        debug!(requested = buffer_info.len(), buffered = results.len(), "inserted nops");
        graph_modified = true;
    }

    if !edges_to_cut.is_empty() {
        let cut = solver.cut(&edges_to_cut, CutKind::Ribbon);
        debug!(requested = edges_to_cut.len(), cut, "cut edges for queues");
    }

    Ok(graph_modified)
}
