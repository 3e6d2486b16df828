//! Bandwidth-aware cycle estimate for one op model.
//!
//! The estimate is the slowest of three limiters:
//! - **Kernel**: the model's own execution cycles on the target arch
//! - **Memory read**: the largest operand buffer over its fabric bandwidth
//! - **Memory write**: the largest output buffer over its fabric bandwidth
//!
//! An edge goes over DRAM when it touches a queue, an input or an output
//! node, or when its consumer sits outside the epoch being built. Every
//! other edge goes over the NOC.

use std::collections::HashSet;

use tracing::trace;

use balancer_core::{BalancerConfig, DeviceConfig, Graph, NodeId, OpModel};

/// Theoretical bandwidth is halved for a better average estimate.
const INEFFICIENCY_DIVIDER: f32 = 2.0;
const SUBCHANNEL_OVERSUB_COEFF: f32 = 1.5;

/// Per-limiter cycle counts of one estimate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleBreakdown {
    pub kernel: u32,
    pub memory_read: u32,
    pub memory_write: u32,
}

impl CycleBreakdown {
    pub fn limiter(&self) -> u32 {
        self.kernel.max(self.memory_read).max(self.memory_write)
    }
}

/// Cycle estimator bound to one graph and device.
#[derive(Debug, Clone, Copy)]
pub struct CostModel<'a> {
    graph: &'a Graph,
    device: &'a DeviceConfig,
    legacy_cycles_calc: bool,
}

impl<'a> CostModel<'a> {
    pub fn new(graph: &'a Graph, config: &'a BalancerConfig) -> Self {
        Self::with_device(graph, &config.device, config.legacy_cycles_calc)
    }

    /// With `legacy_cycles_calc` the estimate is the kernel cycles alone.
    pub fn with_device(graph: &'a Graph, device: &'a DeviceConfig, legacy_cycles_calc: bool) -> Self {
        Self {
            graph,
            device,
            legacy_cycles_calc,
        }
    }

    pub fn graph(&self) -> &'a Graph {
        self.graph
    }

    pub fn device(&self) -> &'a DeviceConfig {
        self.device
    }

    /// Estimate with no epoch context and no DRAM contention.
    pub fn limiter_cycles(&self, model: &OpModel) -> u32 {
        self.breakdown(model, 0, None).limiter()
    }

    /// Estimate where users outside `current_epoch_nodes` are reached through DRAM.
    pub fn limiter_cycles_in_epoch(&self, model: &OpModel, current_epoch_nodes: &HashSet<NodeId>) -> u32 {
        self.breakdown(model, 0, Some(current_epoch_nodes)).limiter()
    }

    /// Full estimate.
    ///
    /// `dram_access_core_count` is the number of cores expected to hit DRAM
    /// concurrently; it derates DRAM bandwidth once it oversubscribes the
    /// channel/subchannel capacity.
    pub fn breakdown(
        &self,
        model: &OpModel,
        dram_access_core_count: u32,
        current_epoch_nodes: Option<&HashSet<NodeId>>,
    ) -> CycleBreakdown {
        let kernel = model.execution_cycles(self.device.arch);
        if self.legacy_cycles_calc {
            return CycleBreakdown {
                kernel,
                ..CycleBreakdown::default()
            };
        }

        let noc_bw = self.noc_bandwidth();
        let dram_bw = self.dram_bandwidth(dram_access_core_count);

        let mut memory_read = 0;
        for edge in self.graph.operand_data_edges(model.op) {
            let producer = self.graph.node(edge.producer);
            let port = edge.consumer_port as usize;
            let bytes = model.input_buffers.get(port).map(|b| b.total_size_bytes()).unwrap_or(0);
            let from_dram = (producer.is_queue() || producer.is_input()) && !model.has_prologue(port);
            let bw = if from_dram { dram_bw } else { noc_bw };
            memory_read = memory_read.max(transfer_cycles(bytes, bw));
        }

        let mut memory_write = 0;
        for edge in self.graph.user_data_edges(model.op) {
            let consumer = self.graph.node(edge.consumer);
            let outside_epoch = current_epoch_nodes.is_some_and(|nodes| !nodes.contains(&edge.consumer));
            let to_dram = consumer.is_queue() || consumer.is_output() || outside_epoch;
            let bytes = model
                .output_buffers
                .get(edge.producer_port as usize)
                .map(|b| b.total_size_bytes())
                .unwrap_or(0);
            let bw = if to_dram { dram_bw } else { noc_bw };
            memory_write = memory_write.max(transfer_cycles(bytes, bw));
        }

        let breakdown = CycleBreakdown {
            kernel,
            memory_read,
            memory_write,
        };
        trace!(
            op = model.op.0,
            model = model.id.0,
            kernel,
            memory_read,
            memory_write,
            "limiter cycles"
        );
        breakdown
    }

    fn noc_bandwidth(&self) -> f32 {
        self.device.noc_bandwidth_bytes_per_cycle / INEFFICIENCY_DIVIDER
    }

    fn dram_bandwidth(&self, dram_access_core_count: u32) -> f32 {
        let capacity =
            (self.device.dram_num_channels * self.device.dram_num_subchannels).max(1) as f32 / SUBCHANNEL_OVERSUB_COEFF;
        let divider = INEFFICIENCY_DIVIDER.max((dram_access_core_count as f32 / capacity).ceil());
        self.device.dram_bandwidth_bytes_per_cycle / divider
    }
}

/// Whether writing every output buffer of `model` to DRAM alone would exceed `target_exec_cycles`.
pub fn is_output_write_to_dram_over_target(model: &OpModel, device: &DeviceConfig, target_exec_cycles: u32) -> bool {
    let dram_bw = device.dram_bandwidth_bytes_per_cycle / INEFFICIENCY_DIVIDER;
    let memory_write = model
        .output_buffers
        .iter()
        .map(|b| transfer_cycles(b.total_size_bytes(), dram_bw))
        .max()
        .unwrap_or(0);
    memory_write > target_exec_cycles
}

fn transfer_cycles(bytes: u64, bandwidth: f32) -> u32 {
    if bandwidth <= 0.0 {
        return u32::MAX;
    }
    (bytes as f64 / f64::from(bandwidth)).min(f64::from(u32::MAX)) as u32
}
