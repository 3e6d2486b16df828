//! Op models — candidate execution plans for a single op.
//!
//! Op models are produced by the legalizer and never modified afterwards;
//! the balancer only chooses between them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::device::Arch;
use crate::graph::NodeId;

/// Stable identifier of an op model, unique within a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpModelId(pub u64);

/// Rows x columns of cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridShape {
    pub r: u32,
    pub c: u32,
}

impl GridShape {
    pub fn new(r: u32, c: u32) -> Self {
        Self { r, c }
    }

    pub fn volume(&self) -> u32 {
        self.r * self.c
    }

    pub fn transposed(&self) -> Self {
        Self { r: self.c, c: self.r }
    }
}

impl Default for GridShape {
    fn default() -> Self {
        Self::new(1, 1)
    }
}

impl std::fmt::Display for GridShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.r, self.c)
    }
}

/// Micro-block dimensions in tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UBlockShape {
    pub rt: u32,
    pub ct: u32,
}

impl UBlockShape {
    pub fn new(rt: u32, ct: u32) -> Self {
        Self { rt, ct }
    }

    pub fn volume(&self) -> u32 {
        self.rt * self.ct
    }
}

impl Default for UBlockShape {
    fn default() -> Self {
        Self::new(1, 1)
    }
}

/// Macro-block in micro-blocks, plus the streaming factor `t`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockShape {
    #[serde(default = "one")]
    pub t: u32,
    pub mblock_m: u32,
    pub mblock_n: u32,
    #[serde(default)]
    pub ublock: UBlockShape,
}

fn one() -> u32 {
    1
}

impl Default for BlockShape {
    fn default() -> Self {
        Self::new(1, 1, 1, UBlockShape::default())
    }
}

impl BlockShape {
    pub fn new(t: u32, mblock_m: u32, mblock_n: u32, ublock: UBlockShape) -> Self {
        Self {
            t,
            mblock_m,
            mblock_n,
            ublock,
        }
    }

    /// Macro-block height in tiles.
    pub fn rt(&self) -> u32 {
        self.mblock_m * self.ublock.rt
    }

    /// Macro-block width in tiles.
    pub fn ct(&self) -> u32 {
        self.mblock_n * self.ublock.ct
    }

    pub fn volume_no_t(&self) -> u32 {
        self.mblock_m * self.mblock_n * self.ublock.volume()
    }
}

/// How the op's tensor is sliced into `t` along rows and columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TStreamFactor {
    pub r: u32,
    pub c: u32,
    #[serde(default)]
    pub z_major: bool,
}

impl TStreamFactor {
    pub fn none() -> Self {
        Self {
            r: 1,
            c: 1,
            z_major: false,
        }
    }

    pub fn t(&self) -> u32 {
        self.r * self.c
    }

    pub fn is_streaming(&self) -> bool {
        self.t() > 1
    }
}

impl Default for TStreamFactor {
    fn default() -> Self {
        Self::none()
    }
}

impl std::fmt::Display for TStreamFactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let dir = if self.z_major { "z" } else { "rc" };
        write!(f, "{}x{}({dir})", self.r, self.c)
    }
}

/// One input or output buffer of an op model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferModel {
    pub block_shape: BlockShape,
    /// Total bytes moved through this buffer per invocation.
    pub size_bytes: u64,
    /// Parameter kept resident in core memory (loaded once in the prologue).
    #[serde(default)]
    pub prologue: bool,
}

impl BufferModel {
    pub fn new(block_shape: BlockShape, size_bytes: u64) -> Self {
        Self {
            block_shape,
            size_bytes,
            prologue: false,
        }
    }

    pub fn prologue(mut self) -> Self {
        self.prologue = true;
        self
    }

    pub fn total_size_bytes(&self) -> u64 {
        self.size_bytes
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataFormat {
    Float32,
    #[default]
    Float16B,
    Float16,
    Bfp8B,
    Bfp8,
    Bfp4B,
}

impl std::fmt::Display for DataFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MathFidelity {
    LoFi,
    #[default]
    HiFi2,
    HiFi3,
    HiFi4,
}

impl std::fmt::Display for MathFidelity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// A candidate execution plan for one op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpModel {
    pub id: OpModelId,
    /// Op this model realizes. Assigned when candidates are bound to a graph.
    #[serde(skip, default = "unbound")]
    pub op: NodeId,
    pub grid_shape: GridShape,
    #[serde(default)]
    pub t_stream_factor: TStreamFactor,
    #[serde(default = "one")]
    pub fracture_factor: u32,
    /// Indexed by consumer input port.
    #[serde(default)]
    pub input_buffers: Vec<BufferModel>,
    /// Indexed by producer output port.
    pub output_buffers: Vec<BufferModel>,
    #[serde(default)]
    pub data_format: DataFormat,
    #[serde(default)]
    pub math_fidelity: MathFidelity,
    /// Kernel cycles per architecture.
    #[serde(default)]
    pub execution_cycles: BTreeMap<Arch, u32>,
    #[serde(default)]
    pub l1_memory_bytes: u64,
    #[serde(default)]
    pub has_sparse_buffer: bool,
}

fn unbound() -> NodeId {
    NodeId(usize::MAX)
}

impl OpModel {
    /// A model with a single output buffer of `block_shape` and no inputs.
    pub fn new(id: OpModelId, op: NodeId, grid_shape: GridShape, block_shape: BlockShape) -> Self {
        Self {
            id,
            op,
            grid_shape,
            t_stream_factor: TStreamFactor::none(),
            fracture_factor: 1,
            input_buffers: Vec::new(),
            output_buffers: vec![BufferModel::new(block_shape, 0)],
            data_format: DataFormat::default(),
            math_fidelity: MathFidelity::default(),
            execution_cycles: BTreeMap::new(),
            l1_memory_bytes: 0,
            has_sparse_buffer: false,
        }
    }

    pub fn with_cycles(mut self, arch: Arch, cycles: u32) -> Self {
        self.execution_cycles.insert(arch, cycles);
        self
    }

    pub fn with_inputs(mut self, inputs: Vec<BufferModel>) -> Self {
        self.input_buffers = inputs;
        self
    }

    pub fn with_output_bytes(mut self, size_bytes: u64) -> Self {
        if let Some(out) = self.output_buffers.first_mut() {
            out.size_bytes = size_bytes;
        }
        self
    }

    pub fn with_t_stream(mut self, t_stream_factor: TStreamFactor) -> Self {
        self.t_stream_factor = t_stream_factor;
        self
    }

    /// Output block shape, which defines the op's tiling.
    pub fn block_shape(&self) -> BlockShape {
        self.output_buffers
            .first()
            .map(|b| b.block_shape)
            .unwrap_or_default()
    }

    /// Kernel cycles on `arch`. Single-arch tables answer for any arch.
    pub fn execution_cycles(&self, arch: Arch) -> u32 {
        self.execution_cycles
            .get(&arch)
            .or_else(|| self.execution_cycles.values().next())
            .copied()
            .unwrap_or(0)
    }

    /// Whether the operand on `port` is a prologue-resident parameter.
    pub fn has_prologue(&self, port: usize) -> bool {
        self.input_buffers.get(port).is_some_and(|b| b.prologue)
    }

    pub fn l1_memory_usage(&self) -> u64 {
        self.l1_memory_bytes
    }
}
