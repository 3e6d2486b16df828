//! balancer-core — shared types for the grid balancer.
//!
//! # Components
//!
//! - **`graph`** — Arena dataflow graph addressed by [`NodeId`]
//! - **`model`** — Op models (candidate execution plans) and their tiling
//! - **`config`** — `balancer.toml` parsing ([`BalancerConfig`])
//! - **`device`** — Target device grid and bandwidth figures
//! - **`placement`** — Placement results and batch placer config
//! - **`interfaces`** — Collaborator traits (solver, schedulers, placers, sparse encoder)
//! - **`legality`** — In-memory [`LegalityTracker`]

pub mod config;
pub mod device;
pub mod error;
pub mod graph;
pub mod interfaces;
pub mod legality;
pub mod model;
pub mod placement;

pub use config::{BalancerConfig, ComparatorVersion, PlacerDataConfig, PlacerOverride, RibbonConfig};
pub use device::{Arch, DeviceConfig};
pub use error::{BalancerError, BalancerResult};
pub use graph::{Edge, EdgeType, Graph, GraphSpec, MatmulKind, Node, NodeEpochType, NodeId, NodeKind, OpAttrs, Shape};
pub use interfaces::{
    BatchPlacer, BufferInfo, BufferResult, CutEdges, CutKind, GraphSolver, InteractivePlacer, Schedule, Scheduler,
    SchedulerConfig, SparseEncodeRequest, SparseEncoder, SparseEncoding, SparseLayout,
};
pub use legality::LegalityTracker;
pub use model::{
    BlockShape, BufferModel, DataFormat, GridShape, MathFidelity, OpModel, OpModelId, TStreamFactor, UBlockShape,
};
pub use placement::{Coord, CoordRange, OpPlacement, PlacerConfig, PlacerSolution};
