//! balancer-grid — reference collaborators for the balancer.
//!
//! The balancing pass talks to its scheduler and grid packers through the
//! traits in `balancer-core`. This crate provides simple, deterministic
//! implementations of them so a pass can run without a device backend.
//!
//! # Components
//!
//! - **`interactive`** — Rewindable first-fit packer ([`GridPlacer`])
//! - **`batch`** — Whole-schedule placement honoring break tags ([`LeftToRightPlacer`])
//! - **`scheduler`** — Kahn topological scheduler ([`TopologicalScheduler`])
//! - **`sparse`** — Shape-only sparse encoder ([`TileGridEncoder`])

pub mod batch;
pub mod interactive;
pub mod scheduler;
pub mod sparse;

pub use batch::LeftToRightPlacer;
pub use interactive::GridPlacer;
pub use scheduler::TopologicalScheduler;
pub use sparse::TileGridEncoder;
