//! Target device description.

use serde::{Deserialize, Serialize};

/// Device architecture. Execution cycle tables on op models are keyed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    Grayskull,
    Wormhole,
}

impl Arch {
    pub fn name(&self) -> &'static str {
        match self {
            Arch::Grayskull => "grayskull",
            Arch::Wormhole => "wormhole",
        }
    }
}

impl std::fmt::Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Core grid and bandwidth characteristics of one chip.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub arch: Arch,
    /// Rows of worker cores.
    pub grid_rows: u32,
    /// Columns of worker cores.
    pub grid_cols: u32,
    /// Peak core-to-core bandwidth, bytes per cycle.
    pub noc_bandwidth_bytes_per_cycle: f32,
    /// Peak off-chip memory bandwidth, bytes per cycle.
    pub dram_bandwidth_bytes_per_cycle: f32,
    pub dram_num_channels: u32,
    pub dram_num_subchannels: u32,
}

impl DeviceConfig {
    /// Wormhole defaults (10x8 worker grid).
    pub fn wormhole() -> Self {
        Self {
            arch: Arch::Wormhole,
            grid_rows: 10,
            grid_cols: 8,
            noc_bandwidth_bytes_per_cycle: 32.0,
            // Measured sustained rate; the nominal figure overstates it.
            dram_bandwidth_bytes_per_cycle: 20.4,
            dram_num_channels: 6,
            dram_num_subchannels: 2,
        }
    }

    /// Grayskull defaults (10x12 worker grid).
    pub fn grayskull() -> Self {
        Self {
            arch: Arch::Grayskull,
            grid_rows: 10,
            grid_cols: 12,
            noc_bandwidth_bytes_per_cycle: 32.0,
            dram_bandwidth_bytes_per_cycle: 12.0,
            dram_num_channels: 8,
            dram_num_subchannels: 1,
        }
    }

    pub fn is_wormhole(&self) -> bool {
        self.arch == Arch::Wormhole
    }

    pub fn grid_cores(&self) -> u32 {
        self.grid_rows * self.grid_cols
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::wormhole()
    }
}
