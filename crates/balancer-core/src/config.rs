//! balancer.toml configuration.
//!
//! Every tunable the policies consult lives here. The config is loaded once,
//! never mutated, and passed by reference into each component.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::device::DeviceConfig;
use crate::error::{BalancerError, BalancerResult};
use crate::placement::Coord;

/// Default per-op cycle budget used when selecting op models.
pub const DEFAULT_TARGET_CYCLES: u32 = 95_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    pub device: DeviceConfig,
    /// Chips available to the placer, in placement order.
    pub chip_ids: Vec<u32>,
    pub ribbon: RibbonConfig,
    /// Use raw kernel cycles only, ignoring memory bandwidth.
    pub legacy_cycles_calc: bool,
    pub comparator: ComparatorVersion,
    /// Cycle budget the comparator aims each op model at.
    pub target_cycles: u32,
    /// Encode sparse matmuls with the buffer-op layout even without a sparse buffer.
    pub force_sparse_buffer_layout: bool,
    pub enable_auto_transposing_placement: bool,
    pub output_queues_on_host: bool,
    /// Groups of op names; the earliest scheduled op of each group starts a new epoch.
    pub op_names_to_epoch_break: Vec<Vec<String>>,
    /// Groups of op names; the earliest scheduled op of each group starts a new chip.
    pub op_names_to_chip_break: Vec<Vec<String>>,
    pub op_to_chip_id_assignment: HashMap<String, u32>,
    pub placer_overrides: HashMap<String, PlacerOverride>,
    /// Name of the policy, used in diagnostic file names.
    pub policy_name: String,
    pub placer_data: PlacerDataConfig,
}

/// Ribbon sizing knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RibbonConfig {
    /// Smallest macro-block row tile count a plan may use.
    pub min_tile_height: u32,
    /// Largest macro-block row tile count a plan may use.
    pub max_tile_height: u32,
    /// Cap on the ribbon size; the device row count always applies.
    pub max_height: Option<u32>,
    /// Pick the largest legal ribbon instead of the smallest.
    pub maximize: bool,
    /// Ignore plans that stream along rows.
    pub skip_streaming: bool,
}

impl Default for RibbonConfig {
    fn default() -> Self {
        Self {
            min_tile_height: 1,
            max_tile_height: 200,
            max_height: None,
            maximize: false,
            skip_streaming: false,
        }
    }
}

impl RibbonConfig {
    /// Upper bound for ribbon sizes on a device with `device_rows` rows.
    pub fn max_ribbon_size(&self, device_rows: u32) -> u32 {
        self.max_height.map_or(device_rows, |h| h.min(device_rows))
    }
}

/// Which final tie-break rule the op model comparator applies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComparatorVersion {
    /// Closeness to target on limiter cycles, then distance to target.
    V1,
    /// Closeness to target on kernel cycles, then block volume and utilization.
    #[default]
    V2,
}

/// Per-op hints forwarded to the placer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacerOverride {
    /// Pin the op's top-left core.
    pub start: Option<Coord>,
    /// Force the transposed grid shape.
    pub transpose: bool,
    /// Start a new temporal epoch at this op.
    pub temporal_epoch_break: bool,
}

/// Placement visualization dump.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacerDataConfig {
    pub enabled: bool,
    pub dir: PathBuf,
}

impl Default for PlacerDataConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: PathBuf::from("bp_data"),
        }
    }
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            chip_ids: vec![0],
            ribbon: RibbonConfig::default(),
            legacy_cycles_calc: false,
            comparator: ComparatorVersion::default(),
            target_cycles: DEFAULT_TARGET_CYCLES,
            force_sparse_buffer_layout: false,
            enable_auto_transposing_placement: false,
            output_queues_on_host: true,
            op_names_to_epoch_break: Vec::new(),
            op_names_to_chip_break: Vec::new(),
            op_to_chip_id_assignment: HashMap::new(),
            placer_overrides: HashMap::new(),
            policy_name: "ribbon".to_string(),
            placer_data: PlacerDataConfig::default(),
        }
    }
}

impl BalancerConfig {
    pub fn from_file(path: &Path) -> BalancerResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> BalancerResult<Self> {
        let config: BalancerConfig =
            toml::from_str(content).map_err(|e| BalancerError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject configs no pass could run with.
    pub fn validate(&self) -> BalancerResult<()> {
        if self.device.grid_rows == 0 || self.device.grid_cols == 0 {
            return Err(BalancerError::Config("device grid must be at least 1x1".into()));
        }
        if self.chip_ids.is_empty() {
            return Err(BalancerError::Config("chip_ids must not be empty".into()));
        }
        if self.ribbon.min_tile_height > self.ribbon.max_tile_height {
            return Err(BalancerError::Config(format!(
                "ribbon.min_tile_height ({}) exceeds ribbon.max_tile_height ({})",
                self.ribbon.min_tile_height, self.ribbon.max_tile_height
            )));
        }
        Ok(())
    }
}
