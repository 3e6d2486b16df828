use anyhow::bail;

use balancer_core::{BalancerConfig, DeviceConfig};

pub fn default_config(arch: &str) -> anyhow::Result<String> {
    let device = match arch {
        "wormhole" => DeviceConfig::wormhole(),
        "grayskull" => DeviceConfig::grayskull(),
        _ => bail!("Unsupported arch: {arch}. Supported: wormhole, grayskull"),
    };
    let config = BalancerConfig {
        device,
        ..BalancerConfig::default()
    };
    config.to_toml_string()
}
