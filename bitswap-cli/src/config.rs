use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const CONFIG_FILE_NAME: &str = "bitswap.config.toml";
pub const ENV_PREFIX: &str = "BITSWAP";

/// On-disk/env-overridable configuration for the demonstration binary;
/// wraps `bitswap_core::Config` with the couple of knobs the CLI itself
/// needs on top.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub core: bitswap_core::Config,
    pub get_timeout_secs: u64,
}

impl Default for CliConfig {
    fn default() -> Self {
        let core = bitswap_core::Config::default();
        CliConfig {
            get_timeout_secs: core.get_timeout.as_secs(),
            core,
        }
    }
}

impl CliConfig {
    pub fn get_timeout(&self) -> Duration {
        Duration::from_secs(self.get_timeout_secs)
    }
}
