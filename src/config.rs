use meshrpc_rpc::RpcConfig;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "config/meshrpc.toml";

/// Host configuration: the engine settings plus the demo session shape.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct HostConfig {
    pub rpc: RpcConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Clients besides the authority.
    pub peers: u16,
    /// Ticks to simulate.
    pub ticks: u64,
    /// Simulation rate; one tick lasts `1 / tick_rate_hz` seconds.
    pub tick_rate_hz: u32,
    /// JSONL file receiving every frame exchanged, if set.
    pub traffic_log: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            peers: 3,
            ticks: 120,
            tick_rate_hz: 20,
            traffic_log: None,
        }
    }
}

impl HostConfig {
    /// Load from the default path.
    pub fn load() -> Self {
        Self::load_from_path(Path::new(DEFAULT_CONFIG_PATH))
    }

    /// Load from an explicit path, falling back to defaults on errors.
    pub fn load_from_path(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<HostConfig>(&contents) {
                Ok(cfg) => cfg,
                Err(err) => {
                    warn!("Failed to parse {}: {err}. Using defaults", path.display());
                    HostConfig::default()
                }
            },
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to read {}: {err}. Using defaults", path.display());
                }
                HostConfig::default()
            }
        }
    }
}
