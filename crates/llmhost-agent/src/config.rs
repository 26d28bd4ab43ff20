//! Configuration loading for the daemon
//!
//! The file and environment layering lives in [`NodeConfig::load`]; this
//! module adds the command-line overrides on top and the sample
//! configuration printed by `llmhostd config`.

use crate::Result;
use llmhost_core::{
    HardwareConfig, ModelDefinition, ModelMode, NodeConfig, StaticDevice,
};
use std::path::{Path, PathBuf};
use tracing::info;

/// Settings given on the command line, applied after file and environment
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub log_level: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
}

impl ConfigOverrides {
    /// Apply the overrides and re-validate
    pub fn apply(&self, config: &mut NodeConfig) -> Result<()> {
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }

        config.validate()?;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.log_level.is_none() && self.host.is_none() && self.port.is_none()
    }
}

/// Load the node configuration and apply command-line overrides
pub fn load_config(path: Option<&Path>, overrides: &ConfigOverrides) -> Result<NodeConfig> {
    let mut config = NodeConfig::load(path)?;

    if !overrides.is_empty() {
        info!("Applying command-line overrides: {:?}", overrides);
        overrides.apply(&mut config)?;
    }

    Ok(config)
}

/// A complete configuration with one example model
pub fn default_config() -> NodeConfig {
    let mut config = NodeConfig::default();

    config.devices.static_devices = vec![StaticDevice {
        id: "gpu0".to_string(),
        total_memory_mb: 16384,
        free_memory_mb: None,
    }];

    config.models = vec![ModelDefinition {
        aliases: vec!["qwen-14b".to_string(), "qwen".to_string()],
        mode: ModelMode::Chat,
        port: 9001,
        auto_start: false,
        working_dir: None,
        env: Default::default(),
        hardware: vec![HardwareConfig {
            name: "single-gpu".to_string(),
            required_devices: ["gpu0".to_string()].into(),
            memory_mb: [("gpu0".to_string(), 12000)].into(),
            script: PathBuf::from("scripts/qwen-14b.sh"),
        }],
    }];

    config
}
