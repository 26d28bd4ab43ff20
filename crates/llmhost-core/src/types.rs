//! Core type definitions for llmhost

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

/// API family a model backend speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelMode {
    #[serde(alias = "chat")]
    Chat,
    #[serde(alias = "embedding")]
    Embedding,
    #[serde(alias = "rerank")]
    Rerank,
}

impl ModelMode {
    /// Get the string representation of the mode
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelMode::Chat => "Chat",
            ModelMode::Embedding => "Embedding",
            ModelMode::Rerank => "Rerank",
        }
    }

    /// Check that an OpenAI-style request path is served by this mode
    pub fn validate_path(&self, path: &str) -> std::result::Result<(), String> {
        let path = path.trim_start_matches('/');
        let is_chat = path.starts_with("v1/chat/completions");
        let is_completion = path.starts_with("v1/completions");
        let is_embedding = path.starts_with("v1/embeddings");
        let is_rerank = path.starts_with("v1/rerank");

        let rejected = match self {
            ModelMode::Chat => is_completion || is_embedding || is_rerank,
            ModelMode::Embedding => is_chat || is_completion || is_rerank,
            ModelMode::Rerank => !is_rerank,
        };

        if rejected {
            Err(format!(
                "model is in '{}' mode and does not serve '/{}'",
                self.as_str(),
                path
            ))
        } else {
            Ok(())
        }
    }
}

impl fmt::Display for ModelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ModelMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "chat" => Ok(ModelMode::Chat),
            "embedding" => Ok(ModelMode::Embedding),
            "rerank" => Ok(ModelMode::Rerank),
            _ => Err(format!("Unknown model mode: {}", s)),
        }
    }
}

/// One way of launching a model on a particular set of devices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareConfig {
    /// Name of this variant, used in logs and info responses
    pub name: String,

    /// Devices that must all be present
    pub required_devices: BTreeSet<String>,

    /// Memory needed per device in MB
    #[serde(default)]
    pub memory_mb: BTreeMap<String, u64>,

    /// Launch script
    pub script: PathBuf,
}

impl HardwareConfig {
    /// Memory requirement on a device, zero when only presence is required
    pub fn memory_for(&self, device: &str) -> u64 {
        self.memory_mb.get(device).copied().unwrap_or(0)
    }

    /// Devices as a comma separated list, in stable order
    pub fn device_list(&self) -> String {
        self.required_devices
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Static description of a model and the ways it can be launched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDefinition {
    /// User-facing names; the first one is the primary alias
    pub aliases: Vec<String>,

    /// API mode
    pub mode: ModelMode,

    /// Port the backend listens on
    pub port: u16,

    /// Start at daemon boot
    #[serde(default)]
    pub auto_start: bool,

    /// Working directory for the launch script, defaulting to the directory
    /// holding the configuration file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,

    /// Extra environment for the launch script
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Launch variants, tried in declared order
    pub hardware: Vec<HardwareConfig>,
}

impl ModelDefinition {
    /// Primary alias used as registry key
    pub fn primary_alias(&self) -> &str {
        self.aliases.first().map(String::as_str).unwrap_or_default()
    }

    /// Case-insensitive alias match
    pub fn answers_to(&self, alias: &str) -> bool {
        self.aliases.iter().any(|a| a.eq_ignore_ascii_case(alias))
    }
}

/// A compute device as reported by the inventory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device identifier, e.g. "rtx 4060" or "CPU"
    pub id: String,

    /// Whether the device is currently usable
    pub online: bool,

    /// Total memory in MB
    pub total_memory_mb: u64,

    /// Free memory in MB at the time of the report
    pub free_memory_mb: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_percentage: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature_celsius: Option<f64>,
}

impl DeviceInfo {
    /// Create an online device with the given capacity
    pub fn new(id: impl Into<String>, total_memory_mb: u64, free_memory_mb: u64) -> Self {
        Self {
            id: id.into(),
            online: true,
            total_memory_mb,
            free_memory_mb,
            device_type: None,
            memory_type: None,
            usage_percentage: None,
            temperature_celsius: None,
        }
    }

    /// Builder pattern for optional fields
    pub fn with_device_type(mut self, device_type: impl Into<String>) -> Self {
        self.device_type = Some(device_type.into());
        self
    }

    pub fn with_memory_type(mut self, memory_type: impl Into<String>) -> Self {
        self.memory_type = Some(memory_type.into());
        self
    }

    pub fn offline(mut self) -> Self {
        self.online = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("chat".parse::<ModelMode>().unwrap(), ModelMode::Chat);
        assert_eq!("Embedding".parse::<ModelMode>().unwrap(), ModelMode::Embedding);
        assert_eq!("RERANK".parse::<ModelMode>().unwrap(), ModelMode::Rerank);
        assert!("vision".parse::<ModelMode>().is_err());
    }

    #[test]
    fn test_mode_path_validation() {
        assert!(ModelMode::Chat.validate_path("/v1/chat/completions").is_ok());
        assert!(ModelMode::Chat.validate_path("/v1/completions").is_err());
        assert!(ModelMode::Chat.validate_path("/v1/embeddings").is_err());

        assert!(ModelMode::Embedding.validate_path("v1/embeddings").is_ok());
        assert!(ModelMode::Embedding.validate_path("/v1/chat/completions").is_err());

        assert!(ModelMode::Rerank.validate_path("/v1/rerank").is_ok());
        assert!(ModelMode::Rerank.validate_path("/v1/chat/completions").is_err());
    }

    #[test]
    fn test_hardware_memory_lookup() {
        let hw = HardwareConfig {
            name: "single".to_string(),
            required_devices: ["rtx 4060".to_string(), "CPU".to_string()].into(),
            memory_mb: [("rtx 4060".to_string(), 12000)].into(),
            script: PathBuf::from("start.sh"),
        };
        assert_eq!(hw.memory_for("rtx 4060"), 12000);
        assert_eq!(hw.memory_for("CPU"), 0);
        assert_eq!(hw.device_list(), "CPU,rtx 4060");
    }

    #[test]
    fn test_alias_matching_is_case_insensitive() {
        let def = ModelDefinition {
            aliases: vec!["Qwen-14B".to_string(), "qwen".to_string()],
            mode: ModelMode::Chat,
            port: 9001,
            auto_start: false,
            working_dir: None,
            env: BTreeMap::new(),
            hardware: Vec::new(),
        };
        assert_eq!(def.primary_alias(), "Qwen-14B");
        assert!(def.answers_to("qwen-14b"));
        assert!(def.answers_to("QWEN"));
        assert!(!def.answers_to("llama"));
    }
}
