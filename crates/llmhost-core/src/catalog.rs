//! Immutable model catalog with case-insensitive alias resolution

use crate::types::ModelDefinition;
use crate::{Error, Result};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Read-only set of model definitions, loaded once at startup
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    models: Vec<Arc<ModelDefinition>>,
    by_alias: HashMap<String, usize>,
}

impl ModelCatalog {
    /// Validate and index the definitions
    pub fn new(models: Vec<ModelDefinition>) -> Result<Self> {
        Self::validate_definitions(&models)?;

        let models: Vec<Arc<ModelDefinition>> = models.into_iter().map(Arc::new).collect();
        let mut by_alias = HashMap::new();
        for (index, model) in models.iter().enumerate() {
            for alias in &model.aliases {
                by_alias.insert(alias.to_lowercase(), index);
            }
        }

        Ok(Self { models, by_alias })
    }

    /// Check catalog-wide rules without building the index
    pub fn validate_definitions(models: &[ModelDefinition]) -> Result<()> {
        let mut aliases = HashSet::new();
        let mut ports = HashMap::new();

        for model in models {
            if model.aliases.is_empty() {
                return Err(Error::config("every model needs at least one alias"));
            }
            let primary = model.primary_alias();

            for alias in &model.aliases {
                if alias.trim().is_empty() {
                    return Err(Error::config(format!("model '{}' has an empty alias", primary)));
                }
                if !aliases.insert(alias.to_lowercase()) {
                    return Err(Error::config(format!("duplicate model alias '{}'", alias)));
                }
            }

            if model.port == 0 {
                return Err(Error::config(format!("model '{}' needs a non-zero port", primary)));
            }
            if let Some(other) = ports.insert(model.port, primary.to_string()) {
                return Err(Error::config(format!(
                    "models '{}' and '{}' share port {}",
                    other, primary, model.port
                )));
            }

            if model.hardware.is_empty() {
                return Err(Error::config(format!(
                    "model '{}' has no hardware configurations",
                    primary
                )));
            }

            for hw in &model.hardware {
                if hw.required_devices.is_empty() {
                    return Err(Error::config(format!(
                        "hardware config '{}' of '{}' requires no devices",
                        hw.name, primary
                    )));
                }
                if let Some(device) = hw
                    .memory_mb
                    .keys()
                    .find(|d| !hw.required_devices.contains(*d))
                {
                    return Err(Error::config(format!(
                        "hardware config '{}' of '{}' reserves memory on '{}' which is not a required device",
                        hw.name, primary, device
                    )));
                }
                if hw.script.as_os_str().is_empty() {
                    return Err(Error::config(format!(
                        "hardware config '{}' of '{}' has no script",
                        hw.name, primary
                    )));
                }
            }
        }

        Ok(())
    }

    /// Resolve an alias, ignoring case
    pub fn resolve(&self, alias: &str) -> Result<Arc<ModelDefinition>> {
        self.by_alias
            .get(&alias.to_lowercase())
            .map(|&i| Arc::clone(&self.models[i]))
            .ok_or_else(|| Error::unknown_model(alias))
    }

    /// All definitions in declared order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ModelDefinition>> {
        self.models.iter()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Every device named by any hardware configuration
    pub fn referenced_devices(&self) -> BTreeSet<String> {
        self.models
            .iter()
            .flat_map(|m| m.hardware.iter())
            .flat_map(|hw| hw.required_devices.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HardwareConfig, ModelMode};
    use std::path::PathBuf;

    fn model(aliases: &[&str], port: u16) -> ModelDefinition {
        ModelDefinition {
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
            mode: ModelMode::Chat,
            port,
            auto_start: false,
            working_dir: None,
            env: Default::default(),
            hardware: vec![HardwareConfig {
                name: "gpu".to_string(),
                required_devices: ["gpu0".to_string()].into(),
                memory_mb: [("gpu0".to_string(), 1000)].into(),
                script: PathBuf::from("/opt/start.sh"),
            }],
        }
    }

    #[test]
    fn test_resolve_any_alias_any_case() {
        let catalog = ModelCatalog::new(vec![
            model(&["Qwen-14B", "qwen"], 9001),
            model(&["bge-m3"], 9002),
        ])
        .unwrap();

        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.resolve("QWEN").unwrap().primary_alias(), "Qwen-14B");
        assert_eq!(catalog.resolve("qwen-14b").unwrap().port, 9001);
        assert!(matches!(
            catalog.resolve("llama"),
            Err(Error::UnknownModel { alias }) if alias == "llama"
        ));
    }

    #[test]
    fn test_duplicate_alias_rejected() {
        let result = ModelCatalog::new(vec![model(&["qwen"], 9001), model(&["QWEN"], 9002)]);
        assert!(result.is_err());
    }

    #[test]
    fn test_duplicate_port_rejected() {
        let result = ModelCatalog::new(vec![model(&["a"], 9001), model(&["b"], 9001)]);
        assert!(result.is_err());
    }

    #[test]
    fn test_memory_on_unlisted_device_rejected() {
        let mut m = model(&["a"], 9001);
        m.hardware[0].memory_mb.insert("gpu1".to_string(), 10);
        assert!(ModelCatalog::new(vec![m]).is_err());
    }

    #[test]
    fn test_model_without_hardware_rejected() {
        let mut m = model(&["a"], 9001);
        m.hardware.clear();
        assert!(ModelCatalog::new(vec![m]).is_err());
    }

    #[test]
    fn test_referenced_devices() {
        let mut m = model(&["a"], 9001);
        m.hardware[0].required_devices.insert("CPU".to_string());
        let catalog = ModelCatalog::new(vec![m, model(&["b"], 9002)]).unwrap();
        let devices: Vec<_> = catalog.referenced_devices().into_iter().collect();
        assert_eq!(devices, vec!["CPU".to_string(), "gpu0".to_string()]);
    }
}
