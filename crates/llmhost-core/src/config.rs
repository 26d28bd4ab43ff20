//! Configuration management for llmhost
//!
//! Settings are layered with the `config` crate: built-in defaults, then the
//! YAML file, then `LLMHOST_` environment variables (`__` separates nesting,
//! e.g. `LLMHOST_SERVER__PORT=9000`). The model catalog is read from the
//! same file's `models` list with serde_yaml so device names and environment
//! keys keep their case.

use crate::catalog::ModelCatalog;
use crate::types::ModelDefinition;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Environment variable naming the configuration file
pub const CONFIG_PATH_ENV: &str = "LLMHOST_CONFIG";

/// Configuration file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "llmhost.yaml";

/// Complete node configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub scheduler: SchedulerSettings,

    #[serde(default)]
    pub devices: DevicesConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Model catalog
    #[serde(default)]
    pub models: Vec<ModelDefinition>,
}

/// Sections handled by the layered loader
#[derive(Debug, Default, Serialize, Deserialize)]
struct LayeredSettings {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    scheduler: SchedulerSettings,
    #[serde(default)]
    devices: DevicesConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Default, Deserialize)]
struct CatalogDocument {
    #[serde(default)]
    models: Vec<ModelDefinition>,
}

impl NodeConfig {
    /// Load configuration with precedence:
    /// 1. Environment variables (highest)
    /// 2. Configuration file (explicit path, `LLMHOST_CONFIG`, or `./llmhost.yaml`)
    /// 3. Defaults (lowest)
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from))
            .or_else(|| {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                default.exists().then_some(default)
            });

        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&LayeredSettings::default())?);

        let mut models = Vec::new();
        let mut base_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));

        if let Some(path) = &path {
            if !path.is_file() {
                return Err(Error::config(format!(
                    "configuration file not found: {}",
                    path.display()
                )));
            }

            builder = builder.add_source(config::File::new(
                &path.to_string_lossy(),
                config::FileFormat::Yaml,
            ));

            let text = std::fs::read_to_string(path)?;
            let document: CatalogDocument = serde_yaml::from_str(&text)?;
            models = document.models;

            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                base_dir = parent.to_path_buf();
            }
        }

        builder = builder.add_source(
            config::Environment::with_prefix("LLMHOST")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let settings: LayeredSettings = builder.build()?.try_deserialize()?;

        let mut config = Self {
            server: settings.server,
            scheduler: settings.scheduler,
            devices: settings.devices,
            logging: settings.logging,
            models,
        };
        config.resolve_paths(&base_dir);
        config.validate()?;

        Ok(config)
    }

    /// Parse a complete YAML document without environment layering
    pub fn from_yaml_str(yaml: &str, base_dir: &Path) -> Result<Self> {
        let mut config: Self = serde_yaml::from_str(yaml)?;
        config.resolve_paths(base_dir);
        config.validate()?;
        Ok(config)
    }

    /// Serialize to YAML
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Make relative script, working directory and plugin paths absolute.
    /// Models without a working directory run in `base_dir`.
    pub fn resolve_paths(&mut self, base_dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() && !p.as_os_str().is_empty() {
                *p = base_dir.join(&*p);
            }
        };

        for model in &mut self.models {
            match model.working_dir.as_mut() {
                Some(dir) => resolve(dir),
                None => model.working_dir = Some(base_dir.to_path_buf()),
            }
            for hw in &mut model.hardware {
                resolve(&mut hw.script);
            }
        }

        if let Some(dir) = self.devices.plugin_dir.as_mut() {
            resolve(dir);
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;
        self.scheduler.validate()?;
        self.devices.validate()?;
        self.logging.validate()?;

        ModelCatalog::validate_definitions(&self.models)?;

        if let Some(model) = self.models.iter().find(|m| m.port == self.server.port) {
            return Err(Error::config(format!(
                "model '{}' uses port {} which is the router's own port",
                model.primary_alias(),
                model.port
            )));
        }

        Ok(())
    }

    /// Build the immutable model catalog
    pub fn catalog(&self) -> Result<ModelCatalog> {
        ModelCatalog::new(self.models.clone())
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host address to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Backend read timeout
    pub request_timeout_seconds: u64,

    /// Backend connect timeout
    pub connect_timeout_seconds: u64,

    /// Maximum accepted request body
    pub max_request_bytes: usize,

    pub enable_cors: bool,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::config("server.host cannot be empty"));
        }
        if self.request_timeout_seconds == 0 {
            return Err(Error::config("server.request_timeout_seconds must be > 0"));
        }
        if self.connect_timeout_seconds == 0 {
            return Err(Error::config("server.connect_timeout_seconds must be > 0"));
        }
        if self.max_request_bytes == 0 {
            return Err(Error::config("server.max_request_bytes must be > 0"));
        }
        Ok(())
    }

    /// Socket address to bind
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| Error::config(format!("invalid bind address: {}", e)))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout_seconds: 600,
            connect_timeout_seconds: 30,
            max_request_bytes: 32 * 1024 * 1024,
            enable_cors: true,
        }
    }
}

/// Scheduler settings as they appear in the file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Minimum idle time before a model may be reaped, 0 disables reaping
    pub alive_time_minutes: u64,

    pub reaper_interval_seconds: u64,

    /// Bound on launch plus readiness
    pub startup_timeout_seconds: u64,

    /// SIGTERM to SIGKILL grace
    pub stop_grace_seconds: u64,

    /// Bound on stopping everything at daemon exit
    pub shutdown_timeout_seconds: u64,

    pub probe: ProbeSettings,

    pub idle: IdleSettings,

    /// Stop idle models to make room for a start that does not fit
    pub evict_idle_for_resources: bool,
}

impl SchedulerSettings {
    pub fn validate(&self) -> Result<()> {
        if self.reaper_interval_seconds == 0 {
            return Err(Error::config("scheduler.reaper_interval_seconds must be > 0"));
        }
        if self.startup_timeout_seconds == 0 {
            return Err(Error::config("scheduler.startup_timeout_seconds must be > 0"));
        }
        if self.shutdown_timeout_seconds == 0 {
            return Err(Error::config("scheduler.shutdown_timeout_seconds must be > 0"));
        }
        self.probe.validate()?;
        self.idle.validate()?;
        Ok(())
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            alive_time_minutes: 60,
            reaper_interval_seconds: 30,
            startup_timeout_seconds: 300,
            stop_grace_seconds: 15,
            shutdown_timeout_seconds: 60,
            probe: ProbeSettings::default(),
            idle: IdleSettings::default(),
            evict_idle_for_resources: false,
        }
    }
}

/// Readiness probe settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    /// HTTP path polled on the backend
    pub path: String,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_attempts: u32,
    pub request_timeout_ms: u64,
}

impl ProbeSettings {
    pub fn validate(&self) -> Result<()> {
        if !self.path.starts_with('/') {
            return Err(Error::config("scheduler.probe.path must start with '/'"));
        }
        if self.initial_backoff_ms == 0 || self.max_backoff_ms < self.initial_backoff_ms {
            return Err(Error::config(
                "scheduler.probe backoff must satisfy 0 < initial_backoff_ms <= max_backoff_ms",
            ));
        }
        if self.max_attempts == 0 {
            return Err(Error::config("scheduler.probe.max_attempts must be > 0"));
        }
        if self.request_timeout_ms == 0 {
            return Err(Error::config("scheduler.probe.request_timeout_ms must be > 0"));
        }
        Ok(())
    }
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            path: "/v1/models".to_string(),
            initial_backoff_ms: 250,
            max_backoff_ms: 5000,
            max_attempts: 120,
            request_timeout_ms: 3000,
        }
    }
}

/// Usage-weighted idle extension
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdleSettings {
    pub decay_half_life_seconds: u64,
    pub weight_factor: f64,
    pub max_extension_ratio: f64,
}

impl IdleSettings {
    pub fn validate(&self) -> Result<()> {
        if self.decay_half_life_seconds == 0 {
            return Err(Error::config("scheduler.idle.decay_half_life_seconds must be > 0"));
        }
        if !(self.weight_factor >= 0.0) || !(self.max_extension_ratio >= 0.0) {
            return Err(Error::config(
                "scheduler.idle weight_factor and max_extension_ratio must be >= 0",
            ));
        }
        Ok(())
    }
}

impl Default for IdleSettings {
    fn default() -> Self {
        Self {
            decay_half_life_seconds: 300,
            weight_factor: 0.05,
            max_extension_ratio: 0.5,
        }
    }
}

/// Device inventory configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicesConfig {
    /// Directory of device plugin executables
    pub plugin_dir: Option<PathBuf>,

    pub plugin_timeout_seconds: u64,

    /// Skip memory accounting and treat every configured device as present
    pub disable_monitoring: bool,

    /// Fixed device list
    #[serde(rename = "static")]
    pub static_devices: Vec<StaticDevice>,
}

impl DevicesConfig {
    pub fn validate(&self) -> Result<()> {
        if self.plugin_timeout_seconds == 0 {
            return Err(Error::config("devices.plugin_timeout_seconds must be > 0"));
        }
        for device in &self.static_devices {
            if device.id.trim().is_empty() {
                return Err(Error::config("devices.static entries need a non-empty id"));
            }
            if device.free_memory_mb.unwrap_or(0) > device.total_memory_mb {
                return Err(Error::config(format!(
                    "device '{}' reports more free than total memory",
                    device.id
                )));
            }
        }
        Ok(())
    }
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            plugin_dir: None,
            plugin_timeout_seconds: 10,
            disable_monitoring: false,
            static_devices: Vec::new(),
        }
    }
}

/// Entry of the static device list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticDevice {
    pub id: String,
    pub total_memory_mb: u64,
    /// Defaults to the total
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free_memory_mb: Option<u64>,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,

    pub show_target: bool,
    pub show_thread_ids: bool,
    pub show_line_numbers: bool,
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<()> {
        match self.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => return Err(Error::config(format!("unknown log level '{}'", other))),
        }
        match self.format.as_str() {
            "text" | "json" => Ok(()),
            other => Err(Error::config(format!("unknown log format '{}'", other))),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            show_target: true,
            show_thread_ids: false,
            show_line_numbers: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
server:
  port: 9090
scheduler:
  alive_time_minutes: 5
devices:
  static:
    - id: "rtx 4060"
      total_memory_mb: 16000
models:
  - aliases: ["Qwen-14B", "qwen"]
    mode: Chat
    port: 9001
    env:
      CUDA_VISIBLE_DEVICES: "0"
    hardware:
      - name: single-gpu
        required_devices: ["rtx 4060"]
        memory_mb:
          "rtx 4060": 12000
        script: scripts/qwen.sh
"#;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.scheduler.alive_time_minutes, 60);
        assert_eq!(config.scheduler.probe.path, "/v1/models");
    }

    #[test]
    fn test_load_from_file_resolves_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("llmhost.yaml");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(SAMPLE.as_bytes())
            .unwrap();

        let config = NodeConfig::load(Some(&path)).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.scheduler.alive_time_minutes, 5);
        // untouched defaults survive the file layer
        assert_eq!(config.scheduler.reaper_interval_seconds, 30);
        assert_eq!(config.devices.static_devices.len(), 1);

        let model = &config.models[0];
        assert_eq!(model.hardware[0].script, dir.path().join("scripts/qwen.sh"));
        assert_eq!(model.working_dir.as_deref(), Some(dir.path()));
        assert_eq!(model.hardware[0].memory_for("rtx 4060"), 12000);
        assert_eq!(model.env.get("CUDA_VISIBLE_DEVICES").map(String::as_str), Some("0"));
    }

    #[test]
    fn test_working_dir_defaults_to_config_dir() {
        let config = NodeConfig::from_yaml_str(SAMPLE, Path::new("/etc/llm host")).unwrap();
        assert_eq!(
            config.models[0].working_dir,
            Some(PathBuf::from("/etc/llm host"))
        );

        let yaml = SAMPLE.replace("    port: 9001\n", "    port: 9001\n    working_dir: run\n");
        let config = NodeConfig::from_yaml_str(&yaml, Path::new("/etc/llm host")).unwrap();
        assert_eq!(
            config.models[0].working_dir,
            Some(PathBuf::from("/etc/llm host/run"))
        );
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = NodeConfig::load(Some(&dir.path().join("absent.yaml")));
        assert!(matches!(result, Err(Error::InvalidConfiguration(_))));
    }

    #[test]
    fn test_model_port_clashing_with_router() {
        let yaml = SAMPLE.replace("port: 9001", "port: 9090");
        let result = NodeConfig::from_yaml_str(&yaml, Path::new("/srv"));
        assert!(result.is_err());
    }

    #[test]
    fn test_logging_validation() {
        let mut logging = LoggingConfig::default();
        assert!(logging.validate().is_ok());

        logging.format = "xml".to_string();
        assert!(logging.validate().is_err());

        logging.format = "json".to_string();
        logging.level = "verbose".to_string();
        assert!(logging.validate().is_err());
    }

    #[test]
    fn test_probe_validation() {
        let mut probe = ProbeSettings::default();
        probe.max_backoff_ms = 10;
        assert!(probe.validate().is_err());

        let mut probe = ProbeSettings::default();
        probe.path = "v1/models".to_string();
        assert!(probe.validate().is_err());
    }

    #[test]
    fn test_yaml_roundtrip_keeps_catalog() {
        let config = NodeConfig::from_yaml_str(SAMPLE, Path::new("/srv")).unwrap();
        let yaml = config.to_yaml().unwrap();
        let reparsed = NodeConfig::from_yaml_str(&yaml, Path::new("/other")).unwrap();
        assert_eq!(config, reparsed);
    }
}
