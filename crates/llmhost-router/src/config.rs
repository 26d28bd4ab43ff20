//! Router configuration

use llmhost_core::ServerConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Bind address for the HTTP server
    pub bind_address: String,

    /// HTTP server listen port
    pub http_port: u16,

    /// Time allowed for a backend to start answering a forwarded request
    pub request_timeout: Duration,

    /// Connection timeout for backends
    pub connect_timeout: Duration,

    /// Maximum request body size in bytes
    pub max_request_size: usize,

    /// Enable CORS
    pub enable_cors: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

impl From<&ServerConfig> for RouterConfig {
    fn from(server: &ServerConfig) -> Self {
        Self {
            bind_address: server.host.clone(),
            http_port: server.port,
            request_timeout: Duration::from_secs(server.request_timeout_seconds),
            connect_timeout: Duration::from_secs(server.connect_timeout_seconds),
            max_request_size: server.max_request_bytes,
            enable_cors: server.enable_cors,
        }
    }
}

impl RouterConfig {
    /// `host:port` to listen on
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.http_port)
    }
}

/// Builder for RouterConfig
pub struct RouterConfigBuilder {
    config: RouterConfig,
}

impl RouterConfigBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            config: RouterConfig::default(),
        }
    }

    /// Set HTTP port
    pub fn http_port(mut self, port: u16) -> Self {
        self.config.http_port = port;
        self
    }

    /// Set bind address
    pub fn bind_address(mut self, address: impl Into<String>) -> Self {
        self.config.bind_address = address.into();
        self
    }

    /// Set request timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Set connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set maximum request body size
    pub fn max_request_size(mut self, bytes: usize) -> Self {
        self.config.max_request_size = bytes;
        self
    }

    /// Enable or disable CORS
    pub fn enable_cors(mut self, enabled: bool) -> Self {
        self.config.enable_cors = enabled;
        self
    }

    /// Build the configuration
    pub fn build(self) -> RouterConfig {
        self.config
    }
}

impl Default for RouterConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate router configuration
pub fn validate_config(config: &RouterConfig) -> Result<(), String> {
    if config.bind_address.is_empty() {
        return Err("Bind address cannot be empty".to_string());
    }

    if config.request_timeout.is_zero() {
        return Err("Request timeout must be greater than 0".to_string());
    }

    if config.connect_timeout.is_zero() {
        return Err("Connect timeout must be greater than 0".to_string());
    }

    if config.max_request_size == 0 {
        return Err("Max request size must be greater than 0".to_string());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RouterConfig::default();
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.bind_address, "0.0.0.0");
        assert_eq!(config.request_timeout, Duration::from_secs(600));
        assert!(config.enable_cors);
        assert_eq!(config.bind_addr(), "0.0.0.0:8080");
    }

    #[test]
    fn test_config_builder() {
        let config = RouterConfigBuilder::new()
            .http_port(3000)
            .bind_address("127.0.0.1")
            .request_timeout(Duration::from_secs(5))
            .enable_cors(false)
            .build();

        assert_eq!(config.http_port, 3000);
        assert_eq!(config.bind_address, "127.0.0.1");
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert!(!config.enable_cors);
    }

    #[test]
    fn test_config_validation() {
        let mut config = RouterConfig::default();
        assert!(validate_config(&config).is_ok());

        config.request_timeout = Duration::ZERO;
        assert!(validate_config(&config).is_err());

        config.request_timeout = Duration::from_secs(1);
        config.max_request_size = 0;
        assert!(validate_config(&config).is_err());
    }
}
