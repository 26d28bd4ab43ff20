//! Error handling for llmhost
//!
//! Provides the unified error type shared by the scheduler, the router and the
//! daemon. Scheduling failures always identify the alias they concern so that
//! callers can report them without extra bookkeeping.

use std::time::Duration;

/// Result type alias for llmhost operations
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for llmhost
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Alias is not present in the model catalog
    #[error("Unknown model: '{alias}'")]
    UnknownModel { alias: String },

    /// No hardware configuration of the model fits the current devices
    #[error("Insufficient resources for '{alias}': {reason}")]
    InsufficientResources { alias: String, reason: String },

    /// Launch script or readiness probe failed
    #[error("Startup failed for '{alias}': {reason}")]
    StartupFailed { alias: String, reason: String },

    /// A previously running backend stopped answering
    #[error("Backend unavailable for '{alias}': {reason}")]
    BackendUnavailable { alias: String, reason: String },

    /// Forwarding to the backend exceeded its bounded wait
    #[error("Upstream timeout for '{alias}' after {timeout:?}")]
    UpstreamTimeout { alias: String, timeout: Duration },

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    InvalidConfiguration(String),

    /// Invalid request or parameters
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Layered configuration errors
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create an unknown model error
    pub fn unknown_model(alias: impl Into<String>) -> Self {
        Self::UnknownModel { alias: alias.into() }
    }

    /// Create an insufficient resources error
    pub fn insufficient_resources(alias: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InsufficientResources {
            alias: alias.into(),
            reason: reason.into(),
        }
    }

    /// Create a startup failure error
    pub fn startup_failed(alias: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StartupFailed {
            alias: alias.into(),
            reason: reason.into(),
        }
    }

    /// Create a backend unavailable error
    pub fn backend_unavailable(alias: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            alias: alias.into(),
            reason: reason.into(),
        }
    }

    /// Create an upstream timeout error
    pub fn upstream_timeout(alias: impl Into<String>, timeout: Duration) -> Self {
        Self::UpstreamTimeout {
            alias: alias.into(),
            timeout,
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Alias the error refers to, if any
    pub fn alias(&self) -> Option<&str> {
        match self {
            Error::UnknownModel { alias }
            | Error::InsufficientResources { alias, .. }
            | Error::StartupFailed { alias, .. }
            | Error::BackendUnavailable { alias, .. }
            | Error::UpstreamTimeout { alias, .. } => Some(alias),
            _ => None,
        }
    }

    /// Stable error kind for structured responses and logging
    pub fn kind(&self) -> &'static str {
        match self {
            Error::UnknownModel { .. } => "unknown_model",
            Error::InsufficientResources { .. } => "insufficient_resources",
            Error::StartupFailed { .. } => "startup_failed",
            Error::BackendUnavailable { .. } => "backend_unavailable",
            Error::UpstreamTimeout { .. } => "upstream_timeout",
            Error::InvalidConfiguration(_) => "configuration",
            Error::InvalidRequest(_) => "invalid_request",
            Error::Internal(_) => "internal",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Yaml(_) => "yaml",
            Error::Config(_) => "config",
            Error::Other(_) => "other",
        }
    }

    /// Whether a caller may reasonably retry the same operation later.
    ///
    /// The scheduler itself never retries; this is advice for clients.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::InsufficientResources { .. }
                | Error::StartupFailed { .. }
                | Error::BackendUnavailable { .. }
                | Error::UpstreamTimeout { .. }
        )
    }

    /// Check if this error indicates a client-side problem
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::UnknownModel { .. } | Error::InvalidRequest(_) | Error::Json(_)
        )
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> u16 {
        match self {
            Error::UnknownModel { .. } => 404,
            Error::InvalidRequest(_) | Error::Json(_) => 400,
            Error::InsufficientResources { .. } | Error::StartupFailed { .. } => 503,
            Error::BackendUnavailable { .. } => 502,
            Error::UpstreamTimeout { .. } => 504,
            _ => 500,
        }
    }
}

/// Extension trait for adding context to Results
pub trait ErrorContext<T> {
    /// Add context to an error
    fn with_context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: Into<Error>,
{
    fn with_context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let original_error = e.into();
            Error::Other(anyhow::anyhow!("{}: {}", context.into(), original_error))
        })
    }
}
