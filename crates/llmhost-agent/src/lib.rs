//! # llmhost-agent
//!
//! The `llmhostd` daemon.
//!
//! This crate wires the pieces of a node together: it loads the
//! configuration, builds the device inventory, allocator and supervisor,
//! runs the idle reaper, serves the HTTP router and shuts everything down
//! when the process is asked to exit.

pub mod agent;
pub mod config;

// Re-export commonly used types
pub use agent::{shutdown_signal, Agent, AgentBuilder};
pub use config::{default_config, load_config, ConfigOverrides};

// Error handling
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Service error: {0}")]
    Service(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Core error: {0}")]
    Core(#[from] llmhost_core::Error),

    #[error("Router error: {0}")]
    Router(#[from] llmhost_router::RouterError),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;

/// Initialize logging and tracing
///
/// `RUST_LOG` wins over the configured level when it is set.
pub fn init_logging(logging_config: &llmhost_core::LoggingConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging_config.level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(logging_config.show_target)
        .with_thread_ids(logging_config.show_thread_ids)
        .with_line_number(logging_config.show_line_numbers);

    let installed = match logging_config.format.as_str() {
        "json" => subscriber.json().try_init(),
        _ => subscriber.try_init(),
    };

    installed.map_err(|e| AgentError::Config(format!("failed to install logger: {}", e)))
}
