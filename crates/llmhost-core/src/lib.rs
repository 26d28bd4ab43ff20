//! # llmhost-core
//!
//! Core types, traits, and utilities for llmhost, a single-node scheduler that
//! starts model servers on demand and routes OpenAI-compatible traffic to them.
//!
//! This crate provides the pieces shared by every other component:
//!
//! - Model catalog and hardware configuration types
//! - Backend lifecycle states
//! - The device inventory trait
//! - Configuration schema and layered loading
//! - Error handling types and utilities

pub mod catalog;
pub mod config;
pub mod error;
pub mod state;
pub mod traits;
pub mod types;

// Re-export commonly used types at the crate root
pub use catalog::ModelCatalog;
pub use config::{
    DevicesConfig, IdleSettings, LoggingConfig, NodeConfig, ProbeSettings, SchedulerSettings,
    ServerConfig, StaticDevice,
};
pub use error::{Error, ErrorContext, Result};
pub use state::LifecycleState;
pub use traits::DeviceInventory;
pub use types::{DeviceInfo, HardwareConfig, ModelDefinition, ModelMode};
