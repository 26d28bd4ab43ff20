//! # llmhost-router
//!
//! OpenAI-compatible HTTP ingress for llmhost.
//!
//! This crate provides:
//! - `/v1/*` inference endpoints that resolve the `model` field, start the
//!   backend on demand and stream its response back
//! - Management endpoints to start, stop and inspect models
//! - Device, health and Prometheus metrics endpoints
//!
//! ## Example
//!
//! ```rust,no_run
//! use llmhost_router::{Router, RouterConfig};
//! use llmhost_scheduler::Supervisor;
//!
//! async fn serve(supervisor: Supervisor) -> Result<(), Box<dyn std::error::Error>> {
//!     let router = Router::new(RouterConfig::default(), supervisor)?;
//!     router.serve(async { let _ = tokio::signal::ctrl_c().await; }).await?;
//!     Ok(())
//! }
//! ```

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

pub mod config;
pub mod handler;
pub mod proxy;
pub mod router;
pub mod server;

// Re-export main types
pub use config::{RouterConfig, RouterConfigBuilder};
pub use handler::{ManagementResponse, RequestContext, RequestHandler};
pub use router::{Router, RouterStats};
pub use server::HttpServer;

/// Result type for router operations
pub type Result<T> = std::result::Result<T, RouterError>;

/// Errors that can occur during router operations
#[derive(Error, Debug)]
pub enum RouterError {
    /// Scheduling and request errors, carrying the alias they concern
    #[error(transparent)]
    Scheduler(#[from] llmhost_core::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RouterError {
    /// Convert to HTTP status code
    pub fn to_status_code(&self) -> u16 {
        match self {
            RouterError::Scheduler(e) => e.to_http_status(),
            RouterError::Configuration(_) => 500,
            RouterError::Server(_) => 500,
            RouterError::Io(_) => 500,
        }
    }

    /// Stable tag for the error body
    pub fn kind(&self) -> &'static str {
        match self {
            RouterError::Scheduler(e) => e.kind(),
            RouterError::Configuration(_) => "configuration",
            RouterError::Server(_) => "server",
            RouterError::Io(_) => "io",
        }
    }

    pub fn alias(&self) -> Option<&str> {
        match self {
            RouterError::Scheduler(e) => e.alias(),
            _ => None,
        }
    }
}

impl IntoResponse for RouterError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.to_status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = json!({
            "error": {
                "kind": self.kind(),
                "alias": self.alias(),
                "message": self.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use llmhost_core::Error;
    use std::time::Duration;

    #[test]
    fn test_router_error_status_codes() {
        assert_eq!(RouterError::Configuration("test".to_string()).to_status_code(), 500);
        assert_eq!(RouterError::from(Error::unknown_model("m")).to_status_code(), 404);
        assert_eq!(
            RouterError::from(Error::insufficient_resources("m", "no fit")).to_status_code(),
            503
        );
        assert_eq!(
            RouterError::from(Error::backend_unavailable("m", "refused")).to_status_code(),
            502
        );
        assert_eq!(
            RouterError::from(Error::upstream_timeout("m", Duration::from_secs(1))).to_status_code(),
            504
        );
    }

    #[tokio::test]
    async fn test_error_body_identifies_alias_and_kind() {
        let response = RouterError::from(Error::startup_failed("qwen", "exit code 1")).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"]["kind"], "startup_failed");
        assert_eq!(body["error"]["alias"], "qwen");
        assert!(body["error"]["message"].as_str().unwrap().contains("exit code 1"));
    }
}
