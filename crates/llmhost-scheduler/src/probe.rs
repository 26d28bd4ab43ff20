//! Readiness probing of freshly launched backends

use crate::config::ProbeConfig;
use crate::process::BackendProcess;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Empty;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use llmhost_core::{Error, Result};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Checks whether a backend accepts requests on its port
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn check(&self, port: u16) -> std::result::Result<(), String>;
}

/// `GET http://127.0.0.1:<port><path>` answering with a success status
#[derive(Clone)]
pub struct HttpProbe {
    client: Client<HttpConnector, Empty<Bytes>>,
    path: String,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(config: &ProbeConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(config.request_timeout));

        Self {
            client: Client::builder(TokioExecutor::new()).build(connector),
            path: config.path.clone(),
            timeout: config.request_timeout,
        }
    }
}

#[async_trait]
impl ReadinessProbe for HttpProbe {
    async fn check(&self, port: u16) -> std::result::Result<(), String> {
        let uri: hyper::Uri = format!("http://127.0.0.1:{}{}", port, self.path)
            .parse()
            .map_err(|e| format!("invalid probe URL: {}", e))?;

        let request = hyper::Request::get(uri)
            .body(Empty::new())
            .map_err(|e| format!("failed to build probe request: {}", e))?;

        match tokio::time::timeout(self.timeout, self.client.request(request)).await {
            Ok(Ok(response)) if response.status().is_success() => Ok(()),
            Ok(Ok(response)) => Err(format!("probe answered {}", response.status())),
            Ok(Err(e)) => Err(format!("probe request failed: {}", e)),
            Err(_) => Err("probe request timed out".to_string()),
        }
    }
}

/// Poll until the backend answers, the process exits, the attempts or the
/// startup timeout run out, or `cancel` fires.
pub async fn wait_until_ready(
    alias: &str,
    port: u16,
    process: &dyn BackendProcess,
    probe: &dyn ReadinessProbe,
    config: &ProbeConfig,
    startup_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let started = Instant::now();
    let deadline = started + startup_timeout;
    let mut last_error = String::from("no probe attempted");

    for attempt in 1..=config.max_attempts {
        if let Some(exit) = process.try_exit() {
            return Err(Error::startup_failed(
                alias,
                format!("launch script ended with {} before becoming ready", exit),
            ));
        }

        let check = tokio::time::timeout_at(deadline, probe.check(port));
        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::startup_failed(alias, "startup cancelled by shutdown"));
            }
            outcome = check => outcome,
        };

        match outcome {
            Ok(Ok(())) => {
                info!(
                    alias = %alias,
                    port,
                    attempts = attempt,
                    elapsed = ?started.elapsed(),
                    "Backend is ready"
                );
                return Ok(());
            }
            Ok(Err(e)) => {
                debug!(alias = %alias, attempt, "Readiness probe failed: {}", e);
                last_error = e;
            }
            Err(_) => break,
        }

        if attempt == config.max_attempts {
            return Err(Error::startup_failed(
                alias,
                format!(
                    "not ready after {} probe attempts (last error: {})",
                    attempt, last_error
                ),
            ));
        }

        let pause = tokio::time::sleep_until((Instant::now() + config.backoff_for(attempt)).min(deadline));
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::startup_failed(alias, "startup cancelled by shutdown"));
            }
            exit = process.wait() => {
                return Err(Error::startup_failed(
                    alias,
                    format!("launch script ended with {} before becoming ready", exit),
                ));
            }
            _ = pause => {}
        }

        if Instant::now() >= deadline {
            break;
        }
    }

    Err(Error::startup_failed(
        alias,
        format!(
            "not ready within {:?} (last error: {})",
            startup_timeout, last_error
        ),
    ))
}
