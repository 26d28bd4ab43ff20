//! Request handling: model resolution, readiness and management operations

use crate::config::RouterConfig;
use crate::proxy::{stream_response, ForwardGuard, HttpProxy, UpstreamError, REQUEST_ID_HEADER};
use crate::router::RouterStats;
use crate::Result;

use axum::body::Body;
use bytes::Bytes;
use hyper::header::HeaderMap;
use hyper::{Method, Response, Uri};
use llmhost_core::{Error, LifecycleState};
use llmhost_scheduler::{AllocationSnapshot, ModelInfo, Supervisor};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long a failed forward waits for the backend process to exit before
/// treating the failure as a dropped connection
const EXIT_SETTLE_TIME: Duration = Duration::from_millis(500);

/// Request context for tracking and tracing
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Unique request ID, taken from `x-request-id` when the client sent one
    pub request_id: String,

    /// Request timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl RequestContext {
    /// Create a new request context
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now(),
        }
    }

    /// Context reusing the client's request ID when present
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut context = Self::new();
        if let Some(id) = headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
        {
            context.request_id = id.to_string();
        }
        context
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Only the field routing needs; the rest of the body passes through untouched
#[derive(Deserialize)]
struct ModelSelector {
    model: Option<String>,
}

/// Extract the `model` field of an OpenAI-style request body
pub fn requested_model(body: &[u8]) -> std::result::Result<String, Error> {
    let selector: ModelSelector = serde_json::from_slice(body).map_err(|e| {
        Error::invalid_request(format!(
            "request body must be a JSON object with a string 'model' field: {}",
            e
        ))
    })?;

    selector
        .model
        .filter(|m| !m.trim().is_empty())
        .ok_or_else(|| Error::invalid_request("missing 'model' field"))
}

/// Body of management responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagementResponse {
    pub success: bool,
    pub alias: Option<String>,
    pub state: Option<LifecycleState>,
    pub message: String,
}

/// Handles inference forwarding and management calls over the supervisor
pub struct RequestHandler {
    supervisor: Supervisor,
    proxy: HttpProxy,
    stats: Arc<RouterStats>,
}

impl RequestHandler {
    /// Create a new request handler
    pub fn new(config: &RouterConfig, supervisor: Supervisor, stats: Arc<RouterStats>) -> Self {
        Self {
            proxy: HttpProxy::new(config),
            supervisor,
            stats,
        }
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Resolve the model named in the body, make sure it runs and stream the
    /// backend's response back
    pub async fn handle_inference(
        &self,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<Response<Body>> {
        let context = RequestContext::from_headers(&headers);
        let alias = requested_model(&body)?;
        let definition = self.supervisor.catalog().resolve(&alias)?;
        let primary = definition.primary_alias().to_string();

        definition
            .mode
            .validate_path(uri.path())
            .map_err(|reason| Error::invalid_request(format!("model '{}': {}", alias, reason)))?;

        debug!(
            request_id = %context.request_id,
            alias = %primary,
            path = %uri.path(),
            "Routing inference request"
        );

        let guard = self.supervisor.acquire(&primary).await?;
        let instance = Arc::clone(guard.instance());

        match self
            .proxy
            .forward(&context, instance.port(), method, &uri, &headers, body)
            .await
        {
            Ok(response) => {
                debug!(
                    request_id = %context.request_id,
                    alias = %primary,
                    status = %response.status(),
                    "Backend responded"
                );
                let guard = ForwardGuard::new(guard, Arc::clone(&self.stats));
                Ok(stream_response(response, guard, &context.request_id))
            }
            Err(UpstreamError::Timeout(limit)) => {
                warn!(request_id = %context.request_id, alias = %primary, "Backend timed out");
                Err(Error::upstream_timeout(primary, limit).into())
            }
            Err(UpstreamError::Invalid(reason)) => Err(Error::invalid_request(reason).into()),
            Err(e) => {
                let reason = e.to_string();
                drop(guard);
                // a broken connection to a live process is not a crash
                let crashed = match e {
                    UpstreamError::Connect(_) => true,
                    _ => timeout(EXIT_SETTLE_TIME, instance.process().wait())
                        .await
                        .is_ok(),
                };
                if crashed {
                    self.supervisor
                        .report_backend_failure(&primary, instance.id(), &reason);
                }
                Err(Error::backend_unavailable(primary, reason).into())
            }
        }
    }

    /// Start a model; a no-op when it already runs
    pub async fn start_model(&self, alias: &str) -> Result<ManagementResponse> {
        let instance = self.supervisor.ensure_running(alias).await?;
        info!(alias = %instance.alias(), "Model started on request");
        Ok(ManagementResponse {
            success: true,
            alias: Some(instance.alias().to_string()),
            state: Some(LifecycleState::Running),
            message: format!("model is running on port {}", instance.port()),
        })
    }

    /// Stop a model; a no-op when it is already stopped
    pub async fn stop_model(&self, alias: &str) -> Result<ManagementResponse> {
        let definition = self.supervisor.catalog().resolve(alias)?;
        let primary = definition.primary_alias();
        let was = self.supervisor.state(primary)?;
        self.supervisor.stop(primary).await?;

        let message = if was == LifecycleState::Stopped {
            "model was not running".to_string()
        } else {
            "model stopped".to_string()
        };
        Ok(ManagementResponse {
            success: true,
            alias: Some(primary.to_string()),
            state: Some(self.supervisor.state(primary)?),
            message,
        })
    }

    pub async fn stop_all(&self) -> ManagementResponse {
        let stopped = self.supervisor.stop_all().await;
        ManagementResponse {
            success: true,
            alias: None,
            state: None,
            message: if stopped.is_empty() {
                "no models were running".to_string()
            } else {
                format!("stopped {}", stopped.join(", "))
            },
        }
    }

    pub fn model_info(&self, alias: &str) -> Result<ModelInfo> {
        Ok(self.supervisor.info(alias)?)
    }

    /// OpenAI-style model list with lifecycle state
    pub fn list_models(&self) -> Value {
        let data: Vec<Value> = self
            .supervisor
            .list()
            .into_iter()
            .map(|info| {
                json!({
                    "id": info.alias,
                    "object": "model",
                    "owned_by": "llmhost",
                    "aliases": info.aliases,
                    "mode": info.mode,
                    "state": info.state,
                })
            })
            .collect();

        json!({ "object": "list", "data": data })
    }

    pub async fn devices(&self) -> Result<AllocationSnapshot> {
        Ok(self.supervisor.allocator().snapshot().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    #[test]
    fn test_requested_model() {
        assert_eq!(
            requested_model(br#"{"model": "qwen-14b", "messages": []}"#).unwrap(),
            "qwen-14b"
        );

        for body in [
            &br#"{"messages": []}"#[..],
            br#"{"model": ""}"#,
            br#"{"model": 7}"#,
            b"not json",
        ] {
            let err = requested_model(body).unwrap_err();
            assert!(matches!(err, Error::InvalidRequest(_)));
        }
    }

    #[test]
    fn test_request_context_reuses_client_id() {
        let mut headers = HeaderMap::new();
        assert_ne!(RequestContext::from_headers(&headers).request_id, "");

        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("abc-123"));
        assert_eq!(RequestContext::from_headers(&headers).request_id, "abc-123");
    }
}
