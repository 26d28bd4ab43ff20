//! HTTP server implementation

use crate::config::RouterConfig;
use crate::handler::RequestHandler;
use crate::router::RouterStats;
use crate::{Result, RouterError};

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router as AxumRouter,
};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

/// HTTP server for the OpenAI-compatible and management APIs
#[derive(Clone)]
pub struct HttpServer {
    config: RouterConfig,
    handler: Arc<RequestHandler>,
    stats: Arc<RouterStats>,
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    handler: Arc<RequestHandler>,
    stats: Arc<RouterStats>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(config: RouterConfig, handler: Arc<RequestHandler>, stats: Arc<RouterStats>) -> Self {
        Self {
            config,
            handler,
            stats,
        }
    }

    /// Serve HTTP requests until `shutdown` resolves
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        info!("Starting HTTP server on {}", addr);

        if let Err(e) = axum::serve(listener, self.app())
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!("HTTP server error: {}", e);
            return Err(RouterError::Server(format!("HTTP server failed: {}", e)));
        }

        info!("HTTP server stopped");
        Ok(())
    }

    /// Create the Axum router with all routes
    pub fn app(&self) -> AxumRouter {
        let state = AppState {
            handler: self.handler.clone(),
            stats: self.stats.clone(),
        };

        let mut router = AxumRouter::new()
            // Inference endpoints; other POST /v1/* paths reach the fallback
            .route("/v1/chat/completions", post(inference_handler))
            .route("/v1/completions", post(inference_handler))
            .route("/v1/embeddings", post(inference_handler))
            .route("/v1/rerank", post(inference_handler))
            .route("/v1/models", get(list_models))

            // Model management
            .route("/api/models/stop-all", post(stop_all_models))
            .route("/api/models/:alias/start", post(start_model))
            .route("/api/models/:alias/stop", post(stop_model))
            .route("/api/models/:alias/info", get(model_info))

            // Node status
            .route("/api/health", get(health_check))
            .route("/api/devices/info", get(devices_info))
            .route("/metrics", get(metrics_handler))

            .fallback(fallback_handler)
            .with_state(state);

        let service = ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(DefaultBodyLimit::max(self.config.max_request_size));

        router = router.layer(service);

        // Add CORS if enabled
        if self.config.enable_cors {
            router = router.layer(CorsLayer::permissive());
        }

        router
    }
}

fn respond<T: IntoResponse>(stats: &RouterStats, result: Result<T>) -> Response {
    match result {
        Ok(response) => {
            stats.increment_responses();
            response.into_response()
        }
        Err(e) => {
            stats.increment_errors();
            e.into_response()
        }
    }
}

/// Forward an inference request to its model's backend
async fn inference_handler(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.stats.increment_proxied_requests();

    let result = state
        .handler
        .handle_inference(method, uri, headers, body)
        .await;
    if let Err(e) = &result {
        info!(kind = e.kind(), alias = ?e.alias(), "Inference request failed: {}", e);
    }
    respond(&state.stats, result)
}

/// POST /v1/* paths without a dedicated route are forwarded too
async fn fallback_handler(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if method == Method::POST && uri.path().starts_with("/v1/") {
        return inference_handler(State(state), method, uri, headers, body).await;
    }

    state.stats.increment_requests();
    state.stats.increment_errors();
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": {
                "kind": "not_found",
                "alias": null,
                "message": format!("no route for {} {}", method, uri.path()),
            }
        })),
    )
        .into_response()
}

/// List models with their lifecycle state
async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    state.stats.increment_management_requests();
    state.stats.increment_responses();
    Json(state.handler.list_models())
}

async fn start_model(State(state): State<AppState>, Path(alias): Path<String>) -> Response {
    state.stats.increment_management_requests();
    let result = state.handler.start_model(&alias).await.map(Json);
    respond(&state.stats, result)
}

async fn stop_model(State(state): State<AppState>, Path(alias): Path<String>) -> Response {
    state.stats.increment_management_requests();
    let result = state.handler.stop_model(&alias).await.map(Json);
    respond(&state.stats, result)
}

async fn stop_all_models(State(state): State<AppState>) -> impl IntoResponse {
    state.stats.increment_management_requests();
    state.stats.increment_responses();
    Json(state.handler.stop_all().await)
}

async fn model_info(State(state): State<AppState>, Path(alias): Path<String>) -> Response {
    state.stats.increment_management_requests();
    let result = state.handler.model_info(&alias).map(Json);
    respond(&state.stats, result)
}

async fn devices_info(State(state): State<AppState>) -> Response {
    state.stats.increment_management_requests();
    let result = state.handler.devices().await.map(Json);
    respond(&state.stats, result)
}

/// Liveness only; never touches a backend
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    state.stats.increment_requests();
    state.stats.increment_responses();

    let scheduler = state.handler.supervisor().stats();
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.stats.uptime_seconds(),
        "models": {
            "configured": state.handler.supervisor().catalog().len(),
            "running": scheduler.running,
            "starting": scheduler.starting,
        },
    }))
}

/// Metrics endpoint (Prometheus format)
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.stats.increment_requests();

    let scheduler = state.handler.supervisor().stats();
    let metrics = format!(
        "# HELP llmhost_router_requests_total Total number of requests\n\
         # TYPE llmhost_router_requests_total counter\n\
         llmhost_router_requests_total {}\n\
         # HELP llmhost_router_responses_total Total number of successful responses\n\
         # TYPE llmhost_router_responses_total counter\n\
         llmhost_router_responses_total {}\n\
         # HELP llmhost_router_errors_total Total number of error responses\n\
         # TYPE llmhost_router_errors_total counter\n\
         llmhost_router_errors_total {}\n\
         # HELP llmhost_router_proxied_requests_total Inference requests received\n\
         # TYPE llmhost_router_proxied_requests_total counter\n\
         llmhost_router_proxied_requests_total {}\n\
         # HELP llmhost_router_active_forwards Responses currently streaming from backends\n\
         # TYPE llmhost_router_active_forwards gauge\n\
         llmhost_router_active_forwards {}\n\
         # HELP llmhost_scheduler_cold_starts_total Backends launched to Running\n\
         # TYPE llmhost_scheduler_cold_starts_total counter\n\
         llmhost_scheduler_cold_starts_total {}\n\
         # HELP llmhost_scheduler_failed_starts_total Launches that failed\n\
         # TYPE llmhost_scheduler_failed_starts_total counter\n\
         llmhost_scheduler_failed_starts_total {}\n\
         # HELP llmhost_scheduler_idle_stops_total Backends stopped for idleness\n\
         # TYPE llmhost_scheduler_idle_stops_total counter\n\
         llmhost_scheduler_idle_stops_total {}\n\
         # HELP llmhost_scheduler_backend_failures_total Running backends that crashed or stopped answering\n\
         # TYPE llmhost_scheduler_backend_failures_total counter\n\
         llmhost_scheduler_backend_failures_total {}\n\
         # HELP llmhost_scheduler_running_models Models currently running\n\
         # TYPE llmhost_scheduler_running_models gauge\n\
         llmhost_scheduler_running_models {}\n\
         # HELP llmhost_router_uptime_seconds Router uptime in seconds\n\
         # TYPE llmhost_router_uptime_seconds gauge\n\
         llmhost_router_uptime_seconds {}\n",
        state.stats.total_requests(),
        state.stats.total_responses(),
        state.stats.total_errors(),
        state.stats.proxied_requests(),
        state.stats.active_forwards(),
        scheduler.cold_starts,
        scheduler.failed_starts,
        scheduler.idle_stops,
        scheduler.backend_failures,
        scheduler.running,
        state.stats.uptime_seconds(),
    );

    state.stats.increment_responses();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        metrics,
    )
}
