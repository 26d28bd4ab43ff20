//! Main router implementation

use crate::config::{validate_config, RouterConfig};
use crate::handler::RequestHandler;
use crate::server::HttpServer;
use crate::{Result, RouterError};

use llmhost_scheduler::Supervisor;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::info;

/// Router that serves the HTTP API over a supervisor
pub struct Router {
    /// Router configuration
    config: RouterConfig,

    /// HTTP server
    http_server: HttpServer,

    /// Router statistics
    stats: Arc<RouterStats>,
}

/// Router statistics
#[derive(Debug)]
pub struct RouterStats {
    /// Total requests received
    pub requests_total: AtomicU64,

    /// Total responses sent
    pub responses_total: AtomicU64,

    /// Total errors
    pub errors_total: AtomicU64,

    /// Requests forwarded to a backend
    pub proxied_requests: AtomicU64,

    /// Start, stop and info calls
    pub management_requests: AtomicU64,

    /// Forwards whose response body is still streaming
    pub active_forwards: AtomicU64,

    /// Router start time
    pub start_time: Instant,
}

impl Default for RouterStats {
    fn default() -> Self {
        Self {
            requests_total: AtomicU64::new(0),
            responses_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            proxied_requests: AtomicU64::new(0),
            management_requests: AtomicU64::new(0),
            active_forwards: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }
}

impl Router {
    /// Create a new router with the given configuration
    pub fn new(config: RouterConfig, supervisor: Supervisor) -> Result<Self> {
        validate_config(&config).map_err(RouterError::Configuration)?;

        info!("Creating router with config: {:?}", config);

        let stats = Arc::new(RouterStats::default());
        let handler = Arc::new(RequestHandler::new(&config, supervisor, stats.clone()));
        let http_server = HttpServer::new(config.clone(), handler, stats.clone());

        Ok(Self {
            config,
            http_server,
            stats,
        })
    }

    /// Bind the configured address and serve until `shutdown` resolves
    pub async fn serve<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_addr();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| RouterError::Server(format!("Failed to bind to {}: {}", bind_addr, e)))?;

        self.serve_listener(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves
    pub async fn serve_listener<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.http_server.serve(listener, shutdown).await
    }

    /// The axum application, for embedding or in-process testing
    pub fn app(&self) -> axum::Router {
        self.http_server.app()
    }

    /// Get router statistics
    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    /// Get router configuration
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Get uptime in seconds
    pub fn uptime(&self) -> u64 {
        self.stats.uptime_seconds()
    }
}

impl RouterStats {
    /// Increment request counter
    pub fn increment_requests(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment response counter
    pub fn increment_responses(&self) {
        self.responses_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment error counter
    pub fn increment_errors(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment proxied request counter
    pub fn increment_proxied_requests(&self) {
        self.proxied_requests.fetch_add(1, Ordering::Relaxed);
        self.increment_requests();
    }

    /// Increment management request counter
    pub fn increment_management_requests(&self) {
        self.management_requests.fetch_add(1, Ordering::Relaxed);
        self.increment_requests();
    }

    pub fn increment_active_forwards(&self) {
        self.active_forwards.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement_active_forwards(&self) {
        self.active_forwards.fetch_sub(1, Ordering::Relaxed);
    }

    /// Get total requests
    pub fn total_requests(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    /// Get total responses
    pub fn total_responses(&self) -> u64 {
        self.responses_total.load(Ordering::Relaxed)
    }

    /// Get total errors
    pub fn total_errors(&self) -> u64 {
        self.errors_total.load(Ordering::Relaxed)
    }

    pub fn proxied_requests(&self) -> u64 {
        self.proxied_requests.load(Ordering::Relaxed)
    }

    pub fn management_requests(&self) -> u64 {
        self.management_requests.load(Ordering::Relaxed)
    }

    pub fn active_forwards(&self) -> u64 {
        self.active_forwards.load(Ordering::Relaxed)
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouterConfigBuilder;
    use llmhost_adapter_device::MockInventory;
    use llmhost_core::ModelCatalog;
    use llmhost_scheduler::{HardwareAllocator, MockLauncher, MockProbe, SchedulerConfig};
    use std::time::Duration;

    fn supervisor() -> Supervisor {
        Supervisor::new(
            Arc::new(ModelCatalog::default()),
            HardwareAllocator::new(Arc::new(MockInventory::with_defaults())),
            MockLauncher::new(),
            Arc::new(MockProbe::ready()),
            SchedulerConfig::default(),
        )
    }

    #[test]
    fn test_router_rejects_invalid_config() {
        let config = RouterConfigBuilder::new()
            .request_timeout(Duration::ZERO)
            .build();

        assert!(Router::new(config, supervisor()).is_err());
    }

    #[test]
    fn test_router_stats() {
        let stats = RouterStats::default();

        assert_eq!(stats.total_requests(), 0);
        assert_eq!(stats.total_responses(), 0);
        assert_eq!(stats.total_errors(), 0);

        stats.increment_proxied_requests();
        assert_eq!(stats.total_requests(), 1);
        assert_eq!(stats.proxied_requests(), 1);

        stats.increment_management_requests();
        assert_eq!(stats.total_requests(), 2);
        assert_eq!(stats.management_requests(), 1);

        stats.increment_active_forwards();
        stats.decrement_active_forwards();
        assert_eq!(stats.active_forwards(), 0);

        stats.increment_errors();
        assert_eq!(stats.total_errors(), 1);
    }

    #[tokio::test]
    async fn test_serve_until_shutdown() {
        let config = RouterConfigBuilder::new()
            .bind_address("127.0.0.1")
            .http_port(0)
            .build();
        let router = Router::new(config, supervisor()).unwrap();
        assert_eq!(router.stats().total_requests(), 0);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let serving = router.serve_listener(listener, async move {
            let _ = rx.await;
        });

        tx.send(()).unwrap();
        serving.await.unwrap();
    }
}
