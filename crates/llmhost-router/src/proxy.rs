//! Request forwarding to local backends

use crate::config::RouterConfig;
use crate::handler::RequestContext;
use crate::router::RouterStats;

use axum::body::Body;
use bytes::Bytes;
use futures::stream::{BoxStream, Stream, StreamExt};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION};
use hyper::{Method, Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use llmhost_scheduler::RequestGuard;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Headers that describe one hop and never travel through the proxy
const HOP_BY_HOP: &[&str] = &[
    "host",
    "content-length",
    "transfer-encoding",
    "connection",
    "keep-alive",
    "upgrade",
    "te",
    "trailer",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
];

/// Why a forward did not produce a response
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// Nothing accepted the connection
    #[error("connection to backend failed: {0}")]
    Connect(String),

    /// The connection broke before a response arrived
    #[error("backend request failed: {0}")]
    Request(String),

    #[error("backend did not respond within {0:?}")]
    Timeout(Duration),

    #[error("invalid upstream request: {0}")]
    Invalid(String),
}

/// HTTP proxy for forwarding requests to backends on this host
#[derive(Clone)]
pub struct HttpProxy {
    client: Client<HttpConnector, Body>,
    timeout: Duration,
}

impl HttpProxy {
    /// Create a new HTTP proxy
    pub fn new(config: &RouterConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(config.connect_timeout));
        connector.set_nodelay(true);

        Self {
            client: Client::builder(TokioExecutor::new()).build(connector),
            timeout: config.request_timeout,
        }
    }

    /// Forward a request to `127.0.0.1:<port>`, preserving method, path,
    /// headers and body
    pub async fn forward(
        &self,
        context: &RequestContext,
        port: u16,
        method: Method,
        uri: &Uri,
        headers: &HeaderMap,
        body: Bytes,
    ) -> std::result::Result<Response<Incoming>, UpstreamError> {
        let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
        let target: Uri = format!("http://127.0.0.1:{}{}", port, path)
            .parse()
            .map_err(|e| UpstreamError::Invalid(format!("invalid target URI: {}", e)))?;

        debug!(
            request_id = %context.request_id,
            port,
            %method,
            path,
            "Forwarding request"
        );

        let mut request = Request::builder()
            .method(method)
            .uri(target)
            .body(Body::from(body))
            .map_err(|e| UpstreamError::Invalid(format!("failed to build request: {}", e)))?;

        let forwarded = request.headers_mut();
        forwarded.extend(headers.clone());
        strip_hop_by_hop(forwarded);
        if let Ok(value) = HeaderValue::from_str(&context.request_id) {
            forwarded.insert(REQUEST_ID_HEADER, value);
        }

        match timeout(self.timeout, self.client.request(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) if e.is_connect() => Err(UpstreamError::Connect(e.to_string())),
            Ok(Err(e)) => Err(UpstreamError::Request(e.to_string())),
            Err(_) => Err(UpstreamError::Timeout(self.timeout)),
        }
    }
}

/// Remove hop-by-hop headers, including any the `Connection` header names
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Keeps a forwarded request counted until its response body is finished
pub struct ForwardGuard {
    _request: RequestGuard,
    stats: Arc<RouterStats>,
}

impl ForwardGuard {
    pub fn new(request: RequestGuard, stats: Arc<RouterStats>) -> Self {
        stats.increment_active_forwards();
        Self {
            _request: request,
            stats,
        }
    }
}

impl Drop for ForwardGuard {
    fn drop(&mut self) {
        self.stats.decrement_active_forwards();
    }
}

/// Response body stream carrying the forward guard
struct GuardedStream {
    inner: BoxStream<'static, std::result::Result<Bytes, hyper::Error>>,
    _guard: ForwardGuard,
}

impl Stream for GuardedStream {
    type Item = std::result::Result<Bytes, hyper::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

/// Turn a backend response into the client response, streaming the body
/// chunk by chunk
pub fn stream_response(
    response: Response<Incoming>,
    guard: ForwardGuard,
    request_id: &str,
) -> Response<Body> {
    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    if let Ok(value) = HeaderValue::from_str(request_id) {
        parts.headers.insert(REQUEST_ID_HEADER, value);
    }

    let stream = GuardedStream {
        inner: body.into_data_stream().boxed(),
        _guard: guard,
    };

    Response::from_parts(parts, Body::from_stream(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::{CONTENT_TYPE, HOST, TRANSFER_ENCODING};

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("localhost:8080"));
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, x-custom-hop"));
        headers.insert("x-custom-hop", HeaderValue::from_static("1"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("authorization", HeaderValue::from_static("Bearer sk-test"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 2);
        assert!(headers.contains_key(CONTENT_TYPE));
        assert!(headers.contains_key("authorization"));
    }

    #[tokio::test]
    async fn test_connect_failure_is_classified() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let proxy = HttpProxy::new(&RouterConfig::default());
        let uri: Uri = "/v1/chat/completions".parse().unwrap();
        let result = proxy
            .forward(
                &RequestContext::new(),
                port,
                Method::POST,
                &uri,
                &HeaderMap::new(),
                Bytes::from_static(b"{}"),
            )
            .await;

        assert!(matches!(result, Err(UpstreamError::Connect(_))));
    }
}
