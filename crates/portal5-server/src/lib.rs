//! Portal5 Server - HTTP front end for the interception pipeline.
//!
//! Browsers talk to this server on the public server origin. Every request
//! except the context endpoints is handed to the
//! [`InterceptionPipeline`](portal5_proxy::InterceptionPipeline).
//!
//! ## Endpoints
//!
//! - `POST /~context` - Browsing context heartbeat
//! - `DELETE /~context/{id}` - Forget a closed context
//! - everything else - Intercepted and proxied
//!
//! ## Example
//!
//! ```no_run
//! use portal5_server::{AppState, Server, ServerConfig};
//!
//! async fn serve(state: AppState) {
//!     let server = Server::with_state(ServerConfig::default(), state).unwrap();
//!     server.run().await.unwrap();
//! }
//! ```

pub mod error;
mod handlers;
pub mod models;
pub mod state;

use std::net::SocketAddr;

use axum::routing::{delete, post};
use axum::Router;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tracing::info;

pub use error::{ApiError, Result};
pub use state::AppState;

/// Default server port.
pub const DEFAULT_PORT: u16 = 48765;

/// Default server host.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Request header naming the browsing context that issued a request.
pub const CLIENT_HEADER: &str = "x-portal5-client";

/// Request header carrying the issuing page's referrer policy.
pub const REFERRER_POLICY_HEADER: &str = "x-portal5-referrer-policy";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind to (default: 127.0.0.1).
    pub host: String,
    /// Port to bind to.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl ServerConfig {
    /// Sets the host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sets the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

/// Server error types.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("failed to bind to {0}: {1}")]
    BindError(SocketAddr, std::io::Error),

    /// Server runtime error.
    #[error("server error: {0}")]
    Runtime(String),
}

/// Builds the router over `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/~context", post(handlers::heartbeat))
        .route("/~context/{id}", delete(handlers::forget_context))
        .fallback(handlers::intercept)
        .with_state(state)
}

/// The HTTP front end.
pub struct Server {
    router: Router,
    addr: SocketAddr,
}

impl Server {
    /// Creates a server over the given state.
    pub fn with_state(
        config: ServerConfig,
        state: AppState,
    ) -> std::result::Result<Self, ServerError> {
        let addr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|e| ServerError::Runtime(format!("invalid address: {}", e)))?;

        Ok(Self {
            router: router(state),
            addr,
        })
    }

    /// Returns the server address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Runs the server until shutdown.
    pub async fn run(self) -> std::result::Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Runs the server until `shutdown` resolves.
    pub async fn run_until<F>(self, shutdown: F) -> std::result::Result<(), ServerError>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        info!("Starting Portal5 server on {}", self.addr);

        let domain = if self.addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| ServerError::BindError(self.addr, e))?;

        // Lingering TIME_WAIT sockets must not block a restart.
        socket
            .set_reuse_address(true)
            .map_err(|e| ServerError::BindError(self.addr, e))?;
        socket
            .bind(&self.addr.into())
            .map_err(|e| ServerError::BindError(self.addr, e))?;
        socket
            .listen(128)
            .map_err(|e| ServerError::BindError(self.addr, e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| ServerError::BindError(self.addr, e))?;

        let std_listener: std::net::TcpListener = socket.into();
        let listener = tokio::net::TcpListener::from_std(std_listener)
            .map_err(|e| ServerError::BindError(self.addr, e))?;

        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ServerError::Runtime(e.to_string()))?;

        info!("Portal5 server stopped");
        Ok(())
    }

    /// Returns the router for testing.
    pub fn router(&self) -> Router {
        self.router.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use portal5_core::{Preferences, ServerOrigin, WorkerSettings};
    use portal5_proxy::{
        ContextRegistry, InterceptionPipeline, OutboundRequest, ProxyContext, ProxyError,
        ProxyResponse, Upstream,
    };
    use portal5_storage::TransientStore;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use tower::ServiceExt;

    /// Answers 200 with the requested URL as body, or fails for `/down`.
    #[derive(Default)]
    struct EchoUpstream {
        seen: Mutex<Vec<OutboundRequest>>,
    }

    #[async_trait]
    impl Upstream for EchoUpstream {
        async fn fetch(&self, request: OutboundRequest) -> portal5_proxy::Result<ProxyResponse> {
            let url = request.url.clone();
            self.seen.lock().unwrap().push(request);
            if url.path().ends_with("/down") {
                return Err(ProxyError::Upstream("connection refused".to_string()));
            }
            Ok(ProxyResponse::text(StatusCode::OK, url.to_string()))
        }
    }

    fn create_test_app() -> (Router, Arc<EchoUpstream>, Arc<ContextRegistry>) {
        let upstream = Arc::new(EchoUpstream::default());
        let registry = Arc::new(ContextRegistry::new());
        let settings = WorkerSettings::new(
            "w1",
            "0.5.0",
            ServerOrigin::parse("https://proxy.example").unwrap(),
        )
        .with_prefs(Preferences::from_features(&[
            portal5_core::Feature::BasicRewriteCrosssite,
        ]));
        let ctx = ProxyContext::new(
            settings,
            Arc::new(TransientStore::in_memory()),
            registry.clone(),
            upstream.clone(),
        );
        let state = AppState::new(InterceptionPipeline::new(Arc::new(ctx)), registry.clone());
        (router(state), upstream, registry)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_heartbeat_registers_context() {
        let (app, _, registry) = create_test_app();

        let request = Request::builder()
            .method("POST")
            .uri("/~context")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({
                    "id": "tab-1",
                    "url": "https://proxy.example/https://target.example/app",
                    "focused": true
                })
                .to_string(),
            ))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["live"], 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_rejects_bad_url() {
        let (app, _, _) = create_test_app();

        let request = Request::builder()
            .method("POST")
            .uri("/~context")
            .header("content-type", "application/json")
            .body(Body::from(json!({"id": "tab-1", "url": "not a url"}).to_string()))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "bad_request");
    }

    #[tokio::test]
    async fn test_forget_context() {
        let (app, _, registry) = create_test_app();
        registry.heartbeat(portal5_core::BrowsingContext {
            id: "tab-1".to_string(),
            url: url::Url::parse("https://proxy.example/").unwrap(),
            focused: false,
            visible: true,
        });

        let request = Request::builder()
            .method("DELETE")
            .uri("/~context/tab-1")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["removed"], true);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_embedded_navigation_is_proxied() {
        let (app, upstream, _) = create_test_app();

        let request = Request::builder()
            .uri("/https://target.example/page?x=1")
            .header("sec-fetch-mode", "navigate")
            .header("sec-fetch-dest", "document")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let seen = upstream.seen.lock().unwrap();
        assert_eq!(
            seen[0].url.as_str(),
            "https://proxy.example/https://target.example/page?x=1"
        );
        let envelope = seen[0].envelope().unwrap();
        assert_eq!(envelope.mode, Some(portal5_core::RequestMode::Navigate));
    }

    #[tokio::test]
    async fn test_client_header_selects_context() {
        let (app, upstream, registry) = create_test_app();
        registry.heartbeat(portal5_core::BrowsingContext {
            id: "tab-1".to_string(),
            url: url::Url::parse("https://proxy.example/https://target.example/app").unwrap(),
            focused: false,
            visible: true,
        });

        let request = Request::builder()
            .uri("/api/data")
            .header("sec-fetch-mode", "cors")
            .header("sec-fetch-dest", "empty")
            .header(CLIENT_HEADER, "tab-1")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let seen = upstream.seen.lock().unwrap();
        assert_eq!(
            seen[0].url.as_str(),
            "https://proxy.example/https://target.example/api/data"
        );
        assert!(seen[0].headers.get(CLIENT_HEADER).is_none());
    }

    fn navigation_from(previous: &str, policy: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .uri("/https://b.example/landing")
            .header("sec-fetch-mode", "navigate")
            .header("sec-fetch-dest", "document")
            .header("referer", previous);
        if let Some(policy) = policy {
            builder = builder.header(REFERRER_POLICY_HEADER, policy);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_referrer_policy_header_is_applied() {
        let (app, upstream, _) = create_test_app();
        let previous = "https://proxy.example/https://a.example/private?token=1";

        let response = app
            .clone()
            .oneshot(navigation_from(previous, Some("no-referrer")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.oneshot(navigation_from(previous, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let seen = upstream.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].envelope().unwrap().referrer.is_none());
        assert!(seen[0].headers.get(REFERRER_POLICY_HEADER).is_none());
        assert!(seen[1].envelope().unwrap().referrer.is_some());
        assert!(seen.iter().all(|r| r.headers.get("referer").is_none()));
    }

    #[tokio::test]
    async fn test_inbound_session_header_is_forbidden() {
        let (app, upstream, _) = create_test_app();

        let request = Request::builder()
            .uri("/https://target.example/")
            .header("x-portal5", "{}")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(upstream.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upstream_failure_maps_to_bad_gateway() {
        let (app, _, _) = create_test_app();

        let request = Request::builder()
            .uri("/https://target.example/down")
            .header("sec-fetch-mode", "navigate")
            .header("sec-fetch-dest", "document")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(body_json(response).await["code"], "upstream_error");
    }

    #[test]
    fn test_server_config() {
        let config = ServerConfig::default().with_host("0.0.0.0").with_port(9000);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
    }
}
