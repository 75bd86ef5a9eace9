//! `HttpServer`: Axum HTTP + WebSocket front end for a [`Server`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::metrics::{CONNECTIONS_REJECTED_TOTAL, render};
use crate::server::Server;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::{SessionSettings, run_ws_session};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// The real-time server behind every socket.
    pub server: Server,
    /// Effective configuration.
    pub config: Arc<ServerConfig>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle for `/metrics`, if a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// HTTP listener serving `/health`, `/metrics` and the WebSocket endpoint.
pub struct HttpServer {
    state: AppState,
}

impl HttpServer {
    /// Create a front end for `server`.
    pub fn new(config: ServerConfig, server: Server, metrics: Option<PrometheusHandle>) -> Self {
        Self {
            state: AppState {
                server,
                config: Arc::new(config),
                shutdown: Arc::new(ShutdownCoordinator::new()),
                start_time: Instant::now(),
                metrics,
            },
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route(&self.state.config.ws_path, get(ws_handler))
            .with_state(self.state.clone())
    }

    /// Bind the configured address and serve until shutdown.
    ///
    /// Returns the bound address and the serve task.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let addr = format!("{}:{}", self.state.config.host, self.state.config.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        let router = self.router();
        let stop = self.state.shutdown.token();

        let handle = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, router)
                .with_graceful_shutdown(stop.cancelled_owned())
                .await
            {
                error!(error = %err, "http server failed");
            }
        });

        info!(%local_addr, ws_path = %self.state.config.ws_path, "listening");
        Ok((local_addr, handle))
    }

    /// The real-time server.
    pub fn server(&self) -> &Server {
        &self.state.server
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.state.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.server.connection_count(),
        state.server.subscription_count(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => render(handle).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

/// GET {ws_path}: upgrade unless the connection limit is reached.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if state.server.connection_count() >= state.config.max_connections {
        counter!(CONNECTIONS_REJECTED_TOTAL).increment(1);
        warn!(max = state.config.max_connections, "connection limit reached, refusing upgrade");
        return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
    }

    let settings = SessionSettings::from(state.config.as_ref());
    let shutdown = state.shutdown.token();
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| run_ws_session(socket, state.server, settings, shutdown))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tower::ServiceExt;

    fn make_server() -> HttpServer {
        HttpServer::new(ServerConfig::default(), Server::new(), None)
    }

    async fn get_body(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 100_000).await.unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn health_endpoint_reports_counts() {
        let http = make_server();
        let (transport, _rx) = crate::transport::ChannelTransport::new(4);
        let _conn = http.server().handle_connect(Arc::new(transport));

        let (status, body) = get_body(http.router(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["connections"], 1);
        assert_eq!(parsed["subscriptions"], 0);
        assert!(parsed.get("uptime_secs").is_some());
    }

    #[tokio::test]
    async fn metrics_without_recorder_is_not_found() {
        let (status, _) = get_body(make_server().router(), "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_with_recorder_renders_text() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let http = HttpServer::new(ServerConfig::default(), Server::new(), Some(handle));
        let (status, _) = get_body(http.router(), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn plain_get_on_ws_path_is_not_upgraded() {
        let (status, _) = get_body(make_server().router(), "/websocket").await;
        assert!(status.is_client_error());
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let (status, _) = get_body(make_server().router(), "/nonexistent").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn custom_ws_path_is_routed() {
        let config = ServerConfig {
            ws_path: "/sockjs".into(),
            ..ServerConfig::default()
        };
        let http = HttpServer::new(config, Server::new(), None);
        let (status, _) = get_body(http.router(), "/sockjs").await;
        assert_ne!(status, StatusCode::NOT_FOUND);
        let (status, _) = get_body(http.router(), "/websocket").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn listen_binds_ephemeral_port_and_stops_on_shutdown() {
        let http = make_server();
        let (addr, handle) = http.listen().await.unwrap();
        assert_ne!(addr.port(), 0);
        http.shutdown().shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
