#![forbid(unsafe_code)]

// Signaling module - WebSocket signaling server

pub mod connection;
pub mod protocol;

use crate::metrics::ServerMetrics;
use crate::room::RoomRegistry;
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Signaling server state
#[derive(Clone)]
pub struct SignalingServer {
    registry: Arc<RoomRegistry>,
    metrics: ServerMetrics,
    connection_semaphore: Arc<Semaphore>,
    /// Cleared during graceful shutdown so new sessions are refused while
    /// existing ones drain
    accepting: Arc<AtomicBool>,
    metrics_token: Option<Arc<String>>,
}

impl SignalingServer {
    /// Creates a new signaling server
    pub fn new(registry: Arc<RoomRegistry>, metrics: ServerMetrics) -> Self {
        let mut max_connections: usize = std::env::var("MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1024);
        if max_connections == 0 {
            warn!("MAX_CONNECTIONS=0 would reject all connections, using default 1024");
            max_connections = 1024;
        }
        info!("Max connections: {}", max_connections);

        let metrics_token = std::env::var("METRICS_TOKEN").ok().map(Arc::new);
        if metrics_token.is_some() {
            info!("Metrics endpoint protected by bearer token");
        }

        Self {
            registry,
            metrics,
            connection_semaphore: Arc::new(Semaphore::new(max_connections)),
            accepting: Arc::new(AtomicBool::new(true)),
            metrics_token,
        }
    }

    /// Refuses new WebSocket sessions; existing connections keep running.
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        info!("No longer accepting new sessions");
    }

    /// Creates the Axum router for the signaling server
    pub fn router(self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self)
            .layer(CorsLayer::permissive())
    }

    /// Starts the signaling server on the specified port
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the port
    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{port}");
        info!("Starting signaling server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let app = self.router();

        axum::serve(listener, app).await?;

        Ok(())
    }
}

/// Health check handler
async fn health_handler(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    let rooms = server.registry.room_count();
    let peers = server.registry.total_peer_count().await;
    let status = if server.registry.worker_pool().is_alive() {
        "ok"
    } else {
        "degraded"
    };
    Json(serde_json::json!({
        "status": status,
        "rooms": rooms,
        "peers": peers,
    }))
}

/// Metrics handler — Prometheus text exposition format.
/// Protected by optional METRICS_TOKEN env var (Bearer auth).
async fn metrics_handler(State(server): State<SignalingServer>, headers: HeaderMap) -> Response {
    if let Some(expected) = &server.metrics_token {
        let provided = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided != format!("Bearer {expected}") {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let rooms = server.registry.room_count();
    let peers = server.registry.total_peer_count().await;
    let body = server.metrics.render_prometheus(rooms, peers);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(server): State<SignalingServer>) -> Response {
    if !server.accepting.load(Ordering::SeqCst) {
        return (StatusCode::SERVICE_UNAVAILABLE, "Shutting down").into_response();
    }

    // Acquire connection permit (non-blocking)
    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Connection limit reached, rejecting WebSocket upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    ws.max_message_size(65_536)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| {
            connection::handle_connection(socket, server.registry, server.metrics, permit)
        })
}
