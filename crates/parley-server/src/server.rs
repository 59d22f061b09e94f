use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use parley_engine::{ChannelSession, ConnectionRegistry, StreamMultiplexer};
use parley_telemetry::TelemetryGuard;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::{bridge, handlers};

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Outbound frames buffered per connection before forwarders wait.
    pub max_send_queue: usize,
    /// Largest inbound WebSocket message accepted.
    pub max_frame_bytes: usize,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 9092,
            max_send_queue: 256,
            max_frame_bytes: 64 * 1024,
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(90),
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    multiplexer: StreamMultiplexer,
    config: Arc<ServerConfig>,
    telemetry: Option<Arc<TelemetryGuard>>,
}

impl AppState {
    pub fn new(session: ChannelSession, config: ServerConfig) -> Self {
        Self {
            multiplexer: StreamMultiplexer::new(session, Arc::new(ConnectionRegistry::new())),
            config: Arc::new(config),
            telemetry: None,
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<TelemetryGuard>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn session(&self) -> &ChannelSession {
        self.multiplexer.session()
    }

    pub fn multiplexer(&self) -> &StreamMultiplexer {
        &self.multiplexer
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.multiplexer.registry()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(bridge::ws_handler))
        .route("/health", get(health_handler))
        .route("/channels", post(handlers::create_channel))
        .route(
            "/channels/{id}",
            get(handlers::get_channel).delete(handlers::delete_channel),
        )
        .route("/channels/{id}/frozen", put(handlers::set_frozen))
        .route("/channels/{id}/messages", get(handlers::list_messages))
        .route(
            "/channels/{id}/members",
            get(handlers::list_members).post(handlers::add_member),
        )
        .route(
            "/channels/{id}/members/{user_id}",
            delete(handlers::remove_member),
        )
        .route("/users/{id}/channels", get(handlers::list_user_channels))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle to shut it down.
pub async fn start(config: ServerConfig, session: ChannelSession) -> Result<ServerHandle, std::io::Error> {
    serve(AppState::new(session, config)).await
}

/// Like [`start`], with `/health` reporting persisted warnings.
pub async fn start_with_telemetry(
    config: ServerConfig,
    session: ChannelSession,
    telemetry: Arc<TelemetryGuard>,
) -> Result<ServerHandle, std::io::Error> {
    serve(AppState::new(session, config).with_telemetry(telemetry)).await
}

async fn serve(state: AppState) -> Result<ServerHandle, std::io::Error> {
    let addr = format!("{}:{}", state.config().host, state.config().port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;
    let registry = Arc::clone(state.registry());
    let router = build_router(state);

    let shutdown = CancellationToken::new();
    let stop = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(async move { stop.cancelled().await })
            .await
        {
            tracing::error!(error = %e, "server stopped with error");
        }
    });

    tracing::info!(addr = %local_addr, "parley server started");

    Ok(ServerHandle {
        addr: local_addr,
        port: local_addr.port(),
        registry,
        shutdown,
        server,
    })
}

/// Handle returned by `start()`; keeps the server task alive.
pub struct ServerHandle {
    pub addr: SocketAddr,
    pub port: u16,
    registry: Arc<ConnectionRegistry>,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
}

impl ServerHandle {
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Close every live connection, then stop accepting and wait for the
    /// listener to wind down.
    pub async fn shutdown(self) {
        self.registry.close_all().await;
        self.shutdown.cancel();
        if let Err(e) = self.server.await {
            tracing::warn!(error = %e, "server task failed during shutdown");
        }
        tracing::info!("parley server stopped");
    }
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut body = serde_json::json!({
        "status": "healthy",
        "connections": state.registry().connection_count(),
        "subscriptions": state.registry().subscription_count(),
    });
    if let Some(warnings) = state.telemetry.as_ref().and_then(|t| t.warning_count()) {
        body["warnings"] = warnings.into();
    }
    Json(body)
}
