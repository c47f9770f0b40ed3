use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::routing::{get, post};
use axum::Router;
use parley_core::ChatStore;
use parley_telemetry::MetricsRecorder;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::http;
use crate::hub::{Hub, HubHandle, HubSettings};
use crate::transport::ws_handler;

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub store: Arc<dyn ChatStore>,
    pub config: Arc<ServerConfig>,
    pub metrics: Option<Arc<MetricsRecorder>>,
    /// Parent of every connection's cancellation token.
    pub shutdown: CancellationToken,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        hub: HubHandle,
        store: Arc<dyn ChatStore>,
        config: ServerConfig,
        metrics: Option<Arc<MetricsRecorder>>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            hub,
            store,
            config: Arc::new(config),
            metrics,
            shutdown,
            started_at: Instant::now(),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(http::health))
        .route("/messages", get(http::message_history))
        .route("/users/online", get(http::online_users))
        .route("/users/live", get(http::live_users))
        .route("/api/chat/message", post(http::inject_message))
        .route("/metrics", get(http::metrics))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Bind the listener, start the hub and serve until shut down.
pub async fn start(
    config: ServerConfig,
    store: Arc<dyn ChatStore>,
    metrics: Option<Arc<MetricsRecorder>>,
) -> Result<ServerHandle, std::io::Error> {
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let addr = listener.local_addr()?;

    let shutdown = CancellationToken::new();
    let (hub, hub_task) = Hub::spawn(
        Arc::clone(&store),
        HubSettings::from(&config),
        metrics.clone(),
        shutdown.child_token(),
    );

    let shutdown_timeout = config.shutdown_timeout();
    let state = AppState::new(hub.clone(), store, config, metrics, shutdown.clone());
    let router = build_router(state);

    let serve_token = shutdown.clone();
    let server_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(serve_token.cancelled_owned())
            .await
        {
            warn!(error = %e, "server exited with error");
        }
    });

    info!(%addr, "parley server started");
    Ok(ServerHandle {
        addr,
        hub,
        shutdown,
        shutdown_timeout,
        tasks: vec![server_task, hub_task],
    })
}

/// Handle returned by `start()`. Keeps the background tasks alive.
pub struct ServerHandle {
    addr: SocketAddr,
    hub: HubHandle,
    shutdown: CancellationToken,
    shutdown_timeout: Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Cancel the listener, the hub and every connection, then wait up to
    /// the configured timeout for them to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        info!(
            task_count = self.tasks.len(),
            timeout_secs = self.shutdown_timeout.as_secs(),
            "waiting for tasks to complete"
        );

        let drain = futures::future::join_all(self.tasks);
        if tokio::time::timeout(self.shutdown_timeout, drain).await.is_err() {
            warn!(
                "shutdown timed out after {:?}, some tasks may still be running",
                self.shutdown_timeout
            );
        }
        info!("parley server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_store::MemoryChatStore;

    fn local_config() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let handle = start(local_config(), Arc::new(MemoryChatStore::new()), None)
            .await
            .unwrap();
        assert!(handle.port() > 0);

        let url = format!("http://{}/health", handle.addr());
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 0);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_the_hub() {
        let handle = start(local_config(), Arc::new(MemoryChatStore::new()), None)
            .await
            .unwrap();
        let hub = handle.hub().clone();
        hub.barrier().await.unwrap();

        handle.shutdown().await;
        assert!(hub.barrier().await.is_err());
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let first = start(local_config(), Arc::new(MemoryChatStore::new()), None)
            .await
            .unwrap();
        let taken = ServerConfig {
            port: first.port(),
            ..local_config()
        };
        assert!(start(taken, Arc::new(MemoryChatStore::new()), None).await.is_err());
        first.shutdown().await;
    }

    #[tokio::test]
    async fn websocket_upgrade_requires_identity() {
        let handle = start(local_config(), Arc::new(MemoryChatStore::new()), None)
            .await
            .unwrap();
        let url = format!("http://{}/ws", handle.addr());
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 401);
        handle.shutdown().await;
    }
}
