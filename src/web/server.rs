//! Axum HTTP API server.

use std::sync::Arc;

use axum::Router;
use sqlx::PgPool;
use tracing::info;

use crate::aggregator::AggregatorApi;
use crate::config::WebConfig;
use crate::monitor::order_monitor::OrderMonitor;

use super::auth::AuthVerifier;
use super::routes;

/// Shared state for all API routes.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub aggregator: Arc<dyn AggregatorApi>,
    pub monitor: OrderMonitor,
    pub auth: Arc<AuthVerifier>,
}

/// API server exposing the swap, chat, and admin surfaces.
pub struct WebServer {
    config: WebConfig,
    state: AppState,
}

impl WebServer {
    pub fn new(
        config: WebConfig,
        db: PgPool,
        aggregator: Arc<dyn AggregatorApi>,
        monitor: OrderMonitor,
        auth: Arc<AuthVerifier>,
    ) -> Self {
        Self {
            config,
            state: AppState {
                db,
                aggregator,
                monitor,
                auth,
            },
        }
    }

    /// Start the HTTP server.
    pub async fn start(self) -> anyhow::Result<()> {
        let app = Router::new()
            .merge(routes::api_routes())
            .with_state(self.state);

        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], self.config.port));
        info!(port = self.config.port, "api server starting");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}
