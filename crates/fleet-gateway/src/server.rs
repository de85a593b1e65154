use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use fleet_core::config::GatewayConfig;
use fleet_engine::Fleet;

use crate::routes;
use crate::state::AppState;

/// Build the API router.
pub fn router(config: GatewayConfig, fleet: Arc<Fleet>) -> Router {
    let state = Arc::new(AppState { config, fleet });

    Router::new()
        .route("/api/health", get(routes::health))
        .route("/api/events", post(routes::submit_event))
        .route("/api/runs", get(routes::list_runs))
        .route("/api/runs/{id}", get(routes::get_run))
        .route("/api/runs/{id}/cancel", post(routes::cancel_run))
        .route("/api/runs/{id}/steps/{step}/approve", post(routes::approve_step))
        .route("/api/runs/{id}/steps/{step}/reject", post(routes::reject_step))
        .route("/api/runs/{id}/steps/{step}/complete", post(routes::complete_step))
        .route("/api/approvals", get(routes::list_approvals))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// HTTP gateway server built on axum.
pub struct GatewayServer {
    config: GatewayConfig,
    fleet: Arc<Fleet>,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, fleet: Arc<Fleet>) -> Self {
        Self { config, fleet }
    }

    /// Run the gateway server until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let app = router(self.config.clone(), self.fleet.clone());

        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(bind = %self.config.bind, "Gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}
