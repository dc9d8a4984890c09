use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use stepchain_core::config::AppConfig;
use stepchain_core::traits::RunStore;
use stepchain_engine::{HttpDispatcher, SimulatedExecutor};

use crate::middleware;
use crate::routes;
use crate::state::AppState;

/// HTTP gateway for step invocations, streaming runs, and the run lifecycle.
pub struct GatewayServer {
    config: AppConfig,
    store: Arc<dyn RunStore>,
}

impl GatewayServer {
    pub fn new(config: AppConfig, store: Arc<dyn RunStore>) -> Self {
        Self { config, store }
    }

    /// Run the gateway server until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let public_url = self.config.gateway.public_url();
        let dispatcher = HttpDispatcher::new(
            public_url.clone(),
            Duration::from_secs(self.config.chained.dispatch_timeout_secs),
        )?;
        let state = Arc::new(AppState::new(
            self.config.clone(),
            self.store.clone(),
            Arc::new(SimulatedExecutor),
            Arc::new(dispatcher),
        ));
        let app = build_router(state);

        let listener = TcpListener::bind(&self.config.gateway.bind).await?;
        info!(bind = %self.config.gateway.bind, public_url = %public_url, "Gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(routes::health))
        .route("/api/ping", post(routes::ping))
        // Chained scenario
        .route("/api/chained/status", get(routes::chained_status))
        .route("/api/chained/{step}", post(routes::chained_step))
        // Streaming scenarios
        .route("/api/sequential", post(routes::sequential))
        .route("/api/sequential-with-race", post(routes::sequential_with_race))
        // Run lifecycle
        .route("/api/runs", get(routes::list_runs))
        .route("/api/runs/{run_id}", get(routes::get_run))
        .route("/api/runs/{run_id}/kill", post(routes::kill_run))
        .layer(axum::middleware::from_fn(middleware::after_response))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
