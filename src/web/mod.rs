//! Web server module.

mod handlers;

pub use handlers::*;

use crate::config::ServerConfig;
use crate::db::HealthStore;
use crate::health::BadgeReport;
use crate::remediation::RemediationController;

use axum::{
    extract::DefaultBodyLimit,
    http::Method,
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<dyn HealthStore>,
    pub controller: RemediationController,
    pub badge: watch::Receiver<BadgeReport>,
}

/// JSON API server for netwatchdog.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn HealthStore>,
        controller: RemediationController,
        badge: watch::Receiver<BadgeReport>,
    ) -> Self {
        Self {
            state: AppState {
                config,
                store,
                controller,
                badge,
            },
        }
    }

    /// Build the router with all routes.
    ///
    /// Cross-origin access is granted to the read endpoints only; the
    /// remediation trigger stays same-origin.
    pub fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods([Method::GET]);

        let reads = Router::new()
            .route("/health", get(handlers::handle_health))
            .route("/api/samples", get(handlers::handle_get_samples))
            .route("/api/samples/summary", get(handlers::handle_get_summary))
            .route("/api/events", get(handlers::handle_get_events))
            .route("/api/badge", get(handlers::handle_get_badge))
            .route("/api/remediation", get(handlers::handle_get_remediation))
            .route("/api/device", get(handlers::handle_get_device))
            .layer(cors);

        Router::new()
            .merge(reads)
            .route("/api/remediate", post(handlers::handle_remediate))
            .layer(TraceLayer::new_for_http())
            .layer(DefaultBodyLimit::max(64 * 1024))
            .with_state(self.state.clone())
    }

    /// Serve on the configured port until `shutdown` resolves.
    pub async fn start<F>(&self, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}
