//! Application startup and lifecycle management.

use crate::ai::{DisabledFallback, FallbackScorer, HttpFallbackScorer};
use crate::config::ReconciliationConfig;
use crate::http;
use crate::pipeline::Orchestrator;
use crate::services::{get_metrics, init_metrics, MemoryStore, PgStore, ReconciliationStore};
use axum::{
    extract::State, http::StatusCode, middleware, response::IntoResponse, routing::get, Json,
};
use serde_json::json;
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::tracing::request_id_middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ReconciliationConfig,
    pub store: Arc<dyn ReconciliationStore>,
    pub orchestrator: Arc<Orchestrator>,
    /// Cancelled when shutdown begins; batch runs stop dequeuing.
    pub shutdown: CancellationToken,
}

/// Health check endpoint for liveness probes.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.health_check().await {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "service": "reconciliation-service",
                "version": env!("CARGO_PKG_VERSION")
            })),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - store unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "reconciliation-service",
                    "error": e.to_string()
                })),
            )
        }
    }
}

/// Readiness check endpoint.
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.health_check().await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Metrics endpoint for Prometheus scraping.
async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: ReconciliationConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the harness.
    pub async fn build_without_migrations(config: ReconciliationConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(
        config: ReconciliationConfig,
        run_migrations: bool,
    ) -> Result<Self, AppError> {
        let store: Arc<dyn ReconciliationStore> = if config.database.url.is_empty() {
            tracing::warn!("DATABASE_URL not set - using the in-memory store");
            Arc::new(MemoryStore::new())
        } else {
            let pg = PgStore::new(
                &config.database.url,
                config.database.max_connections,
                config.database.min_connections,
            )
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to connect to PostgreSQL");
                e
            })?;
            if run_migrations {
                pg.run_migrations().await.map_err(|e| {
                    tracing::error!(error = %e, "Failed to run migrations");
                    e
                })?;
            }
            Arc::new(pg)
        };

        let fallback: Arc<dyn FallbackScorer> = if config.ai_fallback.url.is_empty() {
            tracing::info!("AI fallback URL not configured - rule-based matching only");
            Arc::new(DisabledFallback)
        } else {
            tracing::info!(endpoint = %config.ai_fallback.url, "AI fallback enabled");
            Arc::new(HttpFallbackScorer::new(&config.ai_fallback)?)
        };

        Self::build_with_store(config, store, fallback).await
    }

    /// Build against an injected store and fallback scorer. Tests use this to
    /// keep a handle on the store the pipeline mutates.
    pub async fn build_with_store(
        config: ReconciliationConfig,
        store: Arc<dyn ReconciliationStore>,
        fallback: Arc<dyn FallbackScorer>,
    ) -> Result<Self, AppError> {
        init_metrics();

        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            fallback,
            config.clone(),
        ));

        let state = AppState {
            config: config.clone(),
            store,
            orchestrator,
            shutdown: CancellationToken::new(),
        };

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port = port, "Reconciliation service listener bound");

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Token that stops batch dequeuing when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    /// Get a handle to the store.
    pub fn store(&self) -> Arc<dyn ReconciliationStore> {
        self.state.store.clone()
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let router = http::api_router()
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .layer(middleware::from_fn(metrics_middleware))
            .layer(middleware::from_fn(request_id_middleware))
            .with_state(self.state);

        tracing::info!(
            service = "reconciliation-service",
            version = env!("CARGO_PKG_VERSION"),
            port = self.port,
            "Service ready to accept connections"
        );

        axum::serve(self.listener, router).await
    }
}
