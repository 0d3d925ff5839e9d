use crate::config::ApiConfig;
use crate::engine::{CycleReport, DrainEngine};
use crate::error::CycleError;
use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<DrainEngine>,
}

/// Manual trigger response
#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub status: &'static str,
    pub report: CycleReport,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/dump", get(trigger_drain))
        .route("/api/v1/drain", post(trigger_drain))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "telemetry-drain"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.engine.store().ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "source_store": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "source_store": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Run one drain cycle and report what it did
#[instrument(skip(state))]
async fn trigger_drain(
    State(state): State<AppState>,
) -> Result<Json<TriggerResponse>, (StatusCode, Json<ErrorResponse>)> {
    info!("Manual drain triggered");

    match state.engine.run_cycle().await {
        Ok(report) => Ok(Json(TriggerResponse {
            status: "Dump triggered",
            report,
        })),
        Err(e @ CycleError::AlreadyRunning) => Err((
            StatusCode::CONFLICT,
            Json(ErrorResponse {
                error: e.to_string(),
                code: "ALREADY_RUNNING".to_string(),
            }),
        )),
        Err(e) => {
            error!(error = %e, "Manual drain failed");
            Err((
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorResponse {
                    error: e.to_string(),
                    code: "ENUMERATION_FAILED".to_string(),
                }),
            ))
        }
    }
}

/// Start the manual trigger API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting drain API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
