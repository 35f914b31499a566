use anyhow::{Context, Result};
use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::policy::{ControllerConfig, PolicyEvaluator};
use crate::status::{SharedStatus, StatusEvent};
use crate::valve::{ValveController, ValveSnapshot};

#[derive(Clone)]
pub struct AppState {
    pub status: SharedStatus,
    pub valve: ValveController,
    pub policy: Arc<PolicyEvaluator>,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub valve: ValveSnapshot,
    pub config: ControllerConfig,
    pub events: Vec<StatusEvent>,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .with_state(state)
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    // Config before valve: same lock order as the policy evaluator.
    let config = state.policy.snapshot().await;
    let valve = state.valve.snapshot().await;
    let st = state.status.read().await;
    Json(StatusResponse {
        uptime_secs: st.uptime_secs(),
        mqtt_connected: st.mqtt_connected,
        valve,
        config,
        events: st.recent(),
    })
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("status page listening on http://{addr}/api/status");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
