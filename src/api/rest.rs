// =============================================================================
// REST API — read-only status/health surface
// =============================================================================
//
// Scoped down from a full authenticated dashboard (positions, control
// endpoints, trade journal, WS) to two read-only endpoints: `/health`
// (liveness) and `/status` (per-timeframe engine snapshot). No control-plane
// endpoints are exposed: the engine is paper-only and driven entirely by its
// config file and process lifecycle, so there is nothing here to
// pause/resume/kill.
// =============================================================================

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use parking_lot::RwLock;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::health::HealthSnapshot;

/// One timeframe instance's latest status, refreshed by its driver loop
/// after every bar.
#[derive(Debug, Clone, Serialize, Default)]
pub struct InstanceStatus {
    pub timeframe: String,
    pub last_bar_id: u64,
    pub last_bar_ts_ms: i64,
    pub position_fraction: f64,
    pub trading_mode: String,
    pub account_mode: String,
    pub health: Option<HealthSnapshot>,
}

#[derive(Default)]
struct Inner {
    instances: Vec<InstanceStatus>,
    started_at_ms: i64,
}

/// Shared handle the driver tasks write into and the API router reads from.
#[derive(Clone)]
pub struct ApiState(Arc<RwLock<Inner>>);

impl ApiState {
    pub fn new(started_at_ms: i64) -> Self {
        Self(Arc::new(RwLock::new(Inner {
            instances: Vec::new(),
            started_at_ms,
        })))
    }

    pub fn publish(&self, status: InstanceStatus) {
        let mut inner = self.0.write();
        if let Some(existing) = inner.instances.iter_mut().find(|s| s.timeframe == status.timeframe) {
            *existing = status;
        } else {
            inner.instances.push(status);
        }
    }
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .layer(cors)
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    server_time: i64,
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

#[derive(Serialize)]
struct StatusResponse {
    started_at_ms: i64,
    server_time: i64,
    instances: Vec<InstanceStatus>,
}

async fn status(State(state): State<ApiState>) -> impl IntoResponse {
    let inner = state.0.read();
    Json(StatusResponse {
        started_at_ms: inner.started_at_ms,
        server_time: chrono::Utc::now().timestamp_millis(),
        instances: inner.instances.clone(),
    })
}
