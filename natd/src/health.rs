//! Health surface: periodic re-verification plus an HTTP endpoint for the
//! orchestrator's instance health check.
//!
//! A degraded NAT path answers 503 on /healthz, so a load balancer or
//! auto-scaling group health check pointed here replaces the instance
//! instead of leaving it silently black-holing traffic.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tracing::{error, warn};

use crate::configurator::{self, NatSpec, NatStatus};

/// Shared view of the most recent verification result.
#[derive(Clone)]
pub struct StatusHandle {
    inner: Arc<RwLock<NatStatus>>,
}

impl StatusHandle {
    pub fn new(initial: NatStatus) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    pub async fn get(&self) -> NatStatus {
        self.inner.read().await.clone()
    }

    pub async fn set(&self, status: NatStatus) {
        *self.inner.write().await = status;
    }
}

#[derive(Clone)]
struct AppState {
    status: StatusHandle,
    host: String,
}

#[derive(Serialize)]
struct HealthResponse {
    host: String,
    version: &'static str,
    #[serde(flatten)]
    status: NatStatus,
}

impl HealthResponse {
    fn new(state: &AppState, status: NatStatus) -> Self {
        Self {
            host: state.host.clone(),
            version: env!("CARGO_PKG_VERSION"),
            status,
        }
    }
}

/// Build the health router over a shared status handle.
pub fn router(status: StatusHandle) -> Router {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());

    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(get_status))
        .route("/version", get(get_version))
        .with_state(AppState { status, host })
}

/// 200 while the NAT path verifies healthy, 503 when degraded.
async fn healthz(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let status = state.status.get().await;
    let code = if status.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(HealthResponse::new(&state, status)))
}

/// Always 200: operator diagnostics, not a health probe.
async fn get_status(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = state.status.get().await;
    Json(HealthResponse::new(&state, status))
}

#[derive(Serialize)]
struct VersionInfo {
    version: String,
}

async fn get_version() -> Json<VersionInfo> {
    Json(VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Re-verify kernel state on an interval, refreshing the shared status.
///
/// Verification errors degrade the status; they never stop the loop. The
/// 503 on /healthz is the failure signal.
pub async fn monitor(spec: NatSpec, handle: StatusHandle, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick fires immediately; skip it, apply just verified.
    ticker.tick().await;

    loop {
        ticker.tick().await;

        match configurator::verify(&spec) {
            Ok(status) => {
                if !status.healthy {
                    warn!(
                        iface = %spec.iface,
                        forwarding = status.forwarding,
                        rules = status.rule_count,
                        "NAT path degraded"
                    );
                }
                handle.set(status).await;
            }
            Err(e) => {
                error!(error = %e, "NAT verification failed");
                handle.set(NatStatus::unavailable(&spec)).await;
            }
        }
    }
}
