//! Unauthenticated health-check endpoint.

use std::sync::atomic::Ordering;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /api/health` — liveness probe.
///
/// Returns status, uptime, version, tunnel counts and relay counters. No
/// authentication required, suitable for load-balancer health checks.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let (starting, alive) = state.supervisor.counts().await;
    let rs = &state.relay_stats;

    Json(json!({
        "status": "ok",
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "tunnels": {
            "starting": starting,
            "alive": alive,
        },
        "relay": {
            "active": rs.active.load(Ordering::Relaxed),
            "total": rs.total.load(Ordering::Relaxed),
            "failed": rs.failed.load(Ordering::Relaxed),
            "bytes_to_target": rs.bytes_to_target.load(Ordering::Relaxed),
            "bytes_to_browser": rs.bytes_to_browser.load(Ordering::Relaxed),
        },
    }))
}
