//! Console front door.
//!
//! `GET /websockify?token=<token>` and `GET /ws/{token}` accept the noVNC
//! WebSocket. Each request goes through three phases:
//!
//! 1. **Parse**: a malformed token is answered with `400` before anything
//!    else happens; no tunnel process is ever attempted for it.
//! 2. **Resolve**: the supervisor returns the local port of a live tunnel,
//!    creating one if needed. Failures map to `502`/`504`/`409`.
//! 3. **Relay**: the local forward is dialed *before* the upgrade so an
//!    unreachable forward is still reported as an HTTP error. After the
//!    upgrade, bytes are copied until either side closes; a mid-session
//!    failure closes the socket with code 1011 (`session dropped`).

use std::sync::atomic::Ordering;

use axum::{
    extract::{ws::rejection::WebSocketUpgradeRejection, Path, Query, State, WebSocketUpgrade},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::error::BrokerError;
use crate::relay;
use crate::token::{ConnectionToken, TokenError};
use crate::AppState;

/// Subprotocol noVNC requests for raw binary frames.
const BINARY_SUBPROTOCOL: &str = "binary";

/// Query parameters for `GET /websockify`.
#[derive(Deserialize)]
pub struct ConsoleQuery {
    pub token: Option<String>,
}

/// `GET /websockify?token=<token>` — websockify-compatible entry point.
pub async fn websockify_query(
    State(state): State<AppState>,
    Query(query): Query<ConsoleQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    open_console(state, query.token.as_deref(), ws).await
}

/// `GET /ws/{token}` — token as a path segment.
pub async fn websockify_path(
    State(state): State<AppState>,
    Path(token): Path<String>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    open_console(state, Some(&token), ws).await
}

async fn open_console(
    state: AppState,
    raw_token: Option<&str>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let token = match raw_token
        .ok_or(TokenError::Missing)
        .and_then(ConnectionToken::parse)
    {
        Ok(t) => t,
        Err(e) => {
            warn!("Console: rejected token {:?}: {e}", raw_token.unwrap_or_default());
            return BrokerError::from(e).into_response();
        }
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let local_port = match state.supervisor.resolve(&token).await {
        Ok(port) => port,
        Err(e) => {
            warn!("Console: vm {} ({token}): {e}", token.vm_id);
            return e.into_response();
        }
    };

    let target = state.supervisor.local_addr(local_port);
    let stream = match relay::connect(target, &state.config.relay).await {
        Ok(s) => s,
        Err(e) => {
            state.relay_stats.failed.fetch_add(1, Ordering::Relaxed);
            warn!("Console: vm {} ({token}): {e}", token.vm_id);
            return e.into_response();
        }
    };

    let buffer_size = state.config.relay.buffer_size;
    let counters = state.relay_stats.clone();
    ws.protocols([BINARY_SUBPROTOCOL])
        .on_upgrade(move |socket| async move {
            let _session = counters.session();
            info!("Console: vm {} session started via {target}", token.vm_id);
            match relay::bridge(socket, stream, buffer_size).await {
                Ok(stats) => {
                    counters
                        .bytes_to_target
                        .fetch_add(stats.to_target, Ordering::Relaxed);
                    counters
                        .bytes_to_browser
                        .fetch_add(stats.to_browser, Ordering::Relaxed);
                    info!(
                        "Console: vm {} session ended ({} B up, {} B down)",
                        token.vm_id, stats.to_target, stats.to_browser
                    );
                }
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    error!("Console: vm {} session dropped: {e}", token.vm_id);
                }
            }
        })
}
