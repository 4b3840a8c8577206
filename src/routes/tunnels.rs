//! Admin endpoints for inspecting and tearing down tunnels.
//!
//! - `GET /api/tunnels` — list registry entries
//! - `POST /api/resolve` — resolve a token without opening a console
//! - `DELETE /api/tunnels/{host}/{port}` — clean up one tunnel

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::error::BrokerError;
use crate::token::ConnectionToken;
use crate::tunnel::TunnelKey;
use crate::AppState;

/// `GET /api/tunnels`
pub async fn list(State(state): State<AppState>) -> Json<Value> {
    let tunnels = state.supervisor.list().await;
    Json(json!({
        "base_port": state.supervisor.base_port(),
        "tunnels": tunnels,
    }))
}

/// Request body for `POST /api/resolve`.
#[derive(Deserialize)]
pub struct ResolveRequest {
    pub token: String,
}

/// `POST /api/resolve` — ensure a tunnel exists for `token` and return the
/// local address it forwards from.
pub async fn resolve(
    State(state): State<AppState>,
    Json(payload): Json<ResolveRequest>,
) -> Result<Json<Value>, BrokerError> {
    let token = ConnectionToken::parse(&payload.token)?;
    let local_port = state.supervisor.resolve(&token).await?;
    let target = state.supervisor.local_addr(local_port);
    info!("Token {token} -> {target}");
    Ok(Json(json!({
        "vm_id": token.vm_id,
        "local_port": local_port,
        "target": target.to_string(),
    })))
}

/// `DELETE /api/tunnels/{host}/{port}`. Idempotent; `removed` is false when
/// there was nothing to clean up.
pub async fn cleanup(
    State(state): State<AppState>,
    Path((host, port)): Path<(String, u16)>,
) -> Json<Value> {
    let key = TunnelKey::new(host, port);
    let removed = state.supervisor.cleanup(&key).await;
    Json(json!({
        "tunnel": key.to_string(),
        "removed": removed,
    }))
}
