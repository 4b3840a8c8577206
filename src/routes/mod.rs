//! HTTP and WebSocket route handlers.
//!
//! - [`console`] — the front door: token → tunnel → byte relay
//! - [`health`] — unauthenticated liveness probe
//! - [`tunnels`] — admin API, mounted only when `auth.api_key` is set

pub mod console;
pub mod health;
pub mod tunnels;

use axum::{
    middleware,
    routing::{delete, get, post},
    Extension, Router,
};
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::{self, ApiKey};
use crate::AppState;

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    let mut app = Router::new()
        .route("/api/health", get(health::health))
        .route("/websockify", get(console::websockify_query))
        .route("/ws/{token}", get(console::websockify_path));

    let api_key = state
        .config
        .auth
        .api_key
        .as_deref()
        .filter(|k| !k.is_empty());
    if let Some(api_key) = api_key {
        let admin = Router::new()
            .route("/api/tunnels", get(tunnels::list))
            .route("/api/tunnels/{host}/{port}", delete(tunnels::cleanup))
            .route("/api/resolve", post(tunnels::resolve))
            .layer(middleware::from_fn(auth::require_api_key))
            .layer(Extension(ApiKey(api_key.to_string())))
            .layer(GlobalConcurrencyLimitLayer::new(
                state.config.server.max_connections.max(1),
            ));
        app = app.merge(admin);
    } else {
        info!("No API key configured, admin endpoints disabled");
    }

    if let Some(ref root) = state.config.web.root {
        info!("Serving static files from {root}");
        app = app.fallback_service(ServeDir::new(root));
    }

    app.layer(TraceLayer::new_for_http()).with_state(state)
}
