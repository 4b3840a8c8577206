//! Broker error taxonomy and its HTTP presentation.
//!
//! Errors are values carried up to the front door, which decides how they are
//! shown. Three user-facing categories exist: a malformed session
//! ([`BrokerError::InvalidToken`]), an unreachable hypervisor
//! ([`BrokerError::TunnelCreationFailed`], [`BrokerError::TunnelTimeout`],
//! [`BrokerError::PortConflict`]) and a dropped session
//! ([`BrokerError::RelayFailure`]).
//!
//! `BrokerError` is `Clone` because a single tunnel creation outcome is fanned
//! out to every request that was waiting on the same key.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::token::TokenError;
use crate::tunnel::TunnelKey;

#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("invalid token: {0}")]
    InvalidToken(#[from] TokenError),

    #[error("tunnel to {key} failed: {reason}")]
    TunnelCreationFailed {
        key: TunnelKey,
        reason: String,
        /// Tail of the ssh process's stderr, if any was captured.
        diagnostics: String,
    },

    #[error("tunnel to {key} did not settle within {waited_ms} ms")]
    TunnelTimeout { key: TunnelKey, waited_ms: u64 },

    #[error("local port {local_port} is already forwarding to {holder}")]
    PortConflict { local_port: u16, holder: TunnelKey },

    #[error("relay failed: {0}")]
    RelayFailure(String),
}

impl BrokerError {
    /// Stable machine-readable code used in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidToken(_) => "INVALID_TOKEN",
            Self::TunnelCreationFailed { .. } => "TUNNEL_FAILED",
            Self::TunnelTimeout { .. } => "TUNNEL_TIMEOUT",
            Self::PortConflict { .. } => "PORT_CONFLICT",
            Self::RelayFailure(_) => "RELAY_FAILED",
        }
    }

    /// Short human summary, independent of internal detail.
    pub fn summary(&self) -> &'static str {
        match self {
            Self::InvalidToken(_) => "malformed session",
            Self::TunnelCreationFailed { .. }
            | Self::TunnelTimeout { .. }
            | Self::PortConflict { .. } => "could not reach hypervisor",
            Self::RelayFailure(_) => "session dropped",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidToken(_) => StatusCode::BAD_REQUEST,
            Self::TunnelCreationFailed { .. } | Self::RelayFailure(_) => StatusCode::BAD_GATEWAY,
            Self::TunnelTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::PortConflict { .. } => StatusCode::CONFLICT,
        }
    }
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": self.summary(),
            "code": self.code(),
            "detail": self.to_string(),
        });
        if let Self::TunnelCreationFailed { diagnostics, .. } = &self {
            if !diagnostics.is_empty() {
                body["diagnostics"] = json!(diagnostics);
            }
        }
        (self.status(), Json(body)).into_response()
    }
}
