//! Console connection tokens.
//!
//! The upstream console-ticket issuer hands the browser an opaque token of the
//! form `{vm_id}_{host}_{remote_port}`, e.g. `101_10.0.0.5_5901`. Parsing is
//! pure: no I/O happens here, and a malformed token is rejected before any
//! tunnel process is considered.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::tunnel::TunnelKey;

/// Field separator inside a token.
pub const TOKEN_DELIMITER: char = '_';

/// Why a token was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("no token supplied")]
    Missing,
    #[error("expected 3 '_'-separated fields, found {0}")]
    FieldCount(usize),
    #[error("vm id {0:?} is not a valid integer")]
    VmId(String),
    #[error("remote port {0:?} is not a valid port number")]
    RemotePort(String),
    #[error("host {0:?} is not a valid hostname or address")]
    Host(String),
    #[error("local port {base_port} + vm id {vm_id} exceeds 65535")]
    LocalPortOutOfRange { base_port: u16, vm_id: u32 },
}

/// A decoded console session request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionToken {
    pub vm_id: u32,
    pub host: String,
    pub remote_port: u16,
}

impl ConnectionToken {
    /// Parse a raw token string.
    pub fn parse(raw: &str) -> Result<Self, TokenError> {
        let fields: Vec<&str> = raw.split(TOKEN_DELIMITER).collect();
        let [vm_id, host, remote_port] = fields.as_slice() else {
            return Err(TokenError::FieldCount(fields.len()));
        };

        let vm_id = vm_id
            .parse::<u32>()
            .map_err(|_| TokenError::VmId((*vm_id).to_string()))?;

        if !is_valid_host(host) {
            return Err(TokenError::Host((*host).to_string()));
        }

        let remote_port = match remote_port.parse::<u16>() {
            Ok(p) if p > 0 => p,
            _ => return Err(TokenError::RemotePort((*remote_port).to_string())),
        };

        Ok(Self {
            vm_id,
            host: (*host).to_string(),
            remote_port,
        })
    }

    /// The registry key for the tunnel serving this token.
    pub fn key(&self) -> TunnelKey {
        TunnelKey::new(self.host.clone(), self.remote_port)
    }

    /// Deterministic local forward port: `base_port + vm_id`.
    pub fn local_port(&self, base_port: u16) -> Result<u16, TokenError> {
        u32::from(base_port)
            .checked_add(self.vm_id)
            .and_then(|p| u16::try_from(p).ok())
            .ok_or(TokenError::LocalPortOutOfRange {
                base_port,
                vm_id: self.vm_id,
            })
    }
}

impl FromStr for ConnectionToken {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ConnectionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{TOKEN_DELIMITER}{}{TOKEN_DELIMITER}{}",
            self.vm_id, self.host, self.remote_port
        )
    }
}

/// Hostnames, IPv4 literals and bare IPv6 literals.
///
/// A leading `-` is refused because the host ends up on the ssh command line.
fn is_valid_host(host: &str) -> bool {
    !host.is_empty()
        && host.len() <= 253
        && !host.starts_with('-')
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':'))
}
