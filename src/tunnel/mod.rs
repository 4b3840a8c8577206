//! On-demand SSH tunnels to hypervisor console ports.
//!
//! ```text
//! process.rs     — TunnelLauncher (ssh command), TunnelProcess (child wrapper)
//! registry.rs    — TunnelRegistry: key → Tunnel table, guarded by the supervisor
//! supervisor.rs  — TunnelSupervisor: resolve / cleanup / sweep / shutdown_all
//! ```
//!
//! ## Tunnel state machine
//!
//! ```text
//!   Starting ──(alive after health window)──▶ Alive
//!      │                                        │
//!      └──(exited / cancelled)──▶ Dead ◀────────┘ (exit detected, cleanup)
//! ```
//!
//! `Dead` is terminal for a [`Tunnel`] instance. The next request for the key
//! creates a new instance with a new generation number.

pub mod process;
pub mod registry;
pub mod supervisor;

use std::fmt;

use serde::Serialize;

pub use process::{SshLauncher, TunnelLauncher, TunnelProcess};
pub use registry::{Tunnel, TunnelRegistry};
pub use supervisor::{TunnelInfo, TunnelSupervisor};

/// Identifies one physical tunnel: the hypervisor host and its console port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TunnelKey {
    pub host: String,
    pub port: u16,
}

impl TunnelKey {
    pub fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }
}

impl fmt::Display for TunnelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Lifecycle state of a [`Tunnel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    Starting,
    Alive,
    Dead,
}

impl TunnelState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Alive => "alive",
            Self::Dead => "dead",
        }
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_become(self, next: TunnelState) -> bool {
        matches!(
            (self, next),
            (Self::Starting, Self::Alive | Self::Dead) | (Self::Alive, Self::Dead)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display() {
        assert_eq!(TunnelKey::new("10.0.0.5".into(), 5901).to_string(), "10.0.0.5:5901");
        assert_eq!(TunnelKey::new("fd00::1".into(), 5900).to_string(), "[fd00::1]:5900");
    }

    #[test]
    fn test_state_transitions() {
        use TunnelState::{Alive, Dead, Starting};
        assert!(Starting.can_become(Alive));
        assert!(Starting.can_become(Dead));
        assert!(Alive.can_become(Dead));
        assert!(!Dead.can_become(Alive));
        assert!(!Dead.can_become(Starting));
        assert!(!Alive.can_become(Starting));
    }
}
