//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::tunnel::TunnelSupervisor;

/// Shared application state for the broker.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Owner of the tunnel registry and every ssh process.
    pub supervisor: TunnelSupervisor,
    /// Relay session counters.
    pub relay_stats: Arc<RelayCounters>,
}

impl AppState {
    pub fn new(config: Config, supervisor: TunnelSupervisor) -> Self {
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            supervisor,
            relay_stats: Arc::new(RelayCounters::default()),
        }
    }
}

/// Lock-free relay counters, updated on session start and end.
#[derive(Default)]
pub struct RelayCounters {
    pub active: AtomicUsize,
    pub total: AtomicU64,
    pub failed: AtomicU64,
    pub bytes_to_target: AtomicU64,
    pub bytes_to_browser: AtomicU64,
}

impl RelayCounters {
    /// Count a session as active until the returned guard drops.
    pub fn session(self: &Arc<Self>) -> SessionGuard {
        self.active.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
        SessionGuard(Arc::clone(self))
    }
}

/// Decrements [`RelayCounters::active`] on drop.
pub struct SessionGuard(Arc<RelayCounters>);

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::Relaxed);
    }
}
