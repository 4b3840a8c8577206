//! Tunnel supervision: create on demand, reuse while alive, tear down.
//!
//! ## Concurrency
//!
//! The registry sits behind one `tokio::sync::Mutex`. `resolve` checks for a
//! usable entry and, if there is none, inserts a `Starting` placeholder in the
//! same critical section, then releases the lock before spawning ssh and
//! waiting out the health window. Concurrent requests for the same key find
//! the placeholder and wait on its outcome channel instead of spawning, so at
//! most one process is ever started per key. Requests for other keys are never
//! held up by a slow handshake.
//!
//! Creation runs in its own task. A requester that goes away mid-handshake
//! (browser closed the tab) therefore can't strand a placeholder in
//! `Starting`; every placeholder is settled to `Alive` or removed as `Dead`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use super::process::{Liveness, SshLauncher, TunnelLauncher, TunnelProcess};
use super::registry::{Outcome, TunnelRegistry};
use super::{TunnelKey, TunnelState};
use crate::config::TunnelConfig;
use crate::error::BrokerError;
use crate::token::ConnectionToken;

/// Extra time a waiter allows beyond the health window before giving up.
const WAIT_GRACE: Duration = Duration::from_secs(1);

/// Snapshot of a registry entry, returned by [`TunnelSupervisor::list`].
#[derive(Debug, Clone, Serialize)]
pub struct TunnelInfo {
    pub host: String,
    pub remote_port: u16,
    pub vm_id: u32,
    pub local_port: u16,
    pub state: TunnelState,
    pub pid: Option<u32>,
    pub generation: u64,
    pub age_secs: u64,
}

/// Owns the tunnel registry and every tunnel process.
///
/// Cloneable; all clones share the same registry.
#[derive(Clone)]
pub struct TunnelSupervisor {
    registry: Arc<Mutex<TunnelRegistry>>,
    launcher: Arc<dyn TunnelLauncher>,
    base_port: u16,
    /// Address the relay dials to reach a forward.
    local_ip: IpAddr,
    health_window: Duration,
    poll_interval: Duration,
    cleanup_timeout: Duration,
}

enum Claim {
    /// An alive tunnel already serves the key.
    Ready(u16),
    /// Someone else is creating it, or we just started creating it.
    Pending(watch::Receiver<Option<Outcome>>),
}

impl TunnelSupervisor {
    pub fn new(config: &TunnelConfig, launcher: Arc<dyn TunnelLauncher>) -> Self {
        Self {
            registry: Arc::new(Mutex::new(TunnelRegistry::new())),
            launcher,
            base_port: config.base_port,
            local_ip: dial_address(&config.bind_address),
            health_window: Duration::from_millis(config.health_check_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            cleanup_timeout: Duration::from_secs(config.cleanup_timeout_secs),
        }
    }

    /// Supervisor that launches the system ssh client.
    pub fn with_ssh(config: &TunnelConfig) -> Self {
        Self::new(config, Arc::new(SshLauncher::new(config.clone())))
    }

    pub fn base_port(&self) -> u16 {
        self.base_port
    }

    /// Where the relay connects for a tunnel forwarding `local_port`.
    pub fn local_addr(&self, local_port: u16) -> SocketAddr {
        SocketAddr::new(self.local_ip, local_port)
    }

    /// Resolve a token to the local port of a live tunnel, creating the
    /// tunnel if needed.
    pub async fn resolve(&self, token: &ConnectionToken) -> Result<u16, BrokerError> {
        let local_port = token.local_port(self.base_port)?;
        let key = token.key();

        let mut outcome = match self.claim(&key, token.vm_id, local_port).await? {
            Claim::Ready(port) => return Ok(port),
            Claim::Pending(rx) => rx,
        };

        let limit = self.health_window + self.cleanup_timeout + WAIT_GRACE;
        let waited = tokio::time::timeout(limit, outcome.wait_for(Option::is_some))
            .await
            .map(|settled| settled.map(|o| (*o).clone()));
        match waited {
            Ok(Ok(Some(result))) => result,
            Ok(Ok(None)) => Err(BrokerError::TunnelCreationFailed {
                key,
                reason: "tunnel setup produced no outcome".into(),
                diagnostics: String::new(),
            }),
            Ok(Err(_)) => Err(BrokerError::TunnelCreationFailed {
                key,
                reason: "tunnel setup was aborted".into(),
                diagnostics: String::new(),
            }),
            Err(_) => Err(BrokerError::TunnelTimeout {
                key,
                waited_ms: limit.as_millis() as u64,
            }),
        }
    }

    /// Look up `key` under the lock; reuse, wait, or start creating.
    async fn claim(
        &self,
        key: &TunnelKey,
        vm_id: u32,
        local_port: u16,
    ) -> Result<Claim, BrokerError> {
        let mut reg = self.registry.lock().await;

        if let Some(tunnel) = reg.get_mut(key) {
            match tunnel.state() {
                TunnelState::Starting => return Ok(Claim::Pending(tunnel.subscribe())),
                TunnelState::Alive if tunnel.is_usable() => {
                    debug!("Tunnel {key}: reusing localhost:{}", tunnel.local_port);
                    return Ok(Claim::Ready(tunnel.local_port));
                }
                _ => {
                    info!(
                        "Tunnel {key} (gen {}): process gone, replacing",
                        tunnel.generation
                    );
                    tunnel.retire();
                    reg.remove(key);
                }
            }
        }

        if let Some(holder) = reg.port_holder(local_port, key) {
            let stale = reg
                .get_mut(&holder)
                .is_some_and(|t| t.state() == TunnelState::Alive && !t.process_running());
            if stale {
                info!("Tunnel {holder}: process gone, releasing localhost:{local_port}");
                if let Some(mut t) = reg.remove(&holder) {
                    t.retire();
                }
            } else {
                warn!("Tunnel {key}: localhost:{local_port} already forwards to {holder}");
                return Err(BrokerError::PortConflict { local_port, holder });
            }
        }

        let (generation, tx) = reg.insert_placeholder(key.clone(), vm_id, local_port);
        let rx = tx.subscribe();
        drop(reg);

        let this = self.clone();
        let key = key.clone();
        tokio::spawn(async move {
            let outcome = this.establish(&key, local_port, generation).await;
            let _ = tx.send(Some(outcome));
        });

        Ok(Claim::Pending(rx))
    }

    /// Spawn the process, wait out the health window, settle the placeholder.
    ///
    /// The process is attached to the placeholder as soon as it exists, and
    /// every poll re-checks the placeholder under the lock. A `cleanup` or
    /// `shutdown_all` in the meantime takes the process with the entry and
    /// stops it itself; this task then only reports the cancellation.
    async fn establish(&self, key: &TunnelKey, local_port: u16, generation: u64) -> Outcome {
        let started = Instant::now();
        let command = self.launcher.command(key, local_port);

        {
            let mut reg = self.registry.lock().await;
            let Some(tunnel) = reg.get_generation_mut(key, generation) else {
                return Err(cancelled(key));
            };
            match TunnelProcess::spawn(command) {
                Ok(process) => {
                    let pid = process.pid();
                    info!("Tunnel {key} (gen {generation}): pid {pid:?} on localhost:{local_port}");
                    tunnel.attach(process);
                }
                Err(e) => {
                    reg.remove_generation(key, generation);
                    warn!("Tunnel {key}: failed to spawn: {e}");
                    return Err(BrokerError::TunnelCreationFailed {
                        key: key.clone(),
                        reason: format!("failed to spawn tunnel process: {e}"),
                        diagnostics: String::new(),
                    });
                }
            }
        }

        let deadline = tokio::time::Instant::now() + self.health_window;
        loop {
            let mut reg = self.registry.lock().await;
            let Some(tunnel) = reg.get_generation_mut(key, generation) else {
                info!("Tunnel {key} (gen {generation}): cleaned up during setup");
                return Err(cancelled(key));
            };
            let now = tokio::time::Instant::now();
            match tunnel.liveness() {
                Ok(Liveness::Running) if now >= deadline => {
                    if tunnel.promote() {
                        info!("Tunnel {key} (gen {generation}): alive on localhost:{local_port}");
                        return Ok(local_port);
                    }
                    let process = tunnel.retire();
                    reg.remove_generation(key, generation);
                    drop(reg);
                    if let Some(mut process) = process {
                        process.terminate(self.cleanup_timeout).await;
                    }
                    return Err(cancelled(key));
                }
                Ok(Liveness::Running) => {}
                Ok(Liveness::Exited(status)) => {
                    let process = tunnel.retire();
                    reg.remove_generation(key, generation);
                    drop(reg);
                    let diagnostics = match process {
                        Some(mut process) => process.diagnostics().await,
                        None => String::new(),
                    };
                    warn!(
                        "Tunnel {key} (gen {generation}): exited during health check \
                         ({status}): {diagnostics}"
                    );
                    return Err(BrokerError::TunnelCreationFailed {
                        key: key.clone(),
                        reason: format!("tunnel process exited during health check ({status})"),
                        diagnostics,
                    });
                }
                Err(e) => {
                    warn!("Tunnel {key} (gen {generation}): liveness probe failed: {e}");
                    let process = tunnel.retire();
                    reg.remove_generation(key, generation);
                    drop(reg);
                    if let Some(mut process) = process {
                        process.terminate(self.cleanup_timeout).await;
                    }
                    return Err(BrokerError::TunnelTimeout {
                        key: key.clone(),
                        waited_ms: started.elapsed().as_millis() as u64,
                    });
                }
            }
            drop(reg);
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Tear down the tunnel for `key`. Best-effort and idempotent: returns
    /// whether an entry existed, never fails.
    ///
    /// Holds the registry lock through the bounded signal-and-wait so a new
    /// `resolve` for the same key can't race the dying process for its port.
    pub async fn cleanup(&self, key: &TunnelKey) -> bool {
        let mut reg = self.registry.lock().await;
        let Some(mut tunnel) = reg.remove(key) else {
            debug!("Tunnel {key}: cleanup on absent key");
            return false;
        };
        let previous = tunnel.state();
        if let Some(mut process) = tunnel.retire() {
            process.terminate(self.cleanup_timeout).await;
        }
        info!(
            "Tunnel {key} (gen {}): cleaned up (was {})",
            tunnel.generation,
            previous.as_str()
        );
        true
    }

    /// Remove alive tunnels whose process has exited. Returns removed keys.
    pub async fn sweep(&self) -> Vec<TunnelKey> {
        let mut reg = self.registry.lock().await;
        let mut dead = Vec::new();
        for tunnel in reg.iter_mut() {
            if tunnel.state() == TunnelState::Alive && !tunnel.process_running() {
                dead.push(tunnel.key.clone());
            }
        }
        for key in &dead {
            if let Some(mut tunnel) = reg.remove(key) {
                tunnel.retire();
                info!("Tunnel {key} (gen {}): process exited, removed", tunnel.generation);
            }
        }
        dead
    }

    /// Terminate every tunnel and empty the registry (used during shutdown).
    ///
    /// Sends SIGTERM to all at once and waits up to the cleanup timeout;
    /// survivors are SIGKILLed when their handles drop.
    pub async fn shutdown_all(&self) -> usize {
        let mut processes: Vec<TunnelProcess> = {
            let mut reg = self.registry.lock().await;
            reg.drain().filter_map(|mut t| t.retire()).collect()
        };
        let count = processes.len();
        if count == 0 {
            return 0;
        }

        for process in &mut processes {
            process.signal_terminate();
        }

        let deadline = tokio::time::Instant::now() + self.cleanup_timeout;
        while tokio::time::Instant::now() < deadline {
            if processes.iter_mut().all(|p| !p.is_running()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        drop(processes);
        info!("Shut down {count} tunnel(s)");
        count
    }

    /// Snapshot of all entries.
    pub async fn list(&self) -> Vec<TunnelInfo> {
        let reg = self.registry.lock().await;
        let mut items: Vec<TunnelInfo> = reg
            .iter()
            .map(|t| TunnelInfo {
                host: t.key.host.clone(),
                remote_port: t.key.port,
                vm_id: t.vm_id,
                local_port: t.local_port,
                state: t.state(),
                pid: t.pid(),
                generation: t.generation,
                age_secs: t.created_at.elapsed().as_secs(),
            })
            .collect();
        items.sort_by_key(|i| i.local_port);
        items
    }

    /// Snapshot of one entry.
    pub async fn get(&self, key: &TunnelKey) -> Option<TunnelInfo> {
        self.list()
            .await
            .into_iter()
            .find(|i| i.host == key.host && i.remote_port == key.port)
    }

    /// `(starting, alive)` entry counts.
    pub async fn counts(&self) -> (usize, usize) {
        let reg = self.registry.lock().await;
        reg.iter().fold((0, 0), |(s, a), t| match t.state() {
            TunnelState::Starting => (s + 1, a),
            TunnelState::Alive => (s, a + 1),
            TunnelState::Dead => (s, a),
        })
    }
}

/// The forward's bind address, or loopback when it binds a wildcard.
fn dial_address(bind_address: &str) -> IpAddr {
    match bind_address.parse::<IpAddr>() {
        Ok(ip) if !ip.is_unspecified() => ip,
        _ => IpAddr::V4(Ipv4Addr::LOCALHOST),
    }
}

fn cancelled(key: &TunnelKey) -> BrokerError {
    BrokerError::TunnelCreationFailed {
        key: key.clone(),
        reason: "tunnel was cleaned up before it became ready".into(),
        diagnostics: String::new(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::process::Command;

    use super::*;

    /// Launches `sh -c <script>` and counts spawns.
    pub(crate) struct ScriptLauncher {
        script: String,
        pub spawned: AtomicUsize,
    }

    impl ScriptLauncher {
        pub(crate) fn new(script: &str) -> Arc<Self> {
            Arc::new(Self {
                script: script.to_string(),
                spawned: AtomicUsize::new(0),
            })
        }

        pub(crate) fn count(&self) -> usize {
            self.spawned.load(Ordering::SeqCst)
        }
    }

    impl TunnelLauncher for ScriptLauncher {
        fn command(&self, _key: &TunnelKey, _local_port: u16) -> Command {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            let mut cmd = Command::new("sh");
            cmd.args(["-c", &self.script]);
            cmd
        }
    }

    pub(crate) const STAYS_UP: &str = "exec sleep 30";
    pub(crate) const FAILS: &str =
        "echo 'ssh: connect to host 10.0.0.5 port 22: No route to host' >&2; exit 255";

    pub(crate) fn test_config() -> TunnelConfig {
        TunnelConfig {
            base_port: 15000,
            health_check_ms: 200,
            poll_interval_ms: 10,
            cleanup_timeout_secs: 2,
            ..TunnelConfig::default()
        }
    }

    pub(crate) fn supervisor(launcher: &Arc<ScriptLauncher>) -> TunnelSupervisor {
        TunnelSupervisor::new(&test_config(), launcher.clone())
    }

    fn token(raw: &str) -> ConnectionToken {
        ConnectionToken::parse(raw).unwrap()
    }

    #[test]
    fn test_dial_address() {
        assert_eq!(dial_address("127.0.0.1"), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(dial_address("0.0.0.0"), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(dial_address("localhost"), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(dial_address("10.1.2.3"), "10.1.2.3".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_resolve_then_reuse() {
        let launcher = ScriptLauncher::new(STAYS_UP);
        let sup = supervisor(&launcher);
        let t = token("101_10.0.0.5_5901");

        assert_eq!(sup.resolve(&t).await.unwrap(), 15101);
        assert_eq!(launcher.count(), 1);
        let info = sup.get(&t.key()).await.unwrap();
        assert_eq!(info.state, TunnelState::Alive);
        assert!(info.pid.is_some());

        assert_eq!(sup.resolve(&t).await.unwrap(), 15101);
        assert_eq!(launcher.count(), 1);
        assert_eq!(sup.get(&t.key()).await.unwrap().generation, info.generation);

        sup.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_concurrent_first_resolves_spawn_once() {
        let launcher = ScriptLauncher::new(STAYS_UP);
        let sup = supervisor(&launcher);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let sup = sup.clone();
                tokio::spawn(async move { sup.resolve(&token("7_10.0.0.9_5907")).await })
            })
            .collect();
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), 15007);
        }
        assert_eq!(launcher.count(), 1);
        assert_eq!(sup.counts().await, (0, 1));

        sup.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_unrelated_keys_do_not_serialize() {
        let launcher = ScriptLauncher::new(STAYS_UP);
        let sup = supervisor(&launcher);

        let (t1, t2, t3) = (token("1_h1_5901"), token("2_h2_5902"), token("3_h3_5903"));
        let started = Instant::now();
        let (a, b, c) = tokio::join!(sup.resolve(&t1), sup.resolve(&t2), sup.resolve(&t3));
        assert_eq!((a.unwrap(), b.unwrap(), c.unwrap()), (15001, 15002, 15003));
        assert_eq!(launcher.count(), 3);
        // Three sequential health windows would take at least 600 ms.
        assert!(started.elapsed() < Duration::from_millis(590));

        sup.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_early_exit_fails_with_diagnostics() {
        let launcher = ScriptLauncher::new(FAILS);
        let sup = supervisor(&launcher);
        let t = token("101_10.0.0.5_5901");

        match sup.resolve(&t).await {
            Err(BrokerError::TunnelCreationFailed { diagnostics, .. }) => {
                assert!(diagnostics.contains("No route to host"));
            }
            other => panic!("expected TunnelCreationFailed, got {other:?}"),
        }
        assert!(sup.get(&t.key()).await.is_none());
        assert_eq!(sup.counts().await, (0, 0));
    }

    #[tokio::test]
    async fn test_concurrent_waiters_share_failure() {
        let launcher = ScriptLauncher::new(FAILS);
        let sup = supervisor(&launcher);
        let t = token("5_10.0.0.5_5905");

        let (a, b) = tokio::join!(sup.resolve(&t), sup.resolve(&t));
        assert!(matches!(a, Err(BrokerError::TunnelCreationFailed { .. })));
        assert!(matches!(b, Err(BrokerError::TunnelCreationFailed { .. })));
        assert_eq!(launcher.count(), 1);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        struct Missing;
        impl TunnelLauncher for Missing {
            fn command(&self, _key: &TunnelKey, _local_port: u16) -> Command {
                Command::new("/nonexistent/ssh")
            }
        }
        let sup = TunnelSupervisor::new(&test_config(), Arc::new(Missing));
        let t = token("1_10.0.0.5_5901");
        assert!(matches!(
            sup.resolve(&t).await,
            Err(BrokerError::TunnelCreationFailed { .. })
        ));
        assert!(sup.get(&t.key()).await.is_none());
    }

    #[tokio::test]
    async fn test_invalid_local_port_spawns_nothing() {
        let launcher = ScriptLauncher::new(STAYS_UP);
        let sup = supervisor(&launcher);
        assert!(matches!(
            sup.resolve(&token("60000_10.0.0.5_5901")).await,
            Err(BrokerError::InvalidToken(_))
        ));
        assert_eq!(launcher.count(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_absent_is_noop() {
        let launcher = ScriptLauncher::new(STAYS_UP);
        let sup = supervisor(&launcher);
        let key = TunnelKey::new("10.0.0.5".into(), 5901);
        assert!(!sup.cleanup(&key).await);
        assert!(!sup.cleanup(&key).await);
    }

    #[tokio::test]
    async fn test_cleanup_then_resolve_spawns_new_process() {
        let launcher = ScriptLauncher::new(STAYS_UP);
        let sup = supervisor(&launcher);
        let t = token("101_10.0.0.5_5901");

        sup.resolve(&t).await.unwrap();
        let first = sup.get(&t.key()).await.unwrap();

        assert!(sup.cleanup(&t.key()).await);
        assert!(sup.get(&t.key()).await.is_none());
        assert!(!sup.cleanup(&t.key()).await);

        assert_eq!(sup.resolve(&t).await.unwrap(), 15101);
        let second = sup.get(&t.key()).await.unwrap();
        assert_eq!(launcher.count(), 2);
        assert!(second.generation > first.generation);
        assert_ne!(second.pid, first.pid);

        sup.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_cleanup_during_setup_stops_process() {
        let launcher = ScriptLauncher::new(STAYS_UP);
        let sup = supervisor(&launcher);
        let t = token("4_10.0.0.5_5904");

        let pending = {
            let sup = sup.clone();
            let t = t.clone();
            tokio::spawn(async move { sup.resolve(&t).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let info = sup.get(&t.key()).await.unwrap();
        assert_eq!(info.state, TunnelState::Starting);
        let pid = i32::try_from(info.pid.unwrap()).unwrap();

        assert!(sup.cleanup(&t.key()).await);
        // Stopped and reaped before cleanup returned; the port is free again.
        assert_eq!(
            nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None),
            Err(nix::errno::Errno::ESRCH)
        );

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(BrokerError::TunnelCreationFailed { .. })));
        assert!(sup.get(&t.key()).await.is_none());

        assert_eq!(sup.resolve(&t).await.unwrap(), 15004);
        assert_eq!(launcher.count(), 2);
        sup.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_shutdown_during_setup_stops_process() {
        let launcher = ScriptLauncher::new(STAYS_UP);
        let sup = supervisor(&launcher);
        let t = token("6_10.0.0.5_5906");

        let pending = {
            let sup = sup.clone();
            let t = t.clone();
            tokio::spawn(async move { sup.resolve(&t).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sup.shutdown_all().await, 1);
        assert!(pending.await.unwrap().is_err());
        assert_eq!(sup.counts().await, (0, 0));
    }

    /// Takes longer to build its command than any waiter is willing to wait.
    struct SlowLauncher {
        delay: Duration,
    }

    impl TunnelLauncher for SlowLauncher {
        fn command(&self, _key: &TunnelKey, _local_port: u16) -> Command {
            std::thread::sleep(self.delay);
            let mut cmd = Command::new("sh");
            cmd.args(["-c", STAYS_UP]);
            cmd
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_waiter_times_out_on_stalled_setup() {
        let config = TunnelConfig {
            cleanup_timeout_secs: 0,
            ..test_config()
        };
        // Waiters give up after 200 ms health + 0 s cleanup + 1 s grace.
        let launcher = Arc::new(SlowLauncher {
            delay: Duration::from_millis(1600),
        });
        let sup = TunnelSupervisor::new(&config, launcher);
        let t = token("12_10.0.0.5_5912");

        let err = sup.resolve(&t).await.unwrap_err();
        assert!(matches!(err, BrokerError::TunnelTimeout { waited_ms: 1200, .. }));
        assert_eq!(err.status(), axum::http::StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(err.code(), "TUNNEL_TIMEOUT");

        // The creator still settles the entry; nothing stays Starting.
        let deadline = Instant::now() + Duration::from_secs(5);
        while sup.counts().await.0 != 0 {
            assert!(Instant::now() < deadline, "entry stuck in Starting");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(sup.counts().await, (0, 1));
        sup.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_dead_process_is_replaced_on_resolve() {
        let launcher = ScriptLauncher::new("sleep 0.4");
        let sup = supervisor(&launcher);
        let t = token("8_10.0.0.5_5908");

        sup.resolve(&t).await.unwrap();
        let first = sup.get(&t.key()).await.unwrap().generation;
        tokio::time::sleep(Duration::from_millis(500)).await;

        // Process has exited; the next resolve must not reuse it. The new
        // process lives ~400 ms, longer than the 200 ms health window.
        sup.resolve(&t).await.unwrap();
        assert_eq!(launcher.count(), 2);
        assert!(sup.get(&t.key()).await.unwrap().generation > first);

        sup.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_sweep_removes_exited() {
        let launcher = ScriptLauncher::new("sleep 0.4");
        let sup = supervisor(&launcher);
        let t = token("9_10.0.0.5_5909");

        sup.resolve(&t).await.unwrap();
        assert!(sup.sweep().await.is_empty());
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(sup.sweep().await, vec![t.key()]);
        assert!(sup.get(&t.key()).await.is_none());
    }

    #[tokio::test]
    async fn test_port_conflict_across_hosts() {
        let launcher = ScriptLauncher::new(STAYS_UP);
        let sup = supervisor(&launcher);

        sup.resolve(&token("101_cluster-a_5901")).await.unwrap();
        match sup.resolve(&token("101_cluster-b_5901")).await {
            Err(BrokerError::PortConflict { local_port, holder }) => {
                assert_eq!(local_port, 15101);
                assert_eq!(holder.host, "cluster-a");
            }
            other => panic!("expected PortConflict, got {other:?}"),
        }
        assert_eq!(launcher.count(), 1);

        sup.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_shutdown_all_empties_registry() {
        let launcher = ScriptLauncher::new(STAYS_UP);
        let sup = supervisor(&launcher);
        sup.resolve(&token("1_h1_5901")).await.unwrap();
        sup.resolve(&token("2_h2_5902")).await.unwrap();

        assert_eq!(sup.shutdown_all().await, 2);
        assert!(sup.list().await.is_empty());
        assert_eq!(sup.shutdown_all().await, 0);
    }
}
