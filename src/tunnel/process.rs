//! SSH port-forward processes.
//!
//! A [`TunnelLauncher`] builds the command for one forward; [`TunnelProcess`]
//! owns the running child. The child is spawned in its own process group with
//! `kill_on_drop(true)`, so a tunnel that is dropped on any path (error,
//! cancellation, shutdown) never outlives its owner. Orderly teardown goes
//! through [`TunnelProcess::terminate`] (SIGTERM, bounded wait, SIGKILL).
//!
//! stderr is drained continuously into a small tail buffer. ssh writes little
//! once the forward is up, but an undrained pipe would eventually block it, and
//! the tail is what gets reported when a tunnel dies during its health check.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use super::TunnelKey;
use crate::config::TunnelConfig;

/// Bytes of stderr kept for diagnostics.
const MAX_DIAGNOSTICS: usize = 4096;

/// How long to wait for the stderr drain to hit EOF after the child exited.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Builds the command that forwards `local_port` to the tunnel key's target.
///
/// The supervisor only ever calls [`TunnelLauncher::command`]; stdio, process
/// group and kill-on-drop are applied by [`TunnelProcess::spawn`].
pub trait TunnelLauncher: Send + Sync + 'static {
    fn command(&self, key: &TunnelKey, local_port: u16) -> Command;
}

/// Launches the system `ssh` client in non-interactive forward-only mode.
pub struct SshLauncher {
    config: TunnelConfig,
}

impl SshLauncher {
    pub fn new(config: TunnelConfig) -> Self {
        Self { config }
    }

    /// Arguments passed to ssh, excluding the binary itself.
    pub fn args(&self, key: &TunnelKey, local_port: u16) -> Vec<String> {
        let c = &self.config;
        let mut args: Vec<String> = vec!["-N".into()];
        for opt in [
            "BatchMode=yes".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "ExitOnForwardFailure=yes".to_string(),
            "LogLevel=ERROR".to_string(),
            format!("ServerAliveInterval={}", c.server_alive_interval_secs),
        ] {
            args.push("-o".into());
            args.push(opt);
        }
        for opt in &c.extra_options {
            args.push("-o".into());
            args.push(opt.clone());
        }
        if let Some(ref identity) = c.identity_file {
            args.push("-i".into());
            args.push(identity.clone());
        }
        if let Some(port) = c.ssh_port {
            args.push("-p".into());
            args.push(port.to_string());
        }
        args.push("-L".into());
        args.push(format!(
            "{}:{local_port}:{}:{}",
            c.bind_address, c.remote_bind_host, key.port
        ));
        args.push(format!("{}@{}", c.ssh_user, key.host));
        args
    }
}

impl TunnelLauncher for SshLauncher {
    fn command(&self, key: &TunnelKey, local_port: u16) -> Command {
        let mut cmd = Command::new(&self.config.ssh_binary);
        cmd.args(self.args(key, local_port));
        cmd
    }
}

/// Result of a non-blocking liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Running,
    Exited(ExitStatus),
}

/// A running tunnel child process.
pub struct TunnelProcess {
    child: Child,
    pid: Option<u32>,
    stderr_tail: Arc<Mutex<Vec<u8>>>,
    drain_task: Option<JoinHandle<()>>,
}

impl TunnelProcess {
    /// Spawn `cmd` with null stdin/stdout, piped stderr, in its own process
    /// group so a Ctrl-C on the broker's terminal isn't delivered to it.
    pub fn spawn(mut cmd: Command) -> std::io::Result<Self> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // SAFETY: setpgid is async-signal-safe per POSIX.
        unsafe {
            cmd.pre_exec(|| {
                libc::setpgid(0, 0);
                Ok(())
            });
        }
        let mut child = cmd.spawn()?;
        let pid = child.id();

        let stderr_tail = Arc::new(Mutex::new(Vec::new()));
        let drain_task = child.stderr.take().map(|mut stderr| {
            let tail = Arc::clone(&stderr_tail);
            tokio::spawn(async move {
                let mut tmp = [0u8; 1024];
                loop {
                    match stderr.read(&mut tmp).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let mut buf = tail.lock().await;
                            buf.extend_from_slice(&tmp[..n]);
                            if buf.len() > MAX_DIAGNOSTICS {
                                let excess = buf.len() - MAX_DIAGNOSTICS;
                                buf.drain(..excess);
                            }
                        }
                    }
                }
            })
        });

        Ok(Self {
            child,
            pid,
            stderr_tail,
            drain_task,
        })
    }

    /// OS process id captured at spawn time.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Non-blocking probe; reaps the child if it has exited.
    pub fn liveness(&mut self) -> std::io::Result<Liveness> {
        Ok(match self.child.try_wait()? {
            None => Liveness::Running,
            Some(status) => Liveness::Exited(status),
        })
    }

    /// Convenience over [`Self::liveness`]; a failed probe counts as not running.
    pub fn is_running(&mut self) -> bool {
        matches!(self.liveness(), Ok(Liveness::Running))
    }

    /// Captured stderr, trimmed. Waits briefly for the drain to reach EOF so
    /// the output of a process that just exited is complete.
    pub async fn diagnostics(&mut self) -> String {
        if let Some(task) = self.drain_task.take() {
            if tokio::time::timeout(DRAIN_GRACE, task).await.is_err() {
                debug!("stderr drain for pid {:?} still open, partial output", self.pid);
            }
        }
        let buf = self.stderr_tail.lock().await;
        String::from_utf8_lossy(&buf).trim().to_string()
    }

    /// Send SIGTERM if the process is still running. Never blocks.
    pub fn signal_terminate(&mut self) {
        if !self.is_running() {
            return;
        }
        let Some(pid) = self.pid.and_then(|p| i32::try_from(p).ok()) else {
            return;
        };
        if let Err(e) = signal::kill(Pid::from_raw(pid), Signal::SIGTERM) {
            debug!("SIGTERM to pid {pid} failed: {e}");
        }
    }

    /// SIGTERM, wait up to `grace` for exit, then SIGKILL. Errors are
    /// swallowed: the process may already be gone.
    pub async fn terminate(&mut self, grace: Duration) {
        if !self.is_running() {
            return;
        }
        self.signal_terminate();
        if tokio::time::timeout(grace, self.child.wait()).await.is_err() {
            debug!("pid {:?} ignored SIGTERM for {grace:?}, killing", self.pid);
            if let Err(e) = self.child.kill().await {
                debug!("SIGKILL to pid {:?} failed: {e}", self.pid);
            }
        }
    }
}

impl Drop for TunnelProcess {
    fn drop(&mut self) {
        if let Some(task) = self.drain_task.take() {
            task.abort();
        }
    }
}
