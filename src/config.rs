//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `VNCGATE_LISTEN`, `VNCGATE_API_KEY`,
//!    `VNCGATE_BASE_PORT`, `VNCGATE_SSH_USER`
//! 2. **Config file** — path via `--config <path>`, or `vncgate.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:6080"
//! max_connections = 64
//! sweep_interval_secs = 30
//!
//! [tunnel]
//! base_port = 15000                  # local port = base_port + vm id
//! ssh_binary = "ssh"
//! ssh_user = "root"
//! ssh_port = 22                      # optional
//! identity_file = "/etc/vncgate/id_ed25519"   # optional
//! bind_address = "127.0.0.1"
//! remote_bind_host = "localhost"
//! health_check_ms = 1000
//! poll_interval_ms = 50
//! cleanup_timeout_secs = 5
//! server_alive_interval_secs = 30
//! extra_options = ["ConnectTimeout=5"]
//!
//! [relay]
//! connect_attempts = 5
//! connect_retry_ms = 200
//! buffer_size = 65536
//!
//! # Optional. Omit to disable the /api/tunnels and /api/resolve endpoints
//! [auth]
//! api_key = "your-secret-key"
//!
//! # Optional. Serve the noVNC client from the same origin
//! [web]
//! root = "/usr/share/novnc"
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:6080`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum in-flight admin API requests (default 64). Console WebSockets
    /// are not counted once upgraded.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Seconds between sweeps for tunnels whose process exited (default 30).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

/// SSH tunnel settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Local forward port is `base_port + vm_id` (default 15000).
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    /// ssh client binary (default `ssh`).
    #[serde(default = "default_ssh_binary")]
    pub ssh_binary: String,
    /// Remote login user (default `root`).
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    /// Remote sshd port; ssh's own default when unset.
    #[serde(default)]
    pub ssh_port: Option<u16>,
    /// Private key passed with `-i`; ssh's own lookup when unset.
    #[serde(default)]
    pub identity_file: Option<String>,
    /// Local address the forward listens on (default `127.0.0.1`).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Address the hypervisor side connects to (default `localhost`).
    #[serde(default = "default_remote_bind_host")]
    pub remote_bind_host: String,
    /// How long a new tunnel must stay up to count as alive (default 1000 ms).
    #[serde(default = "default_health_check_ms")]
    pub health_check_ms: u64,
    /// Liveness poll period inside the health window (default 50 ms).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Grace period between SIGTERM and SIGKILL on cleanup (default 5 s).
    #[serde(default = "default_cleanup_timeout")]
    pub cleanup_timeout_secs: u64,
    /// ssh `ServerAliveInterval` (default 30 s).
    #[serde(default = "default_server_alive_interval")]
    pub server_alive_interval_secs: u64,
    /// Additional `-o` options, e.g. `ConnectTimeout=5`.
    #[serde(default)]
    pub extra_options: Vec<String>,
}

/// WebSocket ↔ TCP relay settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// TCP connect attempts to the local forward (default 5).
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    /// Delay between connect attempts (default 200 ms).
    #[serde(default = "default_connect_retry_ms")]
    pub connect_retry_ms: u64,
    /// Read buffer for the TCP → WebSocket direction (default 64 KiB).
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

/// Admin API authentication.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared Bearer token. Override with `VNCGATE_API_KEY`.
    /// Admin endpoints are not mounted when unset.
    #[serde(default)]
    pub api_key: Option<String>,
}

/// Static file serving.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebConfig {
    /// Directory served as the router fallback (e.g. a noVNC checkout).
    #[serde(default)]
    pub root: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:6080".to_string()
}
fn default_max_connections() -> usize {
    64
}
fn default_sweep_interval() -> u64 {
    30
}
fn default_base_port() -> u16 {
    15000
}
fn default_ssh_binary() -> String {
    "ssh".to_string()
}
fn default_ssh_user() -> String {
    "root".to_string()
}
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}
fn default_remote_bind_host() -> String {
    "localhost".to_string()
}
fn default_health_check_ms() -> u64 {
    1000
}
fn default_poll_interval_ms() -> u64 {
    50
}
fn default_cleanup_timeout() -> u64 {
    5
}
fn default_server_alive_interval() -> u64 {
    30
}
fn default_connect_attempts() -> u32 {
    5
}
fn default_connect_retry_ms() -> u64 {
    200
}
fn default_buffer_size() -> usize {
    64 * 1024
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            base_port: default_base_port(),
            ssh_binary: default_ssh_binary(),
            ssh_user: default_ssh_user(),
            ssh_port: None,
            identity_file: None,
            bind_address: default_bind_address(),
            remote_bind_host: default_remote_bind_host(),
            health_check_ms: default_health_check_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            cleanup_timeout_secs: default_cleanup_timeout(),
            server_alive_interval_secs: default_server_alive_interval(),
            extra_options: Vec::new(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_attempts: default_connect_attempts(),
            connect_retry_ms: default_connect_retry_ms(),
            buffer_size: default_buffer_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `vncgate.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            Self::from_toml(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("vncgate.toml").exists() {
            let content =
                std::fs::read_to_string("vncgate.toml").expect("Failed to read vncgate.toml");
            Self::from_toml(&content).expect("Failed to parse vncgate.toml")
        } else {
            Config::default()
        };

        config.apply_env(|name| std::env::var(name).ok());
        config
    }

    /// Parse a TOML document. An empty `auth.api_key` counts as unset.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        let mut config: Self = toml::from_str(content)?;
        config.auth.api_key = config.auth.api_key.filter(|k| !k.is_empty());
        Ok(config)
    }

    /// Apply env var overrides. `lookup` is `std::env::var` outside tests.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(listen) = lookup("VNCGATE_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(key) = lookup("VNCGATE_API_KEY") {
            self.auth.api_key = Some(key).filter(|k| !k.is_empty());
        }
        if let Some(port) = lookup("VNCGATE_BASE_PORT") {
            match port.parse() {
                Ok(p) => self.tunnel.base_port = p,
                Err(e) => panic!("Invalid VNCGATE_BASE_PORT {port:?}: {e}"),
            }
        }
        if let Some(user) = lookup("VNCGATE_SSH_USER") {
            self.tunnel.ssh_user = user;
        }
    }
}
