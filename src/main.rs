#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # vncgate
//!
//! SSH-tunnel broker for browser VNC consoles.
//!
//! A browser running noVNC opens a WebSocket carrying a token
//! `{vm_id}_{host}_{remote_port}`. vncgate ensures an `ssh -L` forward to the
//! hypervisor exists on `127.0.0.1:{base_port + vm_id}`, then relays bytes
//! between the WebSocket and that forward. One tunnel serves every concurrent
//! viewer of the same `(host, remote_port)`.
//!
//! ## Subcommands
//!
//! - `vncgate serve` (default) — run the HTTP/WS server
//! - `vncgate resolve <TOKEN>` — open one tunnel, print its local address and
//!   hold it until Ctrl-C
//! - `vncgate check-token <TOKEN>` — validate a token without side effects
//!
//! ## API surface
//!
//! | Method | Path                       | Auth | Description                    |
//! |--------|----------------------------|------|--------------------------------|
//! | GET    | `/websockify?token=<t>`    | No   | Console WebSocket              |
//! | GET    | `/ws/{token}`              | No   | Console WebSocket (path form)  |
//! | GET    | `/api/health`              | No   | Liveness probe                 |
//! | GET    | `/api/tunnels`             | Yes* | List tunnels                   |
//! | POST   | `/api/resolve`             | Yes* | Resolve a token                |
//! | DELETE | `/api/tunnels/{host}/{port}` | Yes* | Tear down one tunnel         |
//!
//! *Admin routes are mounted only when `auth.api_key` is configured.
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, sweep task, graceful shutdown
//! token.rs         — ConnectionToken parsing
//! error.rs         — BrokerError and its HTTP mapping
//! config.rs        — TOML + env-var configuration
//! auth.rs          — Bearer token middleware, constant-time comparison
//! relay.rs         — local connect with retry, WebSocket ⇄ TCP bridge
//! state.rs         — AppState, relay counters
//! routes/
//!   console.rs     — GET /websockify, GET /ws/{token}
//!   health.rs      — GET /api/health
//!   tunnels.rs     — admin API
//! tunnel/
//!   mod.rs         — TunnelKey, TunnelState
//!   process.rs     — ssh command line, process handle, stderr tail
//!   registry.rs    — key → tunnel entries with generations
//!   supervisor.rs  — resolve, cleanup, sweep, shutdown
//! ```

use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{info, warn};

use vncgate::{routes, AppState, Config, ConnectionToken, TunnelSupervisor};

/// SSH-tunnel broker for browser VNC consoles.
#[derive(Parser)]
#[command(name = "vncgate", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
        /// Override `server.listen`.
        #[arg(long)]
        listen: Option<String>,
    },
    /// Open a tunnel for TOKEN, print the local address and hold it until Ctrl-C.
    Resolve {
        token: String,
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Parse TOKEN and print its fields; exits non-zero if it is malformed.
    CheckToken { token: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve { config, listen }) => {
            run_server(config.as_deref(), listen).await;
        }
        Some(Commands::Resolve { token, config }) => {
            run_resolve(&token, config.as_deref()).await;
        }
        Some(Commands::CheckToken { token }) => check_token(&token),
        None => run_server(None, None).await,
    }
}

fn init_tracing(config: &Config) {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
}

async fn run_server(config_path: Option<&str>, listen: Option<String>) {
    let mut config = Config::load(config_path);
    if let Some(listen) = listen {
        config.server.listen = listen;
    }
    init_tracing(&config);

    info!("vncgate v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);
    info!(
        "Forwarding to {}@<host> from {}:{}+vm_id",
        config.tunnel.ssh_user, config.tunnel.bind_address, config.tunnel.base_port
    );

    let supervisor = TunnelSupervisor::with_ssh(&config.tunnel);
    let sweep_every = Duration::from_secs(config.server.sweep_interval_secs.max(1));
    let state = AppState::new(config, supervisor.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");
    let app = routes::router(state);

    info!("Server ready");

    // Periodic sweep: evict tunnels whose ssh process has exited
    let sweeper = supervisor.clone();
    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_every);
        loop {
            interval.tick().await;
            let evicted = sweeper.sweep().await;
            if !evicted.is_empty() {
                info!("Sweep evicted {} dead tunnel(s)", evicted.len());
            }
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // Cleanup
    info!("Shutting down...");
    sweep_task.abort();
    let stopped = supervisor.shutdown_all().await;
    info!("Stopped {stopped} tunnel(s)");
    info!("Goodbye");
}

async fn run_resolve(raw: &str, config_path: Option<&str>) {
    let config = Config::load(config_path);
    init_tracing(&config);

    let token = match ConnectionToken::parse(raw) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("invalid token: {e}");
            std::process::exit(2);
        }
    };

    let supervisor = TunnelSupervisor::with_ssh(&config.tunnel);
    match supervisor.resolve(&token).await {
        Ok(port) => {
            println!("{}", supervisor.local_addr(port));
            info!("Tunnel for vm {} up, Ctrl-C to close", token.vm_id);
            shutdown_signal().await;
        }
        Err(e) => {
            eprintln!("{e}");
            supervisor.shutdown_all().await;
            std::process::exit(1);
        }
    }
    supervisor.shutdown_all().await;
}

fn check_token(raw: &str) {
    match ConnectionToken::parse(raw) {
        Ok(token) => {
            println!("vm_id={} host={} remote_port={}", token.vm_id, token.host, token.remote_port);
        }
        Err(e) => {
            eprintln!("invalid token: {e}");
            std::process::exit(2);
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
