#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]

//! vncgate library: the building blocks of the console broker.
//!
//! - `token` — parse `{vm_id}_{host}_{remote_port}` console tokens
//! - `tunnel` — ssh tunnel processes, registry and supervisor
//! - `relay` — WebSocket ⇄ TCP byte relay
//! - `routes` — front door, health probe and admin API
//! - `auth` — API key authentication middleware
//! - `config` — configuration loading
//! - `error` — broker error kinds and their HTTP mapping

pub mod auth;
pub mod config;
pub mod error;
pub mod relay;
pub mod routes;
pub mod state;
pub mod token;
pub mod tunnel;

// Re-export key types at crate root for convenience.
pub use auth::ApiKey;
pub use config::Config;
pub use error::BrokerError;
pub use state::AppState;
pub use token::ConnectionToken;
pub use tunnel::TunnelSupervisor;
