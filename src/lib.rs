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
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! edgehub library — environment routing and the edge tunnel.
//!
//! - `tunnel` — agent connections, request multiplexing, liveness sweep, and
//!   the edge agent client
//! - `proxy` — per-request local / direct-remote / tunneled routing
//! - `environment` — environment records and the store interface
//! - `auth` — agent token resolution
//! - `events` — connect/disconnect and agent events
//! - `routes` — manager HTTP API
//! - `config` — configuration loading

pub mod auth;
pub mod config;
pub mod environment;
pub mod error;
pub mod events;
pub mod proxy;
pub mod routes;
pub mod state;
pub mod tunnel;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use environment::{Environment, EnvironmentStore, InMemoryEnvironmentStore};
pub use error::TunnelError;
pub use state::AppState;
pub use tunnel::TunnelServer;
