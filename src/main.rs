#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # edgehub
//!
//! Environment router and reverse tunnel for a Docker fleet manager.
//!
//! The manager owns a set of environments: its local Docker daemon, direct
//! remotes reachable over HTTP, and edge agents behind NAT that dial out to
//! the manager and keep a multiplexed WebSocket tunnel open.
//!
//! ## Subcommands
//!
//! - `edgehub serve` (default) — run the manager
//! - `edgehub agent` — run the edge agent, dialing `agent.manager_url`
//!
//! ## API surface
//!
//! | Method  | Path                                   | Description                        |
//! |---------|----------------------------------------|------------------------------------|
//! | GET     | `/api/health`                          | Liveness check                     |
//! | GET     | `/api/tunnel/connect`                  | Agent tunnel upgrade (Bearer)      |
//! | GET     | `/api/tunnel/status`                   | Live tunnels                       |
//! | GET     | `/api/environments`                    | Environment records                |
//! | GET     | `/api/environments/{id}`               | One record                         |
//! | GET/PUT | `/api/environments/{id}/settings`      | Read / update settings             |
//! | POST    | `/api/environments/{id}/heartbeat`     | Stamp last heartbeat               |
//! | GET     | `/api/environments/{id}/tunnel`        | Tunnel status for one environment  |
//! | *       | `/api/environments/{id}/...`           | Routed local / direct / tunneled   |
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, router setup, graceful shutdown
//! config.rs        — TOML + env-var configuration
//! error.rs         — TunnelError and its HTTP mapping
//! auth.rs          — agent token resolution, constant-time comparison
//! environment.rs   — Environment record, store trait, in-memory store
//! events.rs        — TunnelEvent, event sink trait
//! state.rs         — AppState
//! routes/          — health, environments, tunnel status
//! proxy/
//!   mod.rs         — routing decision middleware
//!   http.rs        — tunneled and direct HTTP forwarding
//!   ws.rs          — WebSocket bridging
//! tunnel/
//!   frame.rs       — wire frames
//!   pending.rs     — correlation table
//!   connection.rs  — one multiplexed agent connection
//!   registry.rs    — environment id → connection
//!   server.rs      — accept path, lifecycle, liveness sweep
//!   agent.rs       — edge agent client
//! ```

use std::sync::Arc;

use clap::{Parser, Subcommand};
use edgehub::auth::StoreTokenResolver;
use edgehub::config::Config;
use edgehub::environment::{
    Environment, EnvironmentStore, InMemoryEnvironmentStore, StoreStatusCallback,
};
use edgehub::events::LogEventSink;
use edgehub::tunnel::agent::EdgeAgent;
use edgehub::{routes, AppState, TunnelServer};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Environment router and edge tunnel for Docker hosts behind NAT.
#[derive(Parser)]
#[command(name = "edgehub", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the manager (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Run the edge agent.
    Agent {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let (config_path, agent_mode) = match cli.command {
        Some(Commands::Agent { config }) => (config, true),
        Some(Commands::Serve { config }) => (config, false),
        None => (None, false),
    };

    let config = match Config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("edgehub: {e}");
            std::process::exit(1);
        }
    };

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    let result = if agent_mode {
        run_agent(config).await
    } else {
        run_server(config).await
    };
    if let Err(e) = result {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run_agent(config: Config) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!("edgehub agent v{} starting", env!("CARGO_PKG_VERSION"));
    let agent = EdgeAgent::new(config.agent)?;

    let cancel = CancellationToken::new();
    let task = agent.spawn(cancel.clone());
    shutdown_signal().await;
    cancel.cancel();
    let _ = task.await;
    info!("Goodbye");
    Ok(())
}

async fn run_server(config: Config) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!("edgehub v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);

    let store: Arc<dyn EnvironmentStore> = Arc::new(InMemoryEnvironmentStore::new(
        config.environments.iter().map(Environment::from),
    ));
    let edge_count = store.list().await.iter().filter(|e| e.is_edge()).count();
    info!("Loaded {edge_count} edge environments");

    let tunnel = TunnelServer::new(
        Arc::new(StoreTokenResolver(store.clone())),
        Arc::new(StoreStatusCallback(store.clone())),
        config.tunnel.clone(),
    );
    tunnel.set_event_sink(Arc::new(LogEventSink));

    let max_concurrent = config.server.max_concurrent_requests;
    let state = AppState::new(Arc::new(config), store, tunnel.clone())?;
    let app = routes::router(state.clone())
        .layer(ConcurrencyLimitLayer::new(max_concurrent))
        .layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&state.config.server.listen).await?;
    info!("Server ready");

    // Tunnel liveness sweep
    let cancel = CancellationToken::new();
    let cleanup_task = tunnel.spawn_cleanup_loop(cancel.clone());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Cleanup
    info!("Shutting down...");
    cancel.cancel();
    let _ = cleanup_task.await;
    tunnel.shutdown().await;
    info!("Goodbye");
    Ok(())
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
                error!("Failed to register SIGTERM: {e}");
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
