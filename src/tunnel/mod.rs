//! Reverse tunnel for edge agents behind NAT.
//!
//! - [`server`]: accepts agent connections at `/api/tunnel/connect`,
//!   authenticates them, keeps the [`registry`] current and sweeps dead tunnels.
//! - [`connection`]: one multiplexed duplex channel per agent.
//! - [`agent`]: the edge side, dialing out to the manager and serving proxied
//!   requests against the agent's local API.

pub mod agent;
pub mod connection;
pub mod frame;
pub mod pending;
pub mod registry;
pub mod server;

pub use connection::{Connection, StreamSender, TunnelStatus, TunnelStream};
pub use frame::{Frame, ProxyRequest, ProxyResponse};
pub use pending::{PendingRequestTable, StreamEvent};
pub use registry::TunnelRegistry;
pub use server::TunnelServer;
