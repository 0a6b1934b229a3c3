//! Outpost agent library
//!
//! The agent dials out to a rendezvous server, keeps one admitted session
//! alive and exposes local network services through it.

pub mod acceptor;
pub mod config;
pub mod control;
pub mod error;
pub mod handlers;
pub mod host;
pub mod manager;
pub mod reconnect;
pub mod tunnel;
pub mod tunnel_allowed;
pub mod watchdog;

pub use acceptor::ChannelAcceptor;
pub use config::{ClientConfig, ConfigError};
pub use control::{ControlRouter, ControlRouterBuilder, HandlerError, RequestHandler};
pub use error::{ClientError, TunnelError};
pub use handlers::CapabilityState;
pub use manager::{AgentIdentity, ConnectionManager, ConnectionState, ManagerConfig};
pub use reconnect::{Backoff, BackoffConfig};
pub use tunnel::{TcpTunnel, Tunnel, UdpForwarder, UdpTunnel};
pub use tunnel_allowed::TunnelAllowList;
pub use watchdog::{Watchdog, WatchdogState};

pub use outpost_proto::{RequestKind, ServerCapabilities, TunnelAcl, TunnelProtocol, TunnelSpec};
