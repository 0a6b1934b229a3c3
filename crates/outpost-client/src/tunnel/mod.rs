//! Tunnel endpoints
//!
//! A tunnel binds a local port on the agent and forwards what arrives there
//! through the active session:
//!
//! - [`TcpTunnel`]: one transport channel per accepted connection.
//! - [`UdpTunnel`]: one shared channel carrying every client flow, framed
//!   with [`outpost_proto::DatagramCodec`].
//!
//! [`UdpForwarder`] is the other end of a UDP channel: it gives each flow its
//! own socket towards the real target.

pub mod flows;
pub mod tcp;
pub mod udp;

pub use flows::{FlowTable, UdpForwarder, FLOW_IDLE_THRESHOLD, FLOW_READ_TIMEOUT};
pub use tcp::TcpTunnel;
pub use udp::UdpTunnel;

use outpost_proto::{TunnelAcl, TunnelProtocol, TunnelSpec};
use outpost_transport::Session;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::TunnelError;

/// A running tunnel endpoint of either protocol
#[derive(Debug, Clone)]
pub enum Tunnel {
    Tcp(Arc<TcpTunnel>),
    Udp(Arc<UdpTunnel>),
}

impl Tunnel {
    pub async fn start(
        spec: TunnelSpec,
        session: Arc<dyn Session>,
        parent: &CancellationToken,
    ) -> Result<Self, TunnelError> {
        match spec.protocol {
            TunnelProtocol::Tcp => Ok(Tunnel::Tcp(TcpTunnel::start(spec, session, parent).await?)),
            TunnelProtocol::Udp => Ok(Tunnel::Udp(UdpTunnel::start(spec, session, parent).await?)),
        }
    }

    pub fn spec(&self) -> &TunnelSpec {
        match self {
            Tunnel::Tcp(tunnel) => tunnel.spec(),
            Tunnel::Udp(tunnel) => tunnel.spec(),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        match self {
            Tunnel::Tcp(tunnel) => tunnel.local_addr(),
            Tunnel::Udp(tunnel) => tunnel.local_addr(),
        }
    }

    pub fn last_active(&self) -> Instant {
        match self {
            Tunnel::Tcp(tunnel) => tunnel.last_active(),
            Tunnel::Udp(tunnel) => tunnel.last_active(),
        }
    }

    pub async fn set_acl(&self, acl: Option<TunnelAcl>) {
        match self {
            Tunnel::Tcp(tunnel) => tunnel.set_acl(acl).await,
            Tunnel::Udp(tunnel) => tunnel.set_acl(acl).await,
        }
    }

    /// Stop the endpoint; `force` only matters for TCP tunnels with open connections
    pub async fn terminate(&self, force: bool) -> Result<(), TunnelError> {
        match self {
            Tunnel::Tcp(tunnel) => tunnel.terminate(force).await,
            Tunnel::Udp(tunnel) => {
                tunnel.terminate().await;
                Ok(())
            }
        }
    }
}
