//! Outpost protocol definitions
//!
//! Types shared by the agent and the transport layer: control request kinds
//! and their payloads, tunnel specifications, the tunnel ACL and the framing
//! used to carry many UDP flows over a single channel.

pub mod acl;
pub mod datagram;
pub mod messages;
pub mod remote;

pub use acl::{AclEntry, AclError, TunnelAcl};
pub use datagram::{Datagram, DatagramCodec, DatagramError};
pub use messages::*;
pub use remote::{ChannelTarget, SpecError, TunnelProtocol, TunnelSpec};

/// Protocol version, negotiated as the WebSocket subprotocol `outpost.v{N}`
pub const PROTOCOL_VERSION: u32 = 1;

/// Name of the admission request sent right after the handshake
pub const ADMISSION_REQUEST: &str = "new_connection";
