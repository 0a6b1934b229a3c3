//! WebSocket transport for outpost sessions
//!
//! The agent dials `ws://` or `wss://`, optionally through an HTTP CONNECT or
//! SOCKS5 proxy, and upgrades with the `outpost.v{N}` subprotocol. The server
//! answers with a HELLO frame carrying its fingerprint, after which requests
//! and channels are multiplexed over binary messages (see [`frame`]).

pub mod config;
pub mod connector;
pub mod frame;
mod proxy;
pub mod session;

pub use config::{WebSocketConfig, SUPPORTED_PROXY_SCHEMES};
pub use connector::{accept, subprotocol, WebSocketConnector};
pub use frame::{Frame, FrameError};
pub use session::WebSocketSession;
