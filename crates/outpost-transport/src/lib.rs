//! Transport abstraction for agent sessions
//!
//! An agent keeps exactly one authenticated, multiplexed session to a server.
//! The session carries two kinds of traffic:
//!
//! - **Requests**: small typed request/reply pairs on a side-channel, used for
//!   admission, keepalive and server-issued administrative commands.
//! - **Channels**: independent byte streams opened on demand by either side,
//!   each addressed by an opaque target string such as `"10.0.0.5:22"` or
//!   `"127.0.0.1:53/udp"`.
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │      outpost-client (manager, tunnels)        │
//! └───────────────────────────────────────────────┘
//!                       │ Session / Connector
//!                       ↓
//! ┌──────────────────────┬────────────────────────┐
//! │ outpost-transport-   │ memory (in-process,    │
//! │ websocket            │ tests and embedding)   │
//! └──────────────────────┴────────────────────────┘
//! ```

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("Unsupported proxy scheme: {0}")]
    UnsupportedProxy(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Protocol version mismatch: {0}")]
    VersionMismatch(String),

    #[error("Server fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch { expected: String, actual: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Channel rejected: {0}")]
    ChannelRejected(String),

    #[error("Timeout")]
    Timeout,

    #[error("Session closed")]
    Closed,
}

impl TransportError {
    /// Whether a connect attempt failing with this error should be retried
    ///
    /// Network trouble, proxy trouble and credential rejections are treated as
    /// transient; protocol or configuration disagreements are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Connection(_)
            | TransportError::Io(_)
            | TransportError::Proxy(_)
            | TransportError::AuthenticationFailed(_)
            | TransportError::Timeout
            | TransportError::Closed => true,
            TransportError::UnsupportedProxy(_)
            | TransportError::Handshake(_)
            | TransportError::VersionMismatch(_)
            | TransportError::FingerprintMismatch { .. }
            | TransportError::Protocol(_)
            | TransportError::ChannelRejected(_) => false,
        }
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Byte stream carried by one transport channel
pub trait ChannelStream: AsyncRead + AsyncWrite + Send + Unpin + Debug {}

impl<T> ChannelStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + Debug {}

/// An open transport channel
pub type Channel = Box<dyn ChannelStream>;

/// Reply to a side-channel request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestReply {
    pub ok: bool,
    pub payload: Bytes,
}

impl RequestReply {
    pub fn success(payload: impl Into<Bytes>) -> Self {
        Self {
            ok: true,
            payload: payload.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            payload: Bytes::from(message.into()),
        }
    }

    /// Payload interpreted as text, for error replies
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// A request sent by the peer on the side-channel
#[derive(Debug)]
pub struct InboundRequest {
    pub kind: String,
    pub payload: Bytes,
    reply: oneshot::Sender<RequestReply>,
}

impl InboundRequest {
    pub fn new(
        kind: impl Into<String>,
        payload: Bytes,
    ) -> (Self, oneshot::Receiver<RequestReply>) {
        let (reply, rx) = oneshot::channel();
        (
            Self {
                kind: kind.into(),
                payload,
                reply,
            },
            rx,
        )
    }

    /// Send the reply; a peer that stopped waiting is not an error
    pub fn reply(self, reply: RequestReply) {
        let _ = self.reply.send(reply);
    }
}

/// A channel-open initiated by the peer, waiting for a decision
#[derive(Debug)]
pub struct InboundChannel {
    pub target: String,
    stream: Channel,
    decision: oneshot::Sender<Result<(), String>>,
}

impl InboundChannel {
    pub fn new(
        target: impl Into<String>,
        stream: Channel,
    ) -> (Self, oneshot::Receiver<Result<(), String>>) {
        let (decision, rx) = oneshot::channel();
        (
            Self {
                target: target.into(),
                stream,
                decision,
            },
            rx,
        )
    }

    /// Confirm the channel and take its stream
    pub fn accept(self) -> Channel {
        let _ = self.decision.send(Ok(()));
        self.stream
    }

    /// Refuse the channel with a reason the opener will see
    pub fn reject(self, reason: impl Into<String>) {
        let _ = self.decision.send(Err(reason.into()));
    }
}

/// Facts learned during the handshake
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionInfo {
    /// Server URL or address the session was dialed to
    pub remote_addr: String,
    /// Negotiated protocol version
    pub protocol_version: u32,
    /// Fingerprint the server presented during the handshake
    pub fingerprint: String,
}

/// A live, authenticated, multiplexed session
#[async_trait]
pub trait Session: Send + Sync + Debug {
    fn info(&self) -> &SessionInfo;

    /// Send a side-channel request and wait for its reply
    async fn send_request(&self, kind: &str, payload: Bytes) -> TransportResult<RequestReply>;

    /// Open a channel to `target` on the peer
    async fn open_channel(&self, target: &str) -> TransportResult<Channel>;

    /// Close the session; idempotent
    async fn close(&self);

    fn is_closed(&self) -> bool;

    /// Resolve once the session has ended for any reason
    async fn wait(&self);
}

/// A freshly handshaken session with its inbound queues
#[derive(Debug)]
pub struct Established {
    pub session: Arc<dyn Session>,
    pub requests: mpsc::Receiver<InboundRequest>,
    pub channels: mpsc::Receiver<InboundChannel>,
}

/// Dials a server and performs the transport handshake
#[async_trait]
pub trait Connector: Send + Sync + Debug + 'static {
    async fn connect(&self, server: &str) -> TransportResult<Established>;
}

#[async_trait]
impl<C: Connector + ?Sized> Connector for Arc<C> {
    async fn connect(&self, server: &str) -> TransportResult<Established> {
        (**self).connect(server).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(TransportError::Connection("refused".into()).is_retryable());
        assert!(TransportError::Proxy("502".into()).is_retryable());
        assert!(TransportError::AuthenticationFailed("401".into()).is_retryable());
        assert!(TransportError::Timeout.is_retryable());

        assert!(!TransportError::UnsupportedProxy("socks4".into()).is_retryable());
        assert!(!TransportError::VersionMismatch("outpost.v2".into()).is_retryable());
        assert!(!TransportError::FingerprintMismatch {
            expected: "aa".into(),
            actual: "bb".into()
        }
        .is_retryable());
    }

    #[tokio::test]
    async fn test_inbound_request_reply() {
        let (request, rx) = InboundRequest::new("ping", Bytes::new());
        assert_eq!(request.kind, "ping");
        request.reply(RequestReply::success(Bytes::new()));
        assert!(rx.await.unwrap().ok);
    }

    #[tokio::test]
    async fn test_inbound_channel_reject() {
        let (stream, _peer) = tokio::io::duplex(64);
        let (channel, rx) = InboundChannel::new("10.0.0.1:22", Box::new(stream));
        channel.reject("not allowed");
        assert_eq!(rx.await.unwrap(), Err("not allowed".to_string()));
    }
}
