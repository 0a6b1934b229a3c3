//! In-process transport
//!
//! [`MemoryNetwork`] hosts any number of named listeners that can be made
//! reachable or unreachable at runtime. Sessions are symmetric pairs sharing
//! one close signal, with channels backed by [`tokio::io::duplex`].

use crate::{
    Channel, Connector, Established, InboundChannel, InboundRequest, RequestReply, Session,
    SessionInfo, TransportError, TransportResult,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const QUEUE_DEPTH: usize = 64;
const CHANNEL_BUFFER: usize = 64 * 1024;

/// One half of an in-memory session
#[derive(Debug)]
pub struct MemorySession {
    info: SessionInfo,
    peer_requests: mpsc::Sender<InboundRequest>,
    peer_channels: mpsc::Sender<InboundChannel>,
    closed: CancellationToken,
}

/// Create a connected pair of sessions: (client, server)
pub fn pair(client_info: SessionInfo, server_info: SessionInfo) -> (Established, Established) {
    let closed = CancellationToken::new();
    let (client_req_tx, client_req_rx) = mpsc::channel(QUEUE_DEPTH);
    let (client_chan_tx, client_chan_rx) = mpsc::channel(QUEUE_DEPTH);
    let (server_req_tx, server_req_rx) = mpsc::channel(QUEUE_DEPTH);
    let (server_chan_tx, server_chan_rx) = mpsc::channel(QUEUE_DEPTH);

    let client = MemorySession {
        info: client_info,
        peer_requests: server_req_tx,
        peer_channels: server_chan_tx,
        closed: closed.clone(),
    };
    let server = MemorySession {
        info: server_info,
        peer_requests: client_req_tx,
        peer_channels: client_chan_tx,
        closed,
    };

    (
        Established {
            session: Arc::new(client),
            requests: client_req_rx,
            channels: client_chan_rx,
        },
        Established {
            session: Arc::new(server),
            requests: server_req_rx,
            channels: server_chan_rx,
        },
    )
}

#[async_trait]
impl Session for MemorySession {
    fn info(&self) -> &SessionInfo {
        &self.info
    }

    async fn send_request(&self, kind: &str, payload: Bytes) -> TransportResult<RequestReply> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let (request, reply) = InboundRequest::new(kind, payload);
        self.peer_requests
            .send(request)
            .await
            .map_err(|_| TransportError::Closed)?;

        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            reply = reply => reply.map_err(|_| TransportError::Closed),
        }
    }

    async fn open_channel(&self, target: &str) -> TransportResult<Channel> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let (local, remote) = tokio::io::duplex(CHANNEL_BUFFER);
        let (inbound, decision) = InboundChannel::new(target, Box::new(remote));
        self.peer_channels
            .send(inbound)
            .await
            .map_err(|_| TransportError::Closed)?;

        let decision = tokio::select! {
            _ = self.closed.cancelled() => return Err(TransportError::Closed),
            decision = decision => decision.map_err(|_| TransportError::Closed)?,
        };

        match decision {
            Ok(()) => Ok(Box::new(local)),
            Err(reason) => Err(TransportError::ChannelRejected(reason)),
        }
    }

    async fn close(&self) {
        if !self.closed.is_cancelled() {
            debug!(remote = %self.info.remote_addr, "Closing in-memory session");
            self.closed.cancel();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    async fn wait(&self) {
        self.closed.cancelled().await
    }
}

#[derive(Debug)]
struct Endpoint {
    reachable: bool,
    fingerprint: String,
    accept_tx: mpsc::Sender<Established>,
}

/// A set of named in-memory servers
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    endpoints: Arc<Mutex<HashMap<String, Endpoint>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reachable server under `url`
    pub async fn listen(&self, url: &str) -> MemoryListener {
        let (accept_tx, accept_rx) = mpsc::channel(QUEUE_DEPTH);
        self.endpoints.lock().await.insert(
            url.to_string(),
            Endpoint {
                reachable: true,
                fingerprint: format!("mem:{}", url),
                accept_tx,
            },
        );
        MemoryListener {
            url: url.to_string(),
            accept_rx,
        }
    }

    /// Toggle whether dials to `url` succeed
    pub async fn set_reachable(&self, url: &str, reachable: bool) {
        if let Some(endpoint) = self.endpoints.lock().await.get_mut(url) {
            endpoint.reachable = reachable;
        }
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            network: self.clone(),
        }
    }
}

/// Server side of a [`MemoryNetwork`] registration
#[derive(Debug)]
pub struct MemoryListener {
    url: String,
    accept_rx: mpsc::Receiver<Established>,
}

impl MemoryListener {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Wait for the next client session
    pub async fn accept(&mut self) -> Option<Established> {
        self.accept_rx.recv().await
    }
}

/// Dials servers registered on a [`MemoryNetwork`]
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    network: MemoryNetwork,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, server: &str) -> TransportResult<Established> {
        let endpoints = self.network.endpoints.lock().await;
        let endpoint = endpoints
            .get(server)
            .filter(|e| e.reachable)
            .ok_or_else(|| TransportError::Connection(format!("connection refused: {}", server)))?;

        let info = SessionInfo {
            remote_addr: server.to_string(),
            protocol_version: 1,
            fingerprint: endpoint.fingerprint.clone(),
        };
        let (client, server_half) = pair(info.clone(), info);

        endpoint
            .accept_tx
            .send(server_half)
            .await
            .map_err(|_| TransportError::Connection(format!("connection refused: {}", server)))?;

        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_request_round_trip() {
        let (client, mut server) = pair(SessionInfo::default(), SessionInfo::default());

        tokio::spawn(async move {
            let request = server.requests.recv().await.unwrap();
            assert_eq!(request.kind, "new_connection");
            request.reply(RequestReply::success(&b"[]"[..]));
        });

        let reply = client
            .session
            .send_request("new_connection", Bytes::new())
            .await
            .unwrap();
        assert!(reply.ok);
        assert_eq!(reply.text(), "[]");
    }

    #[tokio::test]
    async fn test_channel_accept_and_reject() {
        let (client, mut server) = pair(SessionInfo::default(), SessionInfo::default());

        tokio::spawn(async move {
            let first = server.channels.recv().await.unwrap();
            assert_eq!(first.target, "127.0.0.1:22");
            let mut stream = first.accept();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();

            server.channels.recv().await.unwrap().reject("denied");
        });

        let mut channel = client.session.open_channel("127.0.0.1:22").await.unwrap();
        channel.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        channel.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        let err = client.session.open_channel("10.0.0.1:22").await.unwrap_err();
        assert!(matches!(err, TransportError::ChannelRejected(reason) if reason == "denied"));
    }

    #[tokio::test]
    async fn test_close_is_shared() {
        let (client, server) = pair(SessionInfo::default(), SessionInfo::default());
        client.session.close().await;
        server.session.wait().await;
        assert!(server.session.is_closed());
        assert!(matches!(
            server.session.send_request("ping", Bytes::new()).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let network = MemoryNetwork::new();
        let mut listener = network.listen("ws://primary").await;
        let connector = network.connector();

        network.set_reachable("ws://primary", false).await;
        assert!(connector.connect("ws://primary").await.is_err());
        assert!(connector.connect("ws://unknown").await.is_err());

        network.set_reachable("ws://primary", true).await;
        let client = connector.connect("ws://primary").await.unwrap();
        let server = listener.accept().await.unwrap();
        assert_eq!(client.session.info().fingerprint, "mem:ws://primary");
        assert_eq!(server.session.info().remote_addr, "ws://primary");
    }
}
