//! Serves channel-opens initiated by the server

use outpost_proto::{ChannelTarget, TunnelProtocol};
use outpost_transport::InboundChannel;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::tunnel::UdpForwarder;
use crate::tunnel_allowed::{tunnel_is_allowed, TunnelAllowList};

/// Connects server-opened channels to targets on the agent's network
#[derive(Debug, Default)]
pub struct ChannelAcceptor {
    allow_list: Option<TunnelAllowList>,
    next_id: AtomicU64,
}

impl ChannelAcceptor {
    pub fn new(allow_list: Option<TunnelAllowList>) -> Self {
        Self {
            allow_list,
            next_id: AtomicU64::new(0),
        }
    }

    /// Handle channel-opens until the queue ends or `shutdown` fires
    pub async fn serve(
        self: Arc<Self>,
        mut channels: mpsc::Receiver<InboundChannel>,
        shutdown: CancellationToken,
    ) {
        loop {
            let channel = tokio::select! {
                _ = shutdown.cancelled() => break,
                channel = channels.recv() => match channel {
                    Some(channel) => channel,
                    None => break,
                },
            };

            let acceptor = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { acceptor.handle_channel(channel, shutdown).await });
        }
        tracing::debug!("Channel acceptor stopped");
    }

    /// Accept or reject one channel and forward it until either end closes
    pub async fn handle_channel(&self, channel: InboundChannel, shutdown: CancellationToken) {
        let target = match ChannelTarget::parse(&channel.target) {
            Ok(target) => target,
            Err(e) => {
                tracing::warn!(dest = %channel.target, "Rejecting channel: {}", e);
                channel.reject(e.to_string());
                return;
            }
        };
        let address = target.address();

        match tunnel_is_allowed(self.allow_list.as_ref(), &address).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(dest = %target, "Tunnel not allowed");
                channel.reject(format!("tunnel to {} is not allowed", address));
                return;
            }
            Err(e) => {
                tracing::warn!(dest = %target, "Rejecting channel: {}", e);
                channel.reject(e.to_string());
                return;
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        match target.protocol {
            TunnelProtocol::Tcp => self.forward_tcp(id, channel, address, shutdown).await,
            TunnelProtocol::Udp => {
                tracing::info!(conn = id, dest = %target, "Accepted UDP channel");
                let stream = channel.accept();
                if let Err(e) = UdpForwarder::new(address).run(stream, shutdown).await {
                    tracing::warn!(conn = id, dest = %target, "UDP forwarding failed: {}", e);
                }
                tracing::info!(conn = id, dest = %target, "UDP channel closed");
            }
        }
    }

    async fn forward_tcp(
        &self,
        id: u64,
        channel: InboundChannel,
        address: String,
        shutdown: CancellationToken,
    ) {
        // Dial before accepting so the server sees a refused target as a rejected channel
        let mut remote = match TcpStream::connect(&address).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(conn = id, dest = %address, "Failed to connect: {}", e);
                channel.reject(e.to_string());
                return;
            }
        };

        tracing::info!(conn = id, dest = %address, "Accepted TCP channel");
        let mut stream = channel.accept();

        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!(conn = id, dest = %address, "Channel cancelled");
            }
            result = tokio::io::copy_bidirectional(&mut stream, &mut remote) => match result {
                Ok((received, sent)) => tracing::info!(
                    conn = id,
                    dest = %address,
                    sent,
                    received,
                    "TCP channel closed"
                ),
                Err(e) => tracing::debug!(conn = id, dest = %address, "TCP channel ended: {}", e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_transport::{memory, SessionInfo, TransportError};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = socket.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr.to_string()
    }

    #[tokio::test]
    async fn test_tcp_channel_reaches_target() {
        let target = echo_server().await;
        let (client, server) = memory::pair(SessionInfo::default(), SessionInfo::default());
        let shutdown = CancellationToken::new();
        tokio::spawn(Arc::new(ChannelAcceptor::default()).serve(client.channels, shutdown.clone()));

        let mut channel = server.session.open_channel(&target).await.unwrap();
        channel.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        channel.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_rejections_reach_the_opener() {
        let allow = TunnelAllowList::parse(&["127.0.0.1:22"]).unwrap();
        let (client, server) = memory::pair(SessionInfo::default(), SessionInfo::default());
        let shutdown = CancellationToken::new();
        tokio::spawn(Arc::new(ChannelAcceptor::new(allow)).serve(client.channels, shutdown.clone()));

        let err = server.session.open_channel("127.0.0.1:23").await.unwrap_err();
        match err {
            TransportError::ChannelRejected(reason) => {
                assert_eq!(reason, "tunnel to 127.0.0.1:23 is not allowed")
            }
            other => panic!("unexpected error: {other}"),
        }

        let err = server.session.open_channel("no-port").await.unwrap_err();
        assert!(matches!(err, TransportError::ChannelRejected(_)));

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_refused_target_rejects_channel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let (client, server) = memory::pair(SessionInfo::default(), SessionInfo::default());
        let shutdown = CancellationToken::new();
        tokio::spawn(Arc::new(ChannelAcceptor::default()).serve(client.channels, shutdown.clone()));

        let err = server.session.open_channel(&addr).await.unwrap_err();
        assert!(matches!(err, TransportError::ChannelRejected(_)));
        shutdown.cancel();
    }
}
