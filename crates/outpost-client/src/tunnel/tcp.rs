//! Local TCP listener forwarding each connection over its own channel

use outpost_proto::{TunnelAcl, TunnelSpec};
use outpost_transport::Session;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::TunnelError;

/// A TCP tunnel endpoint listening on the agent
#[derive(Debug)]
pub struct TcpTunnel {
    spec: TunnelSpec,
    local_addr: SocketAddr,
    acl: RwLock<Option<Arc<TunnelAcl>>>,
    active: AtomicUsize,
    last_close: Mutex<Instant>,
    session: Arc<dyn Session>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl TcpTunnel {
    /// Bind the listener and start accepting
    ///
    /// The tunnel stops when `parent` is cancelled or [`terminate`](Self::terminate) is called.
    pub async fn start(
        spec: TunnelSpec,
        session: Arc<dyn Session>,
        parent: &CancellationToken,
    ) -> Result<Arc<Self>, TunnelError> {
        let acl = spec.parsed_acl()?.map(Arc::new);
        let bind_addr = spec.local();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|source| TunnelError::Bind {
                addr: bind_addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let tunnel = Arc::new(Self {
            spec,
            local_addr,
            acl: RwLock::new(acl),
            active: AtomicUsize::new(0),
            last_close: Mutex::new(Instant::now()),
            session,
            shutdown: parent.child_token(),
            tracker: TaskTracker::new(),
        });

        info!(tunnel = %tunnel.spec, local = %local_addr, "TCP tunnel listening");
        tunnel.tracker.spawn(tunnel.clone().accept_loop(listener));
        tunnel.tracker.close();

        Ok(tunnel)
    }

    pub fn spec(&self) -> &TunnelSpec {
        &self.spec
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Now while any connection is open, otherwise when the last one closed
    pub fn last_active(&self) -> Instant {
        if self.active_connections() > 0 {
            return Instant::now();
        }
        self.last_close
            .lock()
            .map(|last_close| *last_close)
            .unwrap_or_else(|_| Instant::now())
    }

    /// Replace the ACL; connections already admitted are unaffected
    pub async fn set_acl(&self, acl: Option<TunnelAcl>) {
        *self.acl.write().await = acl.map(Arc::new);
    }

    /// Stop listening
    ///
    /// Without `force` this refuses while connections are open. Open
    /// connections are never cut; they end with their peers or the session.
    pub async fn terminate(&self, force: bool) -> Result<(), TunnelError> {
        let active = self.active_connections();
        if !force && active > 0 {
            return Err(TunnelError::Busy(active));
        }

        self.shutdown.cancel();
        self.tracker.wait().await;
        debug!(tunnel = %self.spec, "TCP tunnel terminated");
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.session.wait() => break,
                accepted = listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(tunnel = %self.spec, "Failed to accept connection: {}", e);
                    continue;
                }
            };

            let acl = self.acl.read().await.clone();
            if let Some(acl) = acl {
                if !acl.check_access(peer.ip()) {
                    info!(tunnel = %self.spec, peer = %peer, "Connection rejected by ACL");
                    continue;
                }
            }

            let guard = ActiveGuard::new(self.clone());
            tokio::spawn(self.clone().forward(stream, peer, guard));
        }

        // Dropping the listener closes the port
        drop(listener);
        info!(tunnel = %self.spec, "TCP tunnel closed");
    }

    async fn forward(self: Arc<Self>, mut stream: TcpStream, peer: SocketAddr, _guard: ActiveGuard) {
        let target = self.spec.channel_target().to_string();
        let mut channel = match self.session.open_channel(&target).await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(tunnel = %self.spec, peer = %peer, "Failed to open channel: {}", e);
                return;
            }
        };

        debug!(tunnel = %self.spec, peer = %peer, "Forwarding connection");
        tokio::select! {
            _ = self.session.wait() => {}
            result = tokio::io::copy_bidirectional(&mut stream, &mut channel) => match result {
                Ok((sent, received)) => {
                    debug!(peer = %peer, sent, received, "Connection closed");
                }
                Err(e) => debug!(peer = %peer, "Connection ended: {}", e),
            },
        }
    }
}

/// Counts one open connection for as long as it lives
struct ActiveGuard {
    tunnel: Arc<TcpTunnel>,
}

impl ActiveGuard {
    fn new(tunnel: Arc<TcpTunnel>) -> Self {
        tunnel.active.fetch_add(1, Ordering::SeqCst);
        Self { tunnel }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if let Ok(mut last_close) = self.tunnel.last_close.lock() {
            *last_close = Instant::now();
        }
        self.tunnel.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_transport::{memory, SessionInfo};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn local_spec() -> TunnelSpec {
        TunnelSpec::new("10.0.0.5", 22).with_local("127.0.0.1", 0)
    }

    #[tokio::test]
    async fn test_terminate_refuses_while_busy() {
        let (client, mut server) = memory::pair(SessionInfo::default(), SessionInfo::default());
        let parent = CancellationToken::new();
        let tunnel = TcpTunnel::start(local_spec(), client.session.clone(), &parent)
            .await
            .unwrap();

        // Peer accepts the channel and holds it open
        let peer = tokio::spawn(async move {
            let inbound = server.channels.recv().await.unwrap();
            assert_eq!(inbound.target, "10.0.0.5:22");
            let mut stream = inbound.accept();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            (stream, server)
        });

        let mut conn = TcpStream::connect(tunnel.local_addr()).await.unwrap();
        conn.write_all(b"hello").await.unwrap();
        let (_stream, _server) = peer.await.unwrap();
        assert_eq!(tunnel.active_connections(), 1);

        let err = tunnel.terminate(false).await.unwrap_err();
        assert_eq!(err.to_string(), "tunnel has 1 active connection(s)");

        tunnel.terminate(true).await.unwrap();
        assert!(TcpStream::connect(tunnel.local_addr()).await.is_err());
        // The live connection survives a forced terminate
        assert_eq!(tunnel.active_connections(), 1);
    }

    #[tokio::test]
    async fn test_acl_rejects_and_can_be_swapped() {
        let (client, mut server) = memory::pair(SessionInfo::default(), SessionInfo::default());
        let parent = CancellationToken::new();
        let spec = local_spec().with_acl("10.0.0.0/8");
        let tunnel = TcpTunnel::start(spec, client.session.clone(), &parent)
            .await
            .unwrap();

        let mut conn = TcpStream::connect(tunnel.local_addr()).await.unwrap();
        let mut buf = [0u8; 1];
        // Rejected connections are closed without opening a channel
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
        assert!(server.channels.try_recv().is_err());

        tunnel.set_acl(TunnelAcl::parse("127.0.0.1").unwrap()).await;
        let _conn = TcpStream::connect(tunnel.local_addr()).await.unwrap();
        let inbound = server.channels.recv().await.unwrap();
        assert_eq!(inbound.target, "10.0.0.5:22");

        parent.cancel();
        tunnel.terminate(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_last_active_while_idle() {
        let (client, _server) = memory::pair(SessionInfo::default(), SessionInfo::default());
        let parent = CancellationToken::new();
        let tunnel = TcpTunnel::start(local_spec(), client.session.clone(), &parent)
            .await
            .unwrap();

        let before = tunnel.last_active();
        assert!(before <= Instant::now());
        assert_eq!(tunnel.active_connections(), 0);
        tunnel.terminate(false).await.unwrap();
    }
}
