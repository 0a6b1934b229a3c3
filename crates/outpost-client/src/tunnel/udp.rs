//! Local UDP listener multiplexing client flows over one shared channel

use bytes::Bytes;
use futures::StreamExt;
use outpost_proto::{Datagram, DatagramCodec, TunnelAcl, TunnelProtocol, TunnelSpec};
use outpost_transport::Session;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::ReadHalf;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use super::flows::{write_datagrams, FlowTable, FLOW_IDLE_THRESHOLD, FLOW_READ_TIMEOUT};
use crate::error::TunnelError;

const MAX_UDP_PACKET: usize = 64 * 1024;
const WRITE_QUEUE: usize = 256;

/// A UDP tunnel endpoint listening on the agent
#[derive(Debug)]
pub struct UdpTunnel {
    spec: TunnelSpec,
    local_addr: SocketAddr,
    acl: RwLock<Option<Arc<TunnelAcl>>>,
    flows: Arc<FlowTable<()>>,
    last_seen: Mutex<Instant>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl UdpTunnel {
    /// Bind the local socket, open the shared channel and start forwarding
    pub async fn start(
        spec: TunnelSpec,
        session: Arc<dyn Session>,
        parent: &CancellationToken,
    ) -> Result<Arc<Self>, TunnelError> {
        Self::start_with_idle_threshold(spec, session, parent, FLOW_IDLE_THRESHOLD).await
    }

    pub async fn start_with_idle_threshold(
        mut spec: TunnelSpec,
        session: Arc<dyn Session>,
        parent: &CancellationToken,
        flow_idle: Duration,
    ) -> Result<Arc<Self>, TunnelError> {
        spec.protocol = TunnelProtocol::Udp;
        let acl = spec.parsed_acl()?.map(Arc::new);

        let bind_addr = spec.local();
        let socket = UdpSocket::bind(&bind_addr)
            .await
            .map_err(|source| TunnelError::Bind {
                addr: bind_addr.clone(),
                source,
            })?;
        let local_addr = socket.local_addr()?;

        let channel = session
            .open_channel(&spec.channel_target().to_string())
            .await?;
        let (reader, writer) = tokio::io::split(channel);

        let tunnel = Arc::new(Self {
            spec,
            local_addr,
            acl: RwLock::new(acl),
            flows: Arc::new(FlowTable::new(flow_idle)),
            last_seen: Mutex::new(Instant::now()),
            shutdown: parent.child_token(),
            tracker: TaskTracker::new(),
        });

        let socket = Arc::new(socket);
        let (tx, rx) = mpsc::channel::<Datagram>(WRITE_QUEUE);

        tunnel.tracker.spawn(tunnel.clone().inbound(socket.clone(), tx));
        tunnel
            .tracker
            .spawn(write_datagrams(writer, rx, tunnel.shutdown.clone()));
        tunnel.tracker.spawn(tunnel.clone().outbound(reader, socket));
        tunnel.tracker.spawn(tunnel.clone().reaper());
        tunnel.tracker.spawn({
            let shutdown = tunnel.shutdown.clone();
            async move {
                tokio::select! {
                    _ = session.wait() => shutdown.cancel(),
                    _ = shutdown.cancelled() => {}
                }
            }
        });
        tunnel.tracker.close();

        info!(tunnel = %tunnel.spec, local = %local_addr, "UDP tunnel listening");
        Ok(tunnel)
    }

    pub fn spec(&self) -> &TunnelSpec {
        &self.spec
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn flow_count(&self) -> usize {
        self.flows.len().await
    }

    pub fn flows(&self) -> Arc<FlowTable<()>> {
        self.flows.clone()
    }

    /// Time of the last datagram seen in either direction
    pub fn last_active(&self) -> Instant {
        self.last_seen
            .lock()
            .map(|last_seen| *last_seen)
            .unwrap_or_else(|_| Instant::now())
    }

    /// Replace the ACL; applies from the next datagram
    pub async fn set_acl(&self, acl: Option<TunnelAcl>) {
        *self.acl.write().await = acl.map(Arc::new);
    }

    /// Stop forwarding and close the local socket
    pub async fn terminate(&self) {
        self.shutdown.cancel();
        self.tracker.wait().await;
        debug!(tunnel = %self.spec, "UDP tunnel terminated");
    }

    /// Resolve once the tunnel has stopped for any reason
    pub async fn wait(&self) {
        self.tracker.wait().await;
    }

    fn mark_active(&self) {
        if let Ok(mut last_seen) = self.last_seen.lock() {
            *last_seen = Instant::now();
        }
    }

    /// Local clients to the shared channel
    async fn inbound(self: Arc<Self>, socket: Arc<UdpSocket>, tx: mpsc::Sender<Datagram>) {
        let mut buf = vec![0u8; MAX_UDP_PACKET];
        loop {
            let (n, src) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        warn!(tunnel = %self.spec, "UDP receive failed: {}", e);
                        continue;
                    }
                },
            };

            let acl = self.acl.read().await.clone();
            if !outpost_proto::acl::check_access(acl.as_deref(), src.ip()) {
                debug!(tunnel = %self.spec, flow = %src, "Datagram rejected by ACL");
                continue;
            }

            if !self.flows.touch(&src).await {
                self.flows.insert(src, ()).await;
                debug!(tunnel = %self.spec, flow = %src, "New UDP flow");
            }
            self.mark_active();

            let datagram = Datagram::new(src, Bytes::copy_from_slice(&buf[..n]));
            if tx.send(datagram).await.is_err() {
                break;
            }
        }

        self.shutdown.cancel();
        info!(tunnel = %self.spec, "UDP tunnel closed");
    }

    /// Shared channel back to local clients
    async fn outbound(self: Arc<Self>, reader: ReadHalf<outpost_transport::Channel>, socket: Arc<UdpSocket>) {
        let mut frames = FramedRead::new(reader, DatagramCodec::new());
        loop {
            let datagram = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                frame = frames.next() => match frame {
                    Some(Ok(datagram)) => datagram,
                    Some(Err(e)) => {
                        warn!(tunnel = %self.spec, "Failed to decode datagram: {}", e);
                        break;
                    }
                    None => {
                        debug!(tunnel = %self.spec, "UDP channel closed by peer");
                        break;
                    }
                },
            };

            if !self.flows.touch(&datagram.addr).await {
                self.flows.insert(datagram.addr, ()).await;
            }
            self.mark_active();

            if let Err(e) = socket.send_to(&datagram.payload, datagram.addr).await {
                debug!(flow = %datagram.addr, "UDP send failed: {}", e);
            }
        }

        self.shutdown.cancel();
    }

    /// Evicts idle flows and enforces the tunnel's overall idle timeout
    async fn reaper(self: Arc<Self>) {
        let idle_timeout = self.spec.idle_timeout();
        let mut ticker = tokio::time::interval(FLOW_READ_TIMEOUT);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            for (addr, ()) in self.flows.reap_idle().await {
                trace!(tunnel = %self.spec, flow = %addr, "UDP flow idle");
            }

            if let Some(timeout) = idle_timeout {
                if self.last_active().elapsed() >= timeout {
                    info!(tunnel = %self.spec, "UDP tunnel idle for {:?}, closing", timeout);
                    self.shutdown.cancel();
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::SinkExt;
    use outpost_transport::{memory, SessionInfo};
    use tokio_util::codec::Framed;

    fn spec() -> TunnelSpec {
        TunnelSpec::new("127.0.0.1", 53)
            .with_protocol(TunnelProtocol::Udp)
            .with_local("127.0.0.1", 0)
    }

    #[tokio::test]
    async fn test_datagrams_cross_the_shared_channel() {
        let (client, mut server) = memory::pair(SessionInfo::default(), SessionInfo::default());
        let parent = CancellationToken::new();

        let peer = tokio::spawn(async move {
            let inbound = server.channels.recv().await.unwrap();
            assert_eq!(inbound.target, "127.0.0.1:53/udp");
            let mut framed = Framed::new(inbound.accept(), DatagramCodec::new());
            let request = framed.next().await.unwrap().unwrap();
            assert_eq!(&request.payload[..], b"query");
            framed
                .send(Datagram::new(request.addr, Bytes::from_static(b"answer")))
                .await
                .unwrap();
            (framed, server)
        });

        let tunnel = UdpTunnel::start(spec(), client.session.clone(), &parent)
            .await
            .unwrap();
        let local = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        local.send_to(b"query", tunnel.local_addr()).await.unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = local.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"answer");
        assert_eq!(from, tunnel.local_addr());
        assert_eq!(tunnel.flow_count().await, 1);

        let _peer = peer.await.unwrap();
        tunnel.terminate().await;
        assert!(tunnel.shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_tunnel_stops_with_session() {
        let (client, mut server) = memory::pair(SessionInfo::default(), SessionInfo::default());
        let parent = CancellationToken::new();

        let peer = tokio::spawn(async move {
            let inbound = server.channels.recv().await.unwrap();
            (inbound.accept(), server)
        });
        let tunnel = UdpTunnel::start(spec(), client.session.clone(), &parent)
            .await
            .unwrap();
        let (_channel, server) = peer.await.unwrap();

        server.session.close().await;
        tokio::time::timeout(Duration::from_secs(5), tunnel.wait())
            .await
            .unwrap();
    }
}
