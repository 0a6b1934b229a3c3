//! UDP flow bookkeeping and the per-flow forwarder

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use outpost_proto::{Datagram, DatagramCodec};
use outpost_transport::Channel;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

use crate::error::TunnelError;

/// Inactivity after which a flow is dropped
pub const FLOW_IDLE_THRESHOLD: Duration = Duration::from_secs(15);

/// Read deadline on flow sockets, bounding how late an idle check can run
pub const FLOW_READ_TIMEOUT: Duration = Duration::from_secs(1);

const MAX_UDP_PACKET: usize = 64 * 1024;
const WRITE_QUEUE: usize = 256;

#[derive(Debug)]
struct FlowEntry<T> {
    value: T,
    last_active: Instant,
}

/// Flows of one endpoint keyed by client source address
#[derive(Debug)]
pub struct FlowTable<T> {
    flows: Mutex<HashMap<SocketAddr, FlowEntry<T>>>,
    idle_threshold: Duration,
}

impl<T: Clone> FlowTable<T> {
    pub fn new(idle_threshold: Duration) -> Self {
        Self {
            flows: Mutex::new(HashMap::new()),
            idle_threshold,
        }
    }

    pub async fn get(&self, addr: &SocketAddr) -> Option<T> {
        self.flows.lock().await.get(addr).map(|e| e.value.clone())
    }

    /// Insert or replace a flow, marking it active now
    pub async fn insert(&self, addr: SocketAddr, value: T) -> Option<T> {
        self.flows
            .lock()
            .await
            .insert(
                addr,
                FlowEntry {
                    value,
                    last_active: Instant::now(),
                },
            )
            .map(|e| e.value)
    }

    /// Mark a flow active; false if it is unknown
    pub async fn touch(&self, addr: &SocketAddr) -> bool {
        match self.flows.lock().await.get_mut(addr) {
            Some(entry) => {
                entry.last_active = Instant::now();
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, addr: &SocketAddr) -> Option<T> {
        self.flows.lock().await.remove(addr).map(|e| e.value)
    }

    /// Whether a flow is gone or has been quiet past the threshold
    pub async fn is_idle(&self, addr: &SocketAddr) -> bool {
        self.flows
            .lock()
            .await
            .get(addr)
            .map_or(true, |e| e.last_active.elapsed() >= self.idle_threshold)
    }

    /// Remove every flow quiet past the threshold and return them
    pub async fn reap_idle(&self) -> Vec<(SocketAddr, T)> {
        let mut flows = self.flows.lock().await;
        let idle: Vec<SocketAddr> = flows
            .iter()
            .filter(|(_, e)| e.last_active.elapsed() >= self.idle_threshold)
            .map(|(addr, _)| *addr)
            .collect();

        idle.into_iter()
            .filter_map(|addr| flows.remove(&addr).map(|e| (addr, e.value)))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.flows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.flows.lock().await.is_empty()
    }

    /// Most recent activity across all flows
    pub async fn last_active(&self) -> Option<Instant> {
        self.flows.lock().await.values().map(|e| e.last_active).max()
    }
}

/// Serve one shared UDP channel by giving each client address its own socket to `target`
///
/// Each flow runs a receive loop on its socket that forwards replies back onto
/// the channel tagged with the flow's address, and ends itself once the flow
/// has been idle for [`FLOW_IDLE_THRESHOLD`].
#[derive(Debug)]
pub struct UdpForwarder {
    target: String,
    flows: Arc<FlowTable<Arc<UdpSocket>>>,
    idle_threshold: Duration,
}

impl UdpForwarder {
    pub fn new(target: impl Into<String>) -> Self {
        Self::with_idle_threshold(target, FLOW_IDLE_THRESHOLD)
    }

    pub fn with_idle_threshold(target: impl Into<String>, idle_threshold: Duration) -> Self {
        Self {
            target: target.into(),
            flows: Arc::new(FlowTable::new(idle_threshold)),
            idle_threshold,
        }
    }

    pub fn flows(&self) -> Arc<FlowTable<Arc<UdpSocket>>> {
        self.flows.clone()
    }

    /// Forward until the channel ends or `shutdown` fires
    pub async fn run(self, channel: Channel, shutdown: CancellationToken) -> Result<(), TunnelError> {
        let target = lookup_host(&self.target)
            .await?
            .next()
            .ok_or_else(|| TunnelError::Unresolvable(self.target.clone()))?;

        let (reader, writer) = tokio::io::split(channel);
        let mut frames = FramedRead::new(reader, DatagramCodec::new());
        let (reply_tx, reply_rx) = mpsc::channel::<Datagram>(WRITE_QUEUE);

        let token = shutdown.child_token();
        let tracker = TaskTracker::new();
        tracker.spawn(write_datagrams(writer, reply_rx, token.clone()));

        loop {
            let datagram = tokio::select! {
                _ = token.cancelled() => break,
                frame = frames.next() => match frame {
                    Some(Ok(datagram)) => datagram,
                    Some(Err(e)) => {
                        warn!(dest = %self.target, "Failed to decode datagram: {}", e);
                        break;
                    }
                    None => break,
                },
            };

            let socket = match self.flows.get(&datagram.addr).await {
                Some(socket) => socket,
                None => match self.open_flow(target, datagram.addr, &reply_tx, &token, &tracker).await {
                    Ok(socket) => socket,
                    Err(e) => {
                        warn!(flow = %datagram.addr, "Failed to open UDP flow: {}", e);
                        continue;
                    }
                },
            };

            self.flows.touch(&datagram.addr).await;
            if let Err(e) = socket.send(&datagram.payload).await {
                debug!(flow = %datagram.addr, "UDP send failed: {}", e);
            }
        }

        token.cancel();
        tracker.close();
        tracker.wait().await;
        debug!(dest = %self.target, "UDP forwarder stopped");
        Ok(())
    }

    async fn open_flow(
        &self,
        target: SocketAddr,
        addr: SocketAddr,
        reply_tx: &mpsc::Sender<Datagram>,
        token: &CancellationToken,
        tracker: &TaskTracker,
    ) -> Result<Arc<UdpSocket>, TunnelError> {
        let bind = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(target).await?;
        let socket = Arc::new(socket);

        self.flows.insert(addr, socket.clone()).await;
        debug!(flow = %addr, dest = %target, "Opened UDP flow");

        tracker.spawn(flow_receive_loop(
            addr,
            socket.clone(),
            self.flows.clone(),
            reply_tx.clone(),
            token.clone(),
            self.idle_threshold,
        ));
        Ok(socket)
    }
}

async fn flow_receive_loop(
    addr: SocketAddr,
    socket: Arc<UdpSocket>,
    flows: Arc<FlowTable<Arc<UdpSocket>>>,
    reply_tx: mpsc::Sender<Datagram>,
    shutdown: CancellationToken,
    idle_threshold: Duration,
) {
    let mut buf = vec![0u8; MAX_UDP_PACKET];
    let read_timeout = FLOW_READ_TIMEOUT.min(idle_threshold);

    loop {
        let read = tokio::select! {
            _ = shutdown.cancelled() => break,
            read = tokio::time::timeout(read_timeout, socket.recv(&mut buf)) => read,
        };

        match read {
            Ok(Ok(n)) => {
                flows.touch(&addr).await;
                let datagram = Datagram::new(addr, Bytes::copy_from_slice(&buf[..n]));
                if reply_tx.send(datagram).await.is_err() {
                    break;
                }
            }
            Ok(Err(e)) => {
                debug!(flow = %addr, "UDP flow read failed: {}", e);
                break;
            }
            Err(_) => {
                if flows.is_idle(&addr).await {
                    trace!(flow = %addr, "UDP flow idle");
                    break;
                }
            }
        }
    }

    flows.remove(&addr).await;
    debug!(flow = %addr, "Closed UDP flow");
}

/// Sole writer of a shared channel; encodes datagrams in arrival order
pub(crate) async fn write_datagrams<W>(
    writer: W,
    mut rx: mpsc::Receiver<Datagram>,
    shutdown: CancellationToken,
) where
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(writer, DatagramCodec::new());
    loop {
        let datagram = tokio::select! {
            _ = shutdown.cancelled() => break,
            datagram = rx.recv() => match datagram {
                Some(datagram) => datagram,
                None => break,
            },
        };
        if let Err(e) = sink.send(datagram).await {
            debug!("Failed to write datagram: {}", e);
            break;
        }
    }
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_flow_is_reaped_without_touching_others() {
        let table = FlowTable::new(FLOW_IDLE_THRESHOLD);
        table.insert(addr(1000), "a").await;
        table.insert(addr(2000), "b").await;

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(table.touch(&addr(2000)).await);

        tokio::time::advance(Duration::from_secs(6)).await;
        let reaped = table.reap_idle().await;

        assert_eq!(reaped, vec![(addr(1000), "a")]);
        assert_eq!(table.len().await, 1);
        assert_eq!(table.get(&addr(2000)).await, Some("b"));
        assert!(table.is_idle(&addr(1000)).await);
        assert!(!table.is_idle(&addr(2000)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_active_tracks_newest_flow() {
        let table = FlowTable::new(FLOW_IDLE_THRESHOLD);
        assert!(table.last_active().await.is_none());

        table.insert(addr(1), ()).await;
        tokio::time::advance(Duration::from_secs(3)).await;
        table.insert(addr(2), ()).await;

        assert_eq!(table.last_active().await, Some(Instant::now()));
        assert!(!table.touch(&addr(3)).await);
        assert_eq!(table.remove(&addr(1)).await, Some(()));
    }
}
