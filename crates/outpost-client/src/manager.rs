//! Connection lifecycle: failover, backoff, admission, switchback and keepalive
//!
//! The manager keeps exactly one admitted session alive, trying the primary
//! server first and the fallbacks in order. While connected to a fallback it
//! periodically dials the primary again and, once that succeeds, hands the new
//! session to the main loop and closes the old one.

use bytes::Bytes;
use outpost_proto::{
    AdmissionRejection, AdmissionRequest, RequestKind, TunnelSpec, ADMISSION_REQUEST,
};
use outpost_transport::{Connector, Established, Session, TransportError};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use crate::acceptor::ChannelAcceptor;
use crate::control::{ControlRouter, ControlRouterBuilder};
use crate::error::ClientError;
use crate::handlers::{
    CapabilitiesHandler, CapabilityState, CheckPortHandler, CheckTunnelAllowedHandler,
};
use crate::host;
use crate::reconnect::{Backoff, BackoffConfig};
use crate::tunnel::Tunnel;
use crate::tunnel_allowed::TunnelAllowList;
use crate::watchdog::{Watchdog, WatchdogState};

/// Who this agent says it is during admission
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentIdentity {
    pub id: String,
    pub name: String,
    pub tags: Vec<String>,
}

/// Settings for [`ConnectionManager`]
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Primary server first, then fallbacks in order
    pub servers: Vec<String>,
    pub switchback_interval: Duration,
    pub backoff: BackoffConfig,
    pub handshake_timeout: Duration,
    pub admission_timeout: Duration,
    /// Ping interval; `None` disables the keepalive task
    pub keep_alive: Option<Duration>,
    pub keep_alive_timeout: Duration,
    pub identity: AgentIdentity,
    /// Remotes requested at admission
    pub remotes: Vec<TunnelSpec>,
    /// Endpoints hosted on the agent for every admitted session
    pub local_tunnels: Vec<TunnelSpec>,
    pub tunnel_allowed: Option<TunnelAllowList>,
    /// Directory for `state.json`; `None` disables the watchdog
    pub data_dir: Option<PathBuf>,
}

impl ManagerConfig {
    pub fn new(servers: Vec<String>) -> Self {
        Self {
            servers,
            switchback_interval: Duration::from_secs(120),
            backoff: BackoffConfig::default(),
            handshake_timeout: Duration::from_secs(30),
            admission_timeout: Duration::from_secs(10),
            keep_alive: Some(Duration::from_secs(180)),
            keep_alive_timeout: Duration::from_secs(30),
            identity: AgentIdentity::default(),
            remotes: Vec::new(),
            local_tunnels: Vec::new(),
            tunnel_allowed: None,
            data_dir: None,
        }
    }
}

/// Observable lifecycle state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    /// Dialing and handshaking with `server`
    Dialing { server: String },
    RequestingAdmission { server: String },
    Connected { server: String, primary: bool },
    Disconnected,
    Stopped,
}

/// A dialed session waiting for admission, with the index of its server
#[derive(Debug)]
struct Handoff {
    established: Established,
    index: usize,
}

struct Inner<C> {
    connector: C,
    config: ManagerConfig,
    router: ControlRouter,
    acceptor: Arc<ChannelAcceptor>,
    capabilities: CapabilityState,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    session: Mutex<Option<Arc<dyn Session>>>,
    handoff: Mutex<Option<Handoff>>,
    state: watch::Sender<ConnectionState>,
    fatal: std::sync::Mutex<Option<ClientError>>,
    watchdog: Option<Watchdog>,
    started: AtomicBool,
}

/// Keeps one admitted session to the preferred reachable server
pub struct ConnectionManager<C: Connector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for ConnectionManager<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Connector> std::fmt::Debug for ConnectionManager<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("servers", &self.inner.config.servers)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, config: ManagerConfig) -> Result<Self, ClientError> {
        Self::with_router(connector, config, ControlRouter::builder())
    }

    /// Create a manager whose control router also serves `router`'s handlers
    ///
    /// The built-in `check_port`, `check_tunnel_allowed` and
    /// `put_capabilities` handlers are added unless `router` already has one.
    pub fn with_router(
        connector: C,
        config: ManagerConfig,
        router: ControlRouterBuilder,
    ) -> Result<Self, ClientError> {
        if config.servers.is_empty() {
            return Err(ClientError::NoServers);
        }

        let capabilities = CapabilityState::new();
        let router = router
            .register_if_absent(RequestKind::CheckPort, Arc::new(CheckPortHandler))
            .register_if_absent(
                RequestKind::CheckTunnelAllowed,
                Arc::new(CheckTunnelAllowedHandler::new(config.tunnel_allowed.clone())),
            )
            .register_if_absent(
                RequestKind::PutCapabilities,
                Arc::new(CapabilitiesHandler::new(capabilities.clone())),
            )
            .build();

        let watchdog = config
            .data_dir
            .as_deref()
            .map(Watchdog::new)
            .transpose()
            .map_err(ClientError::Watchdog)?;

        let (state, _) = watch::channel(ConnectionState::Idle);

        Ok(Self {
            inner: Arc::new(Inner {
                connector,
                acceptor: Arc::new(ChannelAcceptor::new(config.tunnel_allowed.clone())),
                config,
                router,
                capabilities,
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
                session: Mutex::new(None),
                handoff: Mutex::new(None),
                state,
                fatal: std::sync::Mutex::new(None),
                watchdog,
                started: AtomicBool::new(false),
            }),
        })
    }

    /// Launch the reconnect loop and the keepalive task; later calls do nothing
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }

        self.inner.tracker.spawn(self.inner.clone().reconnect_loop());
        if let Some(interval) = self.inner.config.keep_alive {
            self.inner
                .tracker
                .spawn(self.inner.clone().keepalive(interval));
        }
        self.inner.tracker.close();
    }

    /// Start and block until the manager stops
    pub async fn run(&self) -> Result<(), ClientError> {
        self.start();
        self.wait().await
    }

    /// Wait for the manager to stop; returns the fatal error that stopped it, if any
    pub async fn wait(&self) -> Result<(), ClientError> {
        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|s| *s == ConnectionState::Stopped).await;
        self.inner.tracker.wait().await;

        match self.inner.fatal.lock() {
            Ok(mut fatal) => fatal.take().map_or(Ok(()), Err),
            Err(_) => Ok(()),
        }
    }

    /// Stop reconnecting and close the current session; idempotent
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        if let Some(session) = self.current_session().await {
            session.close().await;
        }
        if !self.inner.started.swap(true, Ordering::SeqCst) {
            // Never started: nothing else will report the stop
            self.inner.tracker.close();
            self.inner.state.send_replace(ConnectionState::Stopped);
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Whether the active session is with the primary server
    pub fn is_primary(&self) -> bool {
        matches!(
            *self.inner.state.borrow(),
            ConnectionState::Connected { primary: true, .. }
        )
    }

    pub async fn current_session(&self) -> Option<Arc<dyn Session>> {
        self.inner.session.lock().await.clone()
    }

    /// Server capabilities learned through `put_capabilities`
    pub fn capabilities(&self) -> CapabilityState {
        self.inner.capabilities.clone()
    }
}

impl<C: Connector> Inner<C> {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn watchdog(&self, state: WatchdogState, message: &str) {
        if let Some(watchdog) = &self.watchdog {
            watchdog.update(state, message);
        }
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let mut backoff = Backoff::new(self.config.backoff.clone());

        let result = loop {
            if self.shutdown.is_cancelled() {
                break Ok(());
            }

            let err = match self.connect(&mut backoff).await {
                Ok((established, index)) => {
                    self.run_session(established, index).await;
                    // A lost session is retried right away; backoff applies to failed dials
                    continue;
                }
                Err(e) => e,
            };

            if self.shutdown.is_cancelled() {
                break Ok(());
            }
            if !err.is_retryable() {
                break Err(err);
            }

            let Some(delay) = backoff.next_delay() else {
                break Err(ClientError::MaxRetriesExceeded {
                    attempts: backoff.attempt(),
                    last_error: err.to_string(),
                });
            };

            match backoff.max_attempts() {
                Some(max) => error!("Connection error: {} (Attempt: {}/{})", err, backoff.attempt(), max),
                None => error!("Connection error: {} (Attempt: {})", err, backoff.attempt()),
            }
            info!("Retrying in {:?}...", delay);
            self.watchdog(WatchdogState::Reconnecting, &err.to_string());
            self.set_state(ConnectionState::Disconnected);

            tokio::select! {
                _ = self.shutdown.cancelled() => break Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        };

        if let Err(e) = result {
            error!("Connection manager stopped: {}", e);
            if let Ok(mut fatal) = self.fatal.lock() {
                *fatal = Some(e);
            }
        }

        self.shutdown.cancel();
        if let Some(handoff) = self.handoff.lock().await.take() {
            handoff.established.session.close().await;
        }
        self.set_state(ConnectionState::Stopped);
        info!("Connection manager stopped");
    }

    /// Produce an admitted session, preferring a handed-off one
    async fn connect(&self, backoff: &mut Backoff) -> Result<(Established, usize), ClientError> {
        let handoff = self.handoff.lock().await.take();
        if let Some(Handoff { established, index }) = handoff {
            if !established.session.is_closed() {
                let server = self.config.servers[index].clone();
                match self.admit(established, &server).await {
                    Ok(established) => {
                        backoff.reset();
                        return Ok((established, index));
                    }
                    Err(e) if e.is_retryable() => {
                        warn!(server = %server, "Handed-off session failed admission: {}", e);
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let mut last_error = None;
        for (index, server) in self.config.servers.iter().enumerate() {
            if self.shutdown.is_cancelled() {
                return Err(TransportError::Closed.into());
            }

            match self.establish(server).await {
                Ok(established) => {
                    backoff.reset();
                    return Ok((established, index));
                }
                Err(e) if e.is_retryable() => {
                    warn!(server = %server, "Failed to connect: {}", e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or(ClientError::NoServers))
    }

    async fn establish(&self, server: &str) -> Result<Established, ClientError> {
        self.set_state(ConnectionState::Dialing {
            server: server.to_string(),
        });
        let established = self.handshake(server).await?;
        self.admit(established, server).await
    }

    /// Dial and handshake under the handshake timeout; shutdown abandons the dial
    async fn handshake(&self, server: &str) -> Result<Established, ClientError> {
        debug!(server = %server, "Dialing");
        let dial = timeout(self.config.handshake_timeout, self.connector.connect(server));
        let established = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(TransportError::Closed.into()),
            r = dial => r.map_err(|_| TransportError::Timeout)??,
        };

        let info = established.session.info();
        debug!(
            server = %server,
            fingerprint = %info.fingerprint,
            version = info.protocol_version,
            "Handshake complete"
        );
        Ok(established)
    }

    /// Send the admission request and decode the granted remotes
    async fn admit(&self, established: Established, server: &str) -> Result<Established, ClientError> {
        self.set_state(ConnectionState::RequestingAdmission {
            server: server.to_string(),
        });

        let identity = &self.config.identity;
        let request = AdmissionRequest {
            version: env!("CARGO_PKG_VERSION").to_string(),
            id: identity.id.clone(),
            name: identity.name.clone(),
            tags: identity.tags.clone(),
            remotes: self.config.remotes.clone(),
            host: host::collect().await,
        };
        let payload = Bytes::from(serde_json::to_vec(&request)?);

        let session = established.session.clone();
        let started = Instant::now();
        let request = timeout(
            self.config.admission_timeout,
            session.send_request(ADMISSION_REQUEST, payload),
        );
        let replied = tokio::select! {
            _ = self.shutdown.cancelled() => {
                session.close().await;
                return Err(TransportError::Closed.into());
            }
            r = request => r,
        };
        let reply = match replied {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                session.close().await;
                return Err(e.into());
            }
            Err(_) => {
                session.close().await;
                return Err(TransportError::Timeout.into());
            }
        };
        let latency = started.elapsed();

        if !reply.ok {
            session.close().await;
            return Err(ClientError::Rejected(AdmissionRejection::from_payload(&reply.payload)));
        }

        let granted: Vec<TunnelSpec> = if reply.payload.is_empty() {
            Vec::new()
        } else {
            match serde_json::from_slice(&reply.payload) {
                Ok(granted) => granted,
                Err(e) => {
                    session.close().await;
                    return Err(e.into());
                }
            }
        };

        info!(server = %server, "Connected (latency {:?})", latency);
        for remote in &granted {
            info!(tunnel = %remote, "new tunnel");
        }
        Ok(established)
    }

    /// Serve one admitted session until it closes or the manager shuts down
    async fn run_session(self: &Arc<Self>, established: Established, index: usize) {
        let Established {
            session,
            requests,
            channels,
        } = established;
        let server = self.config.servers[index].clone();
        let primary = index == 0;

        *self.session.lock().await = Some(session.clone());
        self.watchdog(WatchdogState::Connected, "");
        self.set_state(ConnectionState::Connected {
            server: server.clone(),
            primary,
        });

        let token = self.shutdown.child_token();
        let tasks = TaskTracker::new();

        tasks.spawn({
            let router = self.router.clone();
            let token = token.clone();
            async move { router.serve(requests, token).await }
        });
        tasks.spawn(self.acceptor.clone().serve(channels, token.clone()));
        if !primary {
            tasks.spawn(self.clone().switchback(session.clone(), token.clone()));
        }
        tasks.close();

        let mut tunnels = Vec::with_capacity(self.config.local_tunnels.len());
        for spec in &self.config.local_tunnels {
            match Tunnel::start(spec.clone(), session.clone(), &token).await {
                Ok(tunnel) => tunnels.push(tunnel),
                Err(e) => error!(tunnel = %spec, "Failed to start local tunnel: {}", e),
            }
        }

        tokio::select! {
            _ = session.wait() => info!(server = %server, "Disconnected"),
            _ = self.shutdown.cancelled() => debug!(server = %server, "Shutting down session"),
        }

        token.cancel();
        for tunnel in &tunnels {
            let _ = tunnel.terminate(true).await;
        }
        session.close().await;
        tasks.wait().await;

        *self.session.lock().await = None;
        self.set_state(ConnectionState::Disconnected);
        if !self.shutdown.is_cancelled() {
            self.watchdog(WatchdogState::Reconnecting, "connection closed");
        }
    }

    /// Periodically dial the primary while on a fallback
    async fn switchback(self: Arc<Self>, current: Arc<dyn Session>, token: CancellationToken) {
        let interval = self.config.switchback_interval;
        let primary = &self.config.servers[0];
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {}
            }

            debug!(server = %primary, "Trying to switch back to primary server");
            let dialed = tokio::select! {
                _ = token.cancelled() => return,
                r = self.handshake(primary) => r,
            };
            match dialed {
                Ok(established) => {
                    let mut handoff = self.handoff.lock().await;
                    // The fallback may have ended while dialing; the main loop dials on its own then
                    if token.is_cancelled() {
                        drop(handoff);
                        established.session.close().await;
                        return;
                    }
                    info!(server = %primary, "Primary server reachable again, switching back");
                    *handoff = Some(Handoff {
                        established,
                        index: 0,
                    });
                    drop(handoff);
                    current.close().await;
                    return;
                }
                Err(e) => debug!(server = %primary, "Primary server still unreachable: {}", e),
            }
        }
    }

    /// Ping the active session; failures are logged and the session kept
    async fn keepalive(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(session) = self.session.lock().await.clone() else {
                continue;
            };
            let ping = session.send_request(RequestKind::Ping.as_str(), Bytes::new());
            match timeout(self.config.keep_alive_timeout, ping).await {
                Ok(Ok(reply)) if reply.ok => trace!("Keepalive ok"),
                Ok(Ok(reply)) => warn!("Keepalive rejected: {}", reply.text()),
                Ok(Err(e)) => warn!("Keepalive failed: {}", e),
                Err(_) => warn!("Keepalive timed out"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_transport::memory::MemoryNetwork;

    #[test]
    fn test_config_defaults() {
        let config = ManagerConfig::new(vec!["ws://a:80".into()]);
        assert_eq!(config.switchback_interval, Duration::from_secs(120));
        assert_eq!(config.keep_alive, Some(Duration::from_secs(180)));
        assert!(config.local_tunnels.is_empty());
    }

    #[test]
    fn test_requires_a_server() {
        let network = MemoryNetwork::new();
        let err = ConnectionManager::new(network.connector(), ManagerConfig::new(Vec::new())).unwrap_err();
        assert!(matches!(err, ClientError::NoServers));
    }

    #[tokio::test]
    async fn test_close_before_start_stops() {
        let network = MemoryNetwork::new();
        let manager =
            ConnectionManager::new(network.connector(), ManagerConfig::new(vec!["mem://a".into()])).unwrap();
        assert_eq!(manager.state(), ConnectionState::Idle);

        manager.close().await;
        manager.close().await;
        assert_eq!(manager.state(), ConnectionState::Stopped);
        manager.wait().await.unwrap();
        assert!(!manager.is_primary());
    }
}
