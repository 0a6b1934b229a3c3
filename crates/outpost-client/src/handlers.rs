//! Built-in handlers for side-channel requests

use async_trait::async_trait;
use bytes::Bytes;
use outpost_proto::{
    CheckPortRequest, CheckPortResponse, CheckTunnelAllowedRequest, CheckTunnelAllowedResponse,
    ServerCapabilities,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::control::{HandlerError, RequestHandler};
use crate::tunnel_allowed::{tunnel_is_allowed, TunnelAllowList};

/// Server capabilities known to this agent, owned by the connection manager
#[derive(Debug, Clone)]
pub struct CapabilityState {
    tx: Arc<watch::Sender<ServerCapabilities>>,
}

impl Default for CapabilityState {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityState {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ServerCapabilities::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> ServerCapabilities {
        self.tx.borrow().clone()
    }

    /// Receive every capability update; collaborators decide whether to start
    pub fn subscribe(&self) -> watch::Receiver<ServerCapabilities> {
        self.tx.subscribe()
    }

    pub fn set(&self, capabilities: ServerCapabilities) {
        self.tx.send_replace(capabilities);
    }
}

/// `check_port`: try a TCP connect to `host_port`
#[derive(Debug, Default)]
pub struct CheckPortHandler;

#[async_trait]
impl RequestHandler for CheckPortHandler {
    async fn handle(&self, payload: Bytes) -> Result<Bytes, HandlerError> {
        let request: CheckPortRequest = serde_json::from_slice(&payload)?;
        let timeout = Duration::from_secs(request.timeout.max(1));

        let response = match tokio::time::timeout(timeout, TcpStream::connect(&request.host_port)).await {
            Ok(Ok(_)) => CheckPortResponse {
                open: true,
                errmsg: String::new(),
            },
            Ok(Err(e)) => CheckPortResponse {
                open: false,
                errmsg: e.to_string(),
            },
            Err(_) => CheckPortResponse {
                open: false,
                errmsg: format!("dial tcp {}: i/o timeout", request.host_port),
            },
        };
        debug!(host_port = %request.host_port, open = response.open, "Checked port");

        Ok(serde_json::to_vec(&response)?.into())
    }
}

/// `check_tunnel_allowed`: evaluate the agent's tunnel allow-list
#[derive(Debug, Default)]
pub struct CheckTunnelAllowedHandler {
    allow_list: Option<TunnelAllowList>,
}

impl CheckTunnelAllowedHandler {
    pub fn new(allow_list: Option<TunnelAllowList>) -> Self {
        Self { allow_list }
    }
}

#[async_trait]
impl RequestHandler for CheckTunnelAllowedHandler {
    async fn handle(&self, payload: Bytes) -> Result<Bytes, HandlerError> {
        let request: CheckTunnelAllowedRequest = serde_json::from_slice(&payload)?;
        let is_allowed = tunnel_is_allowed(self.allow_list.as_ref(), &request.remote)
            .await
            .map_err(|e| HandlerError::Failed(e.to_string()))?;

        Ok(serde_json::to_vec(&CheckTunnelAllowedResponse { is_allowed })?.into())
    }
}

/// `put_capabilities`: store the server's feature set
#[derive(Debug)]
pub struct CapabilitiesHandler {
    state: CapabilityState,
}

impl CapabilitiesHandler {
    pub fn new(state: CapabilityState) -> Self {
        Self { state }
    }
}

#[async_trait]
impl RequestHandler for CapabilitiesHandler {
    async fn handle(&self, payload: Bytes) -> Result<Bytes, HandlerError> {
        let capabilities: ServerCapabilities = serde_json::from_slice(&payload)?;
        info!(
            server_version = %capabilities.server_version,
            monitoring_version = capabilities.monitoring_version,
            "Server capabilities updated"
        );
        self.state.set(capabilities);
        Ok(Bytes::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_check_port_open_and_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open_addr = listener.local_addr().unwrap();

        let payload = serde_json::to_vec(&CheckPortRequest {
            host_port: open_addr.to_string(),
            timeout: 2,
        })
        .unwrap();
        let reply = CheckPortHandler.handle(payload.into()).await.unwrap();
        let response: CheckPortResponse = serde_json::from_slice(&reply).unwrap();
        assert!(response.open);
        assert!(response.errmsg.is_empty());

        drop(listener);
        let payload = serde_json::to_vec(&CheckPortRequest {
            host_port: open_addr.to_string(),
            timeout: 2,
        })
        .unwrap();
        let reply = CheckPortHandler.handle(payload.into()).await.unwrap();
        let response: CheckPortResponse = serde_json::from_slice(&reply).unwrap();
        assert!(!response.open);
        assert!(!response.errmsg.is_empty());
    }

    #[tokio::test]
    async fn test_check_port_rejects_garbage() {
        let err = CheckPortHandler
            .handle(Bytes::from_static(b"not json"))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::InvalidPayload(_)));
    }

    #[tokio::test]
    async fn test_check_tunnel_allowed() {
        let handler = CheckTunnelAllowedHandler::new(TunnelAllowList::parse(&["127.0.0.1:22"]).unwrap());
        let ask = |remote: &str| {
            Bytes::from(serde_json::to_vec(&CheckTunnelAllowedRequest { remote: remote.into() }).unwrap())
        };

        let reply = handler.handle(ask("127.0.0.1:22")).await.unwrap();
        let response: CheckTunnelAllowedResponse = serde_json::from_slice(&reply).unwrap();
        assert!(response.is_allowed);

        let reply = handler.handle(ask("127.0.0.1:23")).await.unwrap();
        let response: CheckTunnelAllowedResponse = serde_json::from_slice(&reply).unwrap();
        assert!(!response.is_allowed);
    }

    #[tokio::test]
    async fn test_capabilities_are_published() {
        let state = CapabilityState::new();
        let mut updates = state.subscribe();
        let handler = CapabilitiesHandler::new(state.clone());

        handler
            .handle(Bytes::from_static(br#"{"server_version":"1.4.0","monitoring_version":2}"#))
            .await
            .unwrap();

        updates.changed().await.unwrap();
        assert_eq!(updates.borrow().monitoring_version, 2);
        assert_eq!(state.current().server_version, "1.4.0");
    }
}
