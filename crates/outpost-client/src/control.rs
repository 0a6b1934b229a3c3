//! Dispatcher for administrative requests on the session side-channel

use async_trait::async_trait;
use bytes::Bytes;
use outpost_proto::RequestKind;
use outpost_transport::{InboundRequest, RequestReply};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Reply text for request names the agent does not know
pub const UNKNOWN_REQUEST: &str = "unknown request";

/// Error returned by a request handler; its text becomes the negative reply
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("invalid request payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("{0}")]
    Failed(String),
}

/// Handles one kind of administrative request
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, payload: Bytes) -> Result<Bytes, HandlerError>;
}

/// Builder for [`ControlRouter`]
#[derive(Default)]
pub struct ControlRouterBuilder {
    handlers: HashMap<RequestKind, Arc<dyn RequestHandler>>,
}

impl ControlRouterBuilder {
    /// Register the handler for `kind`, replacing any earlier one
    pub fn register(mut self, kind: RequestKind, handler: Arc<dyn RequestHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    /// Register `handler` only if nothing handles `kind` yet
    pub fn register_if_absent(mut self, kind: RequestKind, handler: Arc<dyn RequestHandler>) -> Self {
        self.handlers.entry(kind).or_insert(handler);
        self
    }

    pub fn build(self) -> ControlRouter {
        ControlRouter {
            handlers: Arc::new(self.handlers),
        }
    }
}

/// Routes side-channel requests to registered handlers
#[derive(Clone)]
pub struct ControlRouter {
    handlers: Arc<HashMap<RequestKind, Arc<dyn RequestHandler>>>,
}

impl std::fmt::Debug for ControlRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<&str> = self.handlers.keys().map(RequestKind::as_str).collect();
        kinds.sort_unstable();
        f.debug_struct("ControlRouter").field("handlers", &kinds).finish()
    }
}

impl ControlRouter {
    pub fn builder() -> ControlRouterBuilder {
        ControlRouterBuilder::default()
    }

    /// Serve requests one at a time until the queue ends or `shutdown` fires
    pub async fn serve(&self, mut requests: mpsc::Receiver<InboundRequest>, shutdown: CancellationToken) {
        loop {
            let request = tokio::select! {
                _ = shutdown.cancelled() => break,
                request = requests.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            let reply = self.dispatch(&request.kind, request.payload.clone()).await;
            request.reply(reply);
        }
        debug!("Control router stopped");
    }

    /// Produce the reply for one request
    pub async fn dispatch(&self, kind: &str, payload: Bytes) -> RequestReply {
        let Some(kind) = RequestKind::parse(kind) else {
            warn!(kind, "Unknown request type");
            return RequestReply::failure(UNKNOWN_REQUEST);
        };

        if kind == RequestKind::Ping {
            return RequestReply::success(Bytes::new());
        }

        let Some(handler) = self.handlers.get(&kind) else {
            debug!(%kind, "No handler registered");
            return RequestReply::failure(format!("no handler registered for {}", kind));
        };

        match handler.handle(payload).await {
            Ok(response) => RequestReply::success(response),
            Err(e) => {
                warn!(%kind, "Request failed: {}", e);
                RequestReply::failure(e.to_string())
            }
        }
    }
}
