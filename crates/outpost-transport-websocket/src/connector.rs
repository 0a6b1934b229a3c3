//! WebSocket connector and acceptor

use async_trait::async_trait;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use outpost_proto::PROTOCOL_VERSION;
use outpost_transport::{
    Connector, Established, SessionInfo, TransportError, TransportResult,
};
use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::http::header::{
    AUTHORIZATION, HOST, SEC_WEBSOCKET_PROTOCOL, USER_AGENT,
};
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig as WsProtocolConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info};
use url::Url;

use crate::config::WebSocketConfig;
use crate::frame::Frame;
use crate::proxy;
use crate::session::WebSocketSession;

/// Subprotocol naming the multiplexing protocol version
pub fn subprotocol() -> String {
    format!("outpost.v{}", PROTOCOL_VERSION)
}

/// Byte stream under the WebSocket: plain TCP or TLS
trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

type BoxedIo = Box<dyn Io>;

/// Dials `ws://` and `wss://` servers
pub struct WebSocketConnector {
    tls_connector: TlsConnector,
    config: Arc<WebSocketConfig>,
}

impl std::fmt::Debug for WebSocketConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnector")
            .field("proxy", &self.config.proxy.as_ref().map(Url::as_str))
            .finish()
    }
}

impl WebSocketConnector {
    pub fn new(config: Arc<WebSocketConfig>) -> TransportResult<Self> {
        config.validate()?;
        let tls_connector = config.build_tls_connector()?;

        debug!("WebSocket connector created");

        Ok(Self {
            tls_connector,
            config,
        })
    }

    async fn dial(&self, url: &Url) -> TransportResult<Established> {
        let host = url
            .host_str()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
            .ok_or_else(|| TransportError::Handshake(format!("no host in {}", url)))?;
        let secure = url.scheme() == "wss";
        let port = url.port().unwrap_or(if secure { 443 } else { 80 });

        let tcp = match &self.config.proxy {
            Some(proxy_url) => proxy::connect(proxy_url, &host, port).await?,
            None => TcpStream::connect((host.as_str(), port))
                .await
                .map_err(|e| TransportError::Connection(format!("{}:{}: {}", host, port, e)))?,
        };
        let _ = tcp.set_nodelay(true);

        let io: BoxedIo = if secure {
            let server_name = ServerName::try_from(host.clone())
                .map_err(|e| TransportError::Handshake(format!("Invalid server name: {}", e)))?;
            let tls = self
                .tls_connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| TransportError::Connection(format!("TLS handshake failed: {}", e)))?;
            Box::new(tls)
        } else {
            Box::new(tcp)
        };

        let request = self.build_request(url)?;
        let mut ws_config = WsProtocolConfig::default();
        ws_config.max_message_size = Some(self.config.max_message_size);

        let (mut ws, response) =
            tokio_tungstenite::client_async_with_config(request, io, Some(ws_config))
                .await
                .map_err(classify_upgrade_error)?;

        let negotiated = response
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if negotiated != subprotocol() {
            return Err(TransportError::VersionMismatch(format!(
                "server selected subprotocol '{}', expected '{}'",
                negotiated,
                subprotocol()
            )));
        }

        let fingerprint = read_hello(&mut ws).await?;
        self.verify_fingerprint(&fingerprint)?;

        info!(server = %url, fingerprint = %fingerprint, "WebSocket session established");

        let info = SessionInfo {
            remote_addr: url.to_string(),
            protocol_version: PROTOCOL_VERSION,
            fingerprint,
        };
        Ok(WebSocketSession::start(ws, info, false))
    }

    fn build_request(
        &self,
        url: &Url,
    ) -> TransportResult<tokio_tungstenite::tungstenite::handshake::client::Request> {
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Handshake(format!("Invalid URL {}: {}", url, e)))?;

        let headers = request.headers_mut();
        headers.insert(SEC_WEBSOCKET_PROTOCOL, header_value(&subprotocol())?);
        headers.insert(USER_AGENT, header_value(&self.config.user_agent)?);

        if let Some(auth) = &self.config.auth {
            let token = base64::engine::general_purpose::STANDARD.encode(auth);
            headers.insert(AUTHORIZATION, header_value(&format!("Basic {}", token))?);
        }
        if let Some(host) = &self.config.host_header {
            headers.insert(HOST, header_value(host)?);
        }
        for (name, value) in &self.config.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                TransportError::Handshake(format!("Invalid header name '{}': {}", name, e))
            })?;
            headers.insert(name, header_value(value)?);
        }

        Ok(request)
    }

    fn verify_fingerprint(&self, actual: &str) -> TransportResult<()> {
        let Some(expected) = &self.config.fingerprint else {
            return Ok(());
        };
        if normalize_fingerprint(actual).starts_with(&normalize_fingerprint(expected)) {
            Ok(())
        } else {
            Err(TransportError::FingerprintMismatch {
                expected: expected.clone(),
                actual: actual.to_string(),
            })
        }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, server: &str) -> TransportResult<Established> {
        let url = Url::parse(server)
            .map_err(|e| TransportError::Handshake(format!("Invalid server URL '{}': {}", server, e)))?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(TransportError::Handshake(format!(
                "unsupported scheme '{}'",
                url.scheme()
            )));
        }

        debug!(server = %url, "Connecting to WebSocket server");

        tokio::time::timeout(self.config.handshake_timeout, self.dial(&url))
            .await
            .map_err(|_| TransportError::Timeout)?
    }
}

/// Accept an agent on an already-connected stream and start a server session
///
/// Negotiates the subprotocol, sends HELLO with `fingerprint` and returns the
/// server half of the session.
pub async fn accept<S>(stream: S, fingerprint: &str) -> TransportResult<Established>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let expected = subprotocol();
    let callback = |req: &Request, mut response: Response| {
        let offered = req
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(',').any(|p| p.trim() == expected))
            .unwrap_or(false);
        if !offered {
            let mut rejection = tokio_tungstenite::tungstenite::handshake::server::ErrorResponse::new(Some("unsupported protocol version".to_string()));
            *rejection.status_mut() = StatusCode::BAD_REQUEST;
            return Err(rejection);
        }
        if let Ok(value) = HeaderValue::from_str(&expected) {
            response.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
        }
        Ok(response)
    };

    let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback)
        .await
        .map_err(|e| TransportError::Handshake(e.to_string()))?;

    let hello = Frame::Hello {
        version: PROTOCOL_VERSION,
        fingerprint: fingerprint.to_string(),
    }
    .encode()
    .map_err(|e| TransportError::Protocol(e.to_string()))?;
    ws.send(Message::Binary(hello))
        .await
        .map_err(|e| TransportError::Handshake(e.to_string()))?;

    let info = SessionInfo {
        remote_addr: String::new(),
        protocol_version: PROTOCOL_VERSION,
        fingerprint: fingerprint.to_string(),
    };
    Ok(WebSocketSession::start(ws, info, true))
}

async fn read_hello<S>(ws: &mut WebSocketStream<S>) -> TransportResult<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match ws.next().await {
            Some(Ok(Message::Binary(data))) => {
                return match Frame::decode(&data) {
                    Ok(Frame::Hello {
                        version,
                        fingerprint,
                    }) => {
                        if version != PROTOCOL_VERSION {
                            Err(TransportError::VersionMismatch(format!(
                                "server speaks v{}, agent speaks v{}",
                                version, PROTOCOL_VERSION
                            )))
                        } else {
                            Ok(fingerprint)
                        }
                    }
                    Ok(other) => Err(TransportError::Protocol(format!(
                        "expected HELLO, got {:?}",
                        other
                    ))),
                    Err(e) => Err(TransportError::Protocol(e.to_string())),
                };
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(TransportError::Connection(
                    "server closed the connection before HELLO".to_string(),
                ))
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(TransportError::Connection(e.to_string())),
        }
    }
}

/// Map an upgrade failure onto the retryable/fatal taxonomy
fn classify_upgrade_error(err: WsError) -> TransportError {
    match err {
        WsError::Http(response) => {
            let status = response.status();
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                TransportError::AuthenticationFailed(format!("server answered {}", status))
            } else if status.is_server_error() {
                TransportError::Connection(format!("server answered {}", status))
            } else {
                TransportError::Handshake(format!("server answered {}", status))
            }
        }
        WsError::Protocol(ProtocolError::SecWebSocketSubProtocolError(e)) => {
            TransportError::VersionMismatch(e.to_string())
        }
        WsError::Io(e) => TransportError::Io(e),
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            TransportError::Connection("connection closed during upgrade".to_string())
        }
        other => TransportError::Handshake(other.to_string()),
    }
}

fn header_value(value: &str) -> TransportResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| TransportError::Handshake(format!("Invalid header value: {}", e)))
}

fn normalize_fingerprint(fp: &str) -> String {
    fp.chars()
        .filter(|c| *c != ':')
        .flat_map(char::to_lowercase)
        .collect()
}
