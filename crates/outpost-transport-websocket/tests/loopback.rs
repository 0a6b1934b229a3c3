//! Agent connector against an in-test WebSocket server on loopback

use bytes::Bytes;
use outpost_transport::{Connector, RequestReply, TransportError};
use outpost_transport_websocket::{accept, WebSocketConfig, WebSocketConnector};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;

const FINGERPRINT: &str = "3f:a2:91:0c:77";

/// Accept one agent, answer every request with its own payload and echo every channel
/// except `stalled:1`, which is accepted and never read
async fn start_echo_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let established = accept(socket, FINGERPRINT).await.unwrap();
        let _session = established.session;
        let mut requests = established.requests;
        let mut channels = established.channels;

        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                let payload = request.payload.clone();
                request.reply(RequestReply::success(payload));
            }
        });

        let mut stalled = Vec::new();
        while let Some(channel) = channels.recv().await {
            if channel.target == "blocked:1" {
                channel.reject("target not permitted");
                continue;
            }
            if channel.target == "stalled:1" {
                // Accepted but never read
                stalled.push(channel.accept());
                continue;
            }
            let mut stream = channel.accept();
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    format!("ws://{}", addr)
}

fn connector(config: WebSocketConfig) -> WebSocketConnector {
    WebSocketConnector::new(Arc::new(
        config.with_handshake_timeout(Duration::from_secs(5)),
    ))
    .unwrap()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

#[tokio::test]
async fn test_request_and_channel_over_websocket() {
    init_tracing();
    let url = start_echo_server().await;
    let established = connector(WebSocketConfig::client_default().with_auth("client1:secret"))
        .connect(&url)
        .await
        .unwrap();
    let session = established.session;

    assert_eq!(session.info().fingerprint, FINGERPRINT);
    assert_eq!(session.info().protocol_version, outpost_proto::PROTOCOL_VERSION);

    let reply = session
        .send_request("ping", Bytes::from_static(b"hello"))
        .await
        .unwrap();
    assert!(reply.ok);
    assert_eq!(reply.payload, Bytes::from_static(b"hello"));

    let mut channel = session.open_channel("127.0.0.1:22").await.unwrap();
    channel.write_all(b"over the tunnel").await.unwrap();
    let mut buf = [0u8; 15];
    channel.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"over the tunnel");

    let err = session.open_channel("blocked:1").await.unwrap_err();
    assert!(matches!(err, TransportError::ChannelRejected(reason) if reason == "target not permitted"));

    session.close().await;
    assert!(session.is_closed());
    assert!(session.send_request("ping", Bytes::new()).await.is_err());
}

#[tokio::test]
async fn test_stalled_channel_does_not_block_the_session() {
    init_tracing();
    let url = start_echo_server().await;
    let established = connector(WebSocketConfig::client_default())
        .connect(&url)
        .await
        .unwrap();
    let session = established.session;

    let mut stalled = session.open_channel("stalled:1").await.unwrap();
    let flood = tokio::spawn(async move {
        let chunk = vec![0x5au8; 64 * 1024];
        for _ in 0..128 {
            if stalled.write_all(&chunk).await.is_err() {
                break;
            }
        }
    });
    tokio::time::timeout(Duration::from_secs(10), flood)
        .await
        .expect("writes to the stalled channel never drained")
        .unwrap();

    let reply = tokio::time::timeout(
        Duration::from_secs(5),
        session.send_request("ping", Bytes::from_static(b"still here")),
    )
    .await
    .expect("request blocked behind the stalled channel")
    .unwrap();
    assert_eq!(reply.payload, Bytes::from_static(b"still here"));

    let mut channel = session.open_channel("127.0.0.1:22").await.unwrap();
    channel.write_all(b"next channel").await.unwrap();
    let mut buf = [0u8; 12];
    tokio::time::timeout(Duration::from_secs(5), channel.read_exact(&mut buf))
        .await
        .expect("echo blocked behind the stalled channel")
        .unwrap();
    assert_eq!(&buf, b"next channel");
    assert!(!session.is_closed());

    session.close().await;
}

#[tokio::test]
async fn test_fingerprint_mismatch_is_fatal() {
    init_tracing();
    let url = start_echo_server().await;
    let err = connector(WebSocketConfig::client_default().with_fingerprint("00:11"))
        .connect(&url)
        .await
        .unwrap_err();

    assert!(matches!(err, TransportError::FingerprintMismatch { .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_unauthorized_upgrade_is_retryable() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let deny = |_: &Request, _: Response| -> Result<Response, ErrorResponse> {
            let mut response = tokio_tungstenite::tungstenite::handshake::server::ErrorResponse::new(Some("bad credentials".to_string()));
            *response.status_mut() = StatusCode::UNAUTHORIZED;
            Err(response)
        };
        let _ = tokio_tungstenite::accept_hdr_async(socket, deny).await;
    });

    let err = connector(WebSocketConfig::client_default().with_auth("client1:wrong"))
        .connect(&format!("ws://{}", addr))
        .await
        .unwrap_err();

    assert!(matches!(err, TransportError::AuthenticationFailed(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_refused_connection_is_retryable() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = connector(WebSocketConfig::client_default())
        .connect(&format!("ws://{}", addr))
        .await
        .unwrap_err();

    assert!(matches!(err, TransportError::Connection(_)));
    assert!(err.is_retryable());
}
