//! Multiplexed session over a WebSocket connection

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use outpost_transport::{
    Channel, Established, InboundChannel, InboundRequest, RequestReply, Session, SessionInfo,
    TransportError, TransportResult,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::frame::Frame;

const FRAME_QUEUE: usize = 256;
const CHANNEL_QUEUE: usize = 256;
const INBOUND_QUEUE: usize = 64;
const CHANNEL_BUFFER: usize = 64 * 1024;
const READ_CHUNK: usize = 16 * 1024;

/// Inbound side of one open channel
#[derive(Debug)]
struct ChannelHandle {
    /// Dropping the sender signals FIN to the pump
    data: mpsc::Sender<Bytes>,
    /// Tears the pump down without draining
    reset: CancellationToken,
}

impl ChannelHandle {
    fn new(closed: &CancellationToken) -> (Self, mpsc::Receiver<Bytes>) {
        let (data, data_rx) = mpsc::channel(CHANNEL_QUEUE);
        let handle = Self {
            data,
            reset: closed.child_token(),
        };
        (handle, data_rx)
    }
}

#[derive(Debug, Default)]
struct Shared {
    channels: Mutex<HashMap<u32, ChannelHandle>>,
    pending_opens: Mutex<HashMap<u32, oneshot::Sender<Result<(), String>>>>,
    pending_requests: Mutex<HashMap<u32, oneshot::Sender<RequestReply>>>,
}

/// A session multiplexing requests and channels over one WebSocket
#[derive(Debug)]
pub struct WebSocketSession {
    info: SessionInfo,
    frame_tx: mpsc::Sender<Frame>,
    shared: Arc<Shared>,
    /// Channel IDs: odd for the dialing side, even for the accepting side
    next_channel_id: AtomicU32,
    next_request_id: AtomicU32,
    closed: CancellationToken,
}

impl WebSocketSession {
    /// Start the reader and writer tasks for an upgraded connection
    pub fn start<S>(ws: WebSocketStream<S>, info: SessionInfo, is_server: bool) -> Established
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, source) = ws.split();
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE);
        let (requests_tx, requests_rx) = mpsc::channel(INBOUND_QUEUE);
        let (channels_tx, channels_rx) = mpsc::channel(INBOUND_QUEUE);
        let shared = Arc::new(Shared::default());
        let closed = CancellationToken::new();

        let session = Arc::new(Self {
            info,
            frame_tx: frame_tx.clone(),
            shared: shared.clone(),
            next_channel_id: AtomicU32::new(if is_server { 2 } else { 1 }),
            next_request_id: AtomicU32::new(1),
            closed: closed.clone(),
        });

        tokio::spawn(writer_task(sink, frame_rx, closed.clone()));
        tokio::spawn(
            Reader {
                shared,
                frame_tx,
                requests_tx,
                channels_tx,
                closed,
            }
            .run(source),
        );

        Established {
            session,
            requests: requests_rx,
            channels: channels_rx,
        }
    }

    async fn send_frame(&self, frame: Frame) -> TransportResult<()> {
        self.frame_tx
            .send(frame)
            .await
            .map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl Session for WebSocketSession {
    fn info(&self) -> &SessionInfo {
        &self.info
    }

    async fn send_request(&self, kind: &str, payload: Bytes) -> TransportResult<RequestReply> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending_requests.lock().await.insert(id, tx);

        let sent = self
            .send_frame(Frame::Request {
                id,
                kind: kind.to_string(),
                payload,
            })
            .await;
        if let Err(e) = sent {
            self.shared.pending_requests.lock().await.remove(&id);
            return Err(e);
        }

        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            reply = rx => reply.map_err(|_| TransportError::Closed),
        }
    }

    async fn open_channel(&self, target: &str) -> TransportResult<Channel> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let id = self.next_channel_id.fetch_add(2, Ordering::Relaxed);
        let (handle, data_rx) = ChannelHandle::new(&self.closed);
        let reset = handle.reset.clone();
        let (decision_tx, decision_rx) = oneshot::channel();
        self.shared.channels.lock().await.insert(id, handle);
        self.shared.pending_opens.lock().await.insert(id, decision_tx);

        self.send_frame(Frame::Open {
            id,
            target: target.to_string(),
        })
        .await?;

        let decision = tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            decision = decision_rx => decision.map_err(|_| TransportError::Closed),
        };

        match decision {
            Ok(Ok(())) => {
                debug!(channel = id, dest = %target, "Opened channel");
                let (user, pump_end) = tokio::io::duplex(CHANNEL_BUFFER);
                tokio::spawn(pump(
                    id,
                    pump_end,
                    data_rx,
                    self.frame_tx.clone(),
                    self.shared.clone(),
                    reset,
                ));
                Ok(Box::new(user))
            }
            Ok(Err(reason)) => {
                self.shared.channels.lock().await.remove(&id);
                Err(TransportError::ChannelRejected(reason))
            }
            Err(e) => {
                self.shared.channels.lock().await.remove(&id);
                self.shared.pending_opens.lock().await.remove(&id);
                Err(e)
            }
        }
    }

    async fn close(&self) {
        if !self.closed.is_cancelled() {
            debug!(remote = %self.info.remote_addr, "Closing WebSocket session");
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

/// Writer task - serializes frames onto the WebSocket
async fn writer_task<S>(
    mut sink: futures_util::stream::SplitSink<WebSocketStream<S>, Message>,
    mut rx: mpsc::Receiver<Frame>,
    closed: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let encoded = match frame.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("Dropping unencodable frame: {}", e);
                continue;
            }
        };

        if let Err(e) = sink.send(Message::Binary(encoded)).await {
            debug!("WebSocket send error: {}", e);
            break;
        }
    }

    debug!("WebSocket writer task ended");
    closed.cancel();
    let _ = sink.close().await;
}

/// Reader task state - dispatches inbound frames
struct Reader {
    shared: Arc<Shared>,
    frame_tx: mpsc::Sender<Frame>,
    requests_tx: mpsc::Sender<InboundRequest>,
    channels_tx: mpsc::Sender<InboundChannel>,
    closed: CancellationToken,
}

impl Reader {
    async fn run<S>(self, mut source: futures_util::stream::SplitStream<WebSocketStream<S>>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        loop {
            let message = tokio::select! {
                _ = self.closed.cancelled() => break,
                message = source.next() => message,
            };

            match message {
                Some(Ok(Message::Binary(data))) => match Frame::decode(&data) {
                    Ok(frame) => self.dispatch(frame).await,
                    Err(e) => warn!("Invalid frame received: {}", e),
                },
                Some(Ok(Message::Close(_))) => {
                    debug!("WebSocket close received");
                    break;
                }
                Some(Ok(_)) => {
                    // Text, ping and pong are handled or ignored by tungstenite
                }
                Some(Err(e)) => {
                    debug!("WebSocket read error: {}", e);
                    break;
                }
                None => break,
            }
        }

        debug!("WebSocket reader task ended");
        self.closed.cancel();

        // Dropping the senders ends every channel pump and pending waiter
        self.shared.channels.lock().await.clear();
        self.shared.pending_opens.lock().await.clear();
        self.shared.pending_requests.lock().await.clear();
    }

    async fn dispatch(&self, frame: Frame) {
        trace!(?frame, "Received frame");
        match frame {
            Frame::Data { id, payload } => {
                // Never wait on one channel here; a full queue resets that channel only
                let mut channels = self.shared.channels.lock().await;
                let Some(channel) = channels.get(&id) else {
                    trace!(channel = id, "Data for unknown channel");
                    return;
                };
                match channel.data.try_send(payload) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        if let Some(channel) = channels.remove(&id) {
                            channel.reset.cancel();
                        }
                        drop(channels);
                        warn!(channel = id, "Channel is not draining, resetting it");
                        let _ = self.frame_tx.send(Frame::Fin { id }).await;
                    }
                    Err(TrySendError::Closed(_)) => trace!(channel = id, "Channel receiver dropped"),
                }
            }
            Frame::Fin { id } => {
                self.shared.channels.lock().await.remove(&id);
            }
            Frame::Open { id, target } => self.accept_open(id, target).await,
            Frame::OpenOk { id } => {
                if let Some(tx) = self.shared.pending_opens.lock().await.remove(&id) {
                    let _ = tx.send(Ok(()));
                }
            }
            Frame::OpenFail { id, reason } => {
                if let Some(tx) = self.shared.pending_opens.lock().await.remove(&id) {
                    let _ = tx.send(Err(reason));
                }
            }
            Frame::Request { id, kind, payload } => {
                let (request, reply_rx) = InboundRequest::new(kind, payload);
                if self.requests_tx.send(request).await.is_err() {
                    let _ = self
                        .frame_tx
                        .send(Frame::Reply {
                            id,
                            ok: false,
                            payload: Bytes::from_static(b"requests are not served"),
                        })
                        .await;
                    return;
                }

                let frame_tx = self.frame_tx.clone();
                tokio::spawn(async move {
                    let reply = reply_rx
                        .await
                        .unwrap_or_else(|_| RequestReply::failure("request dropped"));
                    let _ = frame_tx
                        .send(Frame::Reply {
                            id,
                            ok: reply.ok,
                            payload: reply.payload,
                        })
                        .await;
                });
            }
            Frame::Reply { id, ok, payload } => {
                if let Some(tx) = self.shared.pending_requests.lock().await.remove(&id) {
                    let _ = tx.send(RequestReply { ok, payload });
                }
            }
            Frame::Hello { .. } => trace!("Ignoring HELLO after handshake"),
        }
    }

    async fn accept_open(&self, id: u32, target: String) {
        let (handle, data_rx) = ChannelHandle::new(&self.closed);
        let reset = handle.reset.clone();
        self.shared.channels.lock().await.insert(id, handle);

        let (user, pump_end) = tokio::io::duplex(CHANNEL_BUFFER);
        let (inbound, decision) = InboundChannel::new(target, Box::new(user));

        if self.channels_tx.send(inbound).await.is_err() {
            self.shared.channels.lock().await.remove(&id);
            let _ = self
                .frame_tx
                .send(Frame::OpenFail {
                    id,
                    reason: "channels are not accepted".to_string(),
                })
                .await;
            return;
        }

        let frame_tx = self.frame_tx.clone();
        let shared = self.shared.clone();
        tokio::spawn(async move {
            match decision.await {
                Ok(Ok(())) => {
                    if frame_tx.send(Frame::OpenOk { id }).await.is_ok() {
                        pump(id, pump_end, data_rx, frame_tx, shared, reset).await;
                    }
                }
                Ok(Err(reason)) => {
                    shared.channels.lock().await.remove(&id);
                    let _ = frame_tx.send(Frame::OpenFail { id, reason }).await;
                }
                Err(_) => {
                    shared.channels.lock().await.remove(&id);
                    let _ = frame_tx
                        .send(Frame::OpenFail {
                            id,
                            reason: "channel dropped".to_string(),
                        })
                        .await;
                }
            }
        });
    }
}

/// Bridge one channel between its duplex stream and the frame queue
async fn pump(
    id: u32,
    stream: DuplexStream,
    mut data_rx: mpsc::Receiver<Bytes>,
    frame_tx: mpsc::Sender<Frame>,
    shared: Arc<Shared>,
    reset: CancellationToken,
) {
    let (mut reader, mut writer) = tokio::io::split(stream);

    let outbound = async {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => {
                    let _ = frame_tx.send(Frame::Fin { id }).await;
                    break;
                }
                Ok(n) => {
                    let frame = Frame::Data {
                        id,
                        payload: Bytes::copy_from_slice(&buf[..n]),
                    };
                    if frame_tx.send(frame).await.is_err() {
                        break;
                    }
                }
            }
        }
    };

    let inbound = async {
        while let Some(data) = data_rx.recv().await {
            if writer.write_all(&data).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    };

    tokio::select! {
        _ = reset.cancelled() => {}
        _ = async { tokio::join!(outbound, inbound) } => {}
    }

    shared.channels.lock().await.remove(&id);
    trace!(channel = id, "Channel closed");
}
