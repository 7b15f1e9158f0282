//! WebSocket transport for `Courier`.
//!
//! Implements the [`Transport`] trait over a WebSocket connection to a
//! `courier-broker` (or any broker speaking the same JSON [`Frame`]
//! dialect). Each session is one WebSocket: `connect` performs the
//! `connect`/`connected` handshake and spawns a background reader task that
//! turns `message` and `sendRefused` frames into [`TransportEvent`]s and
//! hands subscription receipts back to the waiting `subscribe` call.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use courier_proto::frame::{self, Frame};
use courier_proto::message::{MessageRecord, UserId};

use super::{SubscriptionId, Transport, TransportError, TransportEvent};

/// Type alias for the write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Subscription id -> waiter for the broker's receipt, per session.
type Receipts = Arc<parking_lot::Mutex<HashMap<String, oneshot::Sender<Result<(), String>>>>>;

/// Default timeout for establishing the WebSocket connection.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for the broker's `connected` and `subscribed` receipts.
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default capacity of the per-session event channel.
const DEFAULT_EVENT_BUFFER: usize = 256;

/// WebSocket transport implementing the [`Transport`] trait.
///
/// Holds at most one live session. The write half is shared behind an
/// async mutex so concurrent publishes are serialized onto the socket.
pub struct WebSocketTransport {
    /// Broker URL (ws:// or wss://).
    url: String,
    connect_timeout: Duration,
    handshake_timeout: Duration,
    /// Write half of the current session's socket.
    writer: Arc<tokio::sync::Mutex<Option<WsSender>>>,
    /// Background reader of the current session.
    reader: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
    /// Subscribe calls of the current session awaiting their receipt.
    receipts: parking_lot::Mutex<Receipts>,
    /// Source of subscription ids, unique for the transport's lifetime.
    next_subscription: AtomicU64,
}

impl WebSocketTransport {
    /// Create a transport for the broker at `url` with default timeouts.
    ///
    /// No connection is made until [`Transport::connect`] is called.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            writer: Arc::new(tokio::sync::Mutex::new(None)),
            reader: parking_lot::Mutex::new(None),
            receipts: parking_lot::Mutex::new(Receipts::default()),
            next_subscription: AtomicU64::new(0),
        }
    }

    /// Override the connect and handshake timeouts.
    #[must_use]
    pub const fn with_timeouts(mut self, connect: Duration, handshake: Duration) -> Self {
        self.connect_timeout = connect;
        self.handshake_timeout = handshake;
        self
    }

    /// Return the broker URL this transport connects to.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Send one frame on the current session.
    ///
    /// A write failure ends the session: the writer is discarded so later
    /// calls fail fast with [`TransportError::NotConnected`].
    async fn send_frame(&self, frame: &Frame) -> Result<(), TransportError> {
        let text = frame::encode(frame)?;
        let mut writer = self.writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            return Err(TransportError::NotConnected);
        };
        if let Err(e) = sink.send(Message::Text(text.into())).await {
            tracing::warn!(err = %e, "broker WebSocket write failed");
            *writer = None;
            return Err(TransportError::ConnectionClosed);
        }
        Ok(())
    }

    /// Tear down the current session's reader and writer without notifying
    /// the broker.
    async fn discard_session(&self) -> Option<WsSender> {
        let reader = self.reader.lock().take();
        if let Some(handle) = reader {
            handle.abort();
        }
        self.writer.lock().await.take()
    }

    /// Wait for the broker's `connected` frame.
    async fn await_connected(&self, reader: &mut WsReader) -> Result<(), TransportError> {
        let handshake = async {
            while let Some(msg) = reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let decoded = match frame::decode(&text) {
                            Ok(f) => f,
                            Err(e) => return Err(TransportError::Codec(e)),
                        };
                        return match decoded {
                            Frame::Connected { user_id } => {
                                tracing::info!(
                                    user = %user_id,
                                    url = %self.url,
                                    "broker session established"
                                );
                                Ok(())
                            }
                            Frame::Error { reason } => {
                                tracing::warn!(reason = %reason, "broker rejected session");
                                Err(TransportError::Rejected(reason))
                            }
                            other => {
                                tracing::warn!(?other, "unexpected frame during handshake");
                                Err(TransportError::Rejected(
                                    "unexpected frame during handshake".to_string(),
                                ))
                            }
                        };
                    }
                    Ok(Message::Close(_)) => return Err(TransportError::ConnectionClosed),
                    Ok(_) => {
                        // Ping/pong/binary frames carry nothing for the handshake.
                    }
                    Err(e) => {
                        tracing::warn!(err = %e, "WebSocket error during handshake");
                        return Err(TransportError::Io(std::io::Error::other(e)));
                    }
                }
            }
            Err(TransportError::ConnectionClosed)
        };

        tokio::time::timeout(self.handshake_timeout, handshake)
            .await
            .map_err(|_| {
                tracing::warn!(url = %self.url, "broker handshake timed out");
                TransportError::Timeout
            })?
    }
}

impl Transport for WebSocketTransport {
    async fn connect(
        &self,
        user: &UserId,
    ) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        drop(self.discard_session().await);

        let (ws_stream, _response) =
            tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str()))
                .await
                .map_err(|_| {
                    tracing::warn!(url = %self.url, "broker WebSocket connect timed out");
                    TransportError::Timeout
                })?
                .map_err(|e| {
                    tracing::warn!(url = %self.url, err = %e, "broker WebSocket connect failed");
                    map_ws_connect_error(&self.url, e)
                })?;

        let (mut ws_sender, mut ws_reader) = ws_stream.split();

        let hello = frame::encode(&Frame::Connect {
            user_id: user.clone(),
        })?;
        ws_sender
            .send(Message::Text(hello.into()))
            .await
            .map_err(|e| {
                tracing::warn!(err = %e, "failed to send connect frame");
                TransportError::Io(std::io::Error::other(e))
            })?;

        self.await_connected(&mut ws_reader).await?;

        let (tx, rx) = mpsc::channel(DEFAULT_EVENT_BUFFER);
        let receipts = Receipts::default();
        let handle = tokio::spawn(reader_loop(ws_reader, tx, Arc::clone(&receipts)));
        *self.writer.lock().await = Some(ws_sender);
        *self.receipts.lock() = receipts;
        *self.reader.lock() = Some(handle);
        Ok(rx)
    }

    async fn subscribe(&self, destination: &str) -> Result<SubscriptionId, TransportError> {
        let n = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let id = SubscriptionId::new(format!("sub-{n}"));
        let receipts = Arc::clone(&self.receipts.lock());
        let (waiter, receipt) = oneshot::channel();
        receipts.lock().insert(id.as_str().to_string(), waiter);

        let sent = self
            .send_frame(&Frame::Subscribe {
                id: id.as_str().to_string(),
                destination: destination.to_string(),
            })
            .await;
        if let Err(e) = sent {
            receipts.lock().remove(id.as_str());
            return Err(e);
        }

        let outcome = tokio::time::timeout(self.handshake_timeout, receipt).await;
        receipts.lock().remove(id.as_str());
        match outcome {
            Ok(Ok(Ok(()))) => {
                tracing::debug!(subscription = %id, destination, "subscribed");
                Ok(id)
            }
            Ok(Ok(Err(reason))) => {
                tracing::warn!(subscription = %id, destination, reason = %reason, "subscription refused");
                Err(TransportError::Rejected(reason))
            }
            // The reader went away with the session.
            Ok(Err(_)) => Err(TransportError::ConnectionClosed),
            Err(_) => {
                tracing::warn!(subscription = %id, destination, "subscription receipt timed out");
                Err(TransportError::Timeout)
            }
        }
    }

    async fn unsubscribe(&self, subscription: &SubscriptionId) -> Result<(), TransportError> {
        self.send_frame(&Frame::Unsubscribe {
            id: subscription.as_str().to_string(),
        })
        .await
    }

    async fn publish(
        &self,
        destination: &str,
        record: &MessageRecord,
    ) -> Result<(), TransportError> {
        self.send_frame(&Frame::Send {
            destination: destination.to_string(),
            body: record.clone(),
        })
        .await
    }

    async fn disconnect(&self) {
        if let Some(mut sink) = self.discard_session().await {
            if let Ok(bye) = frame::encode(&Frame::Disconnect) {
                let _ = sink.send(Message::Text(bye.into())).await;
            }
            let _ = sink.close().await;
            tracing::info!(url = %self.url, "broker session closed");
        }
    }
}

/// Background task that reads WebSocket frames and dispatches them.
///
/// `message` frames become [`TransportEvent::Message`] and `sendRefused`
/// frames become [`TransportEvent::PublishRefused`]. Subscription receipts
/// resolve the matching entry in `receipts`; `error` frames are logged.
/// Malformed frames are logged and skipped; the task does not end the
/// session on bad data. When the socket closes or errors out, pending
/// receipts are abandoned, a [`TransportEvent::Dropped`] is emitted and the
/// task exits.
async fn reader_loop(mut ws_reader: WsReader, tx: mpsc::Sender<TransportEvent>, receipts: Receipts) {
    let reason = loop {
        let Some(msg_result) = ws_reader.next().await else {
            break "stream ended".to_string();
        };
        match msg_result {
            Ok(Message::Text(text)) => match frame::decode(&text) {
                Ok(Frame::Message {
                    subscription,
                    destination,
                    body,
                }) => {
                    let event = TransportEvent::Message {
                        subscription: SubscriptionId::new(subscription),
                        destination,
                        record: body,
                    };
                    if tx.send(event).await.is_err() {
                        // Receiver dropped: nobody is listening to this session.
                        return;
                    }
                }
                Ok(Frame::Subscribed { id }) => {
                    if let Some(waiter) = receipts.lock().remove(&id) {
                        let _ = waiter.send(Ok(()));
                    }
                }
                Ok(Frame::SubscriptionRefused { id, reason }) => {
                    if let Some(waiter) = receipts.lock().remove(&id) {
                        let _ = waiter.send(Err(reason));
                    }
                }
                Ok(Frame::SendRefused { body, reason }) => {
                    tracing::warn!(reason = %reason, "broker refused a publish");
                    let event = TransportEvent::PublishRefused {
                        record: body,
                        reason,
                    };
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                Ok(Frame::Error { reason }) => {
                    tracing::warn!(reason = %reason, "broker error");
                }
                Ok(other) => {
                    tracing::debug!(?other, "unexpected broker frame");
                }
                Err(e) => {
                    tracing::warn!(err = %e, "malformed broker frame, skipping");
                }
            },
            Ok(Message::Close(_)) => break "closed by broker".to_string(),
            Ok(_) => {
                // Ping/pong handled by tungstenite; binary and raw frames ignored.
            }
            Err(e) => {
                tracing::warn!(err = %e, "broker WebSocket read error");
                break e.to_string();
            }
        }
    };
    tracing::info!(reason = %reason, "broker reader task exiting");
    receipts.lock().clear();
    let _ = tx.send(TransportEvent::Dropped { reason }).await;
}

/// Map a `tokio_tungstenite` connection error to a [`TransportError`].
fn map_ws_connect_error(url: &str, err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => {
            if io_err.kind() == std::io::ErrorKind::ConnectionRefused
                || io_err.kind() == std::io::ErrorKind::AddrNotAvailable
            {
                TransportError::Unreachable(url.to_string())
            } else {
                TransportError::Io(io_err)
            }
        }
        WsError::Http(response) => TransportError::Rejected(format!(
            "broker HTTP error: status {}",
            response.status()
        )),
        other => TransportError::Io(std::io::Error::other(format!(
            "broker connection error: {other}"
        ))),
    }
}
