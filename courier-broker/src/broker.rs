//! Broker core: session registry, WebSocket handler, publish routing and the
//! history endpoint.
//!
//! A client opens a session with `connect`, subscribes to its own
//! `user/{id}/messages` topic and publishes records to `app/chat`. Every
//! accepted record gets a fresh id, is appended to the [`HistoryLog`], and is
//! pushed to the recipient's topic and back to the sender's topic (the echo
//! the sender uses to confirm its optimistic copy). Each `subscribe` is
//! answered with `subscribed` or `subscriptionRefused`; a refused `send`
//! comes back as `sendRefused` with the record attached.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::Json;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{RwLock, mpsc};

use courier_proto::frame::{self, Frame};
use courier_proto::message::{MessageId, MessageRecord, UserId};
use courier_proto::topic;

use crate::store::HistoryLog;

/// Identifier of one client session.
pub type SessionId = u64;

/// One connected client.
struct Session {
    user: UserId,
    tx: mpsc::UnboundedSender<Message>,
    /// Subscription id -> destination.
    subscriptions: HashMap<String, String>,
}

/// Shared broker state holding the session registry and history.
pub struct BrokerState {
    sessions: RwLock<HashMap<SessionId, Session>>,
    next_session: AtomicU64,
    /// Records accepted so far, per conversation.
    pub history: HistoryLog,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerState {
    /// Creates a broker with no sessions and an empty default-capped history.
    #[must_use]
    pub fn new() -> Self {
        Self::with_history(HistoryLog::new())
    }

    /// Creates a broker over a pre-configured history log.
    #[must_use]
    pub fn with_history(history: HistoryLog) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_session: AtomicU64::new(0),
            history,
        }
    }

    /// Registers a session for `user`. A user may hold several sessions.
    pub async fn register(&self, user: UserId, tx: mpsc::UnboundedSender<Message>) -> SessionId {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        self.sessions.write().await.insert(
            id,
            Session {
                user,
                tx,
                subscriptions: HashMap::new(),
            },
        );
        id
    }

    /// Removes a session.
    pub async fn unregister(&self, id: SessionId) -> bool {
        self.sessions.write().await.remove(&id).is_some()
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Number of live subscriptions to `destination`.
    pub async fn subscription_count(&self, destination: &str) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .flat_map(|s| s.subscriptions.values())
            .filter(|d| *d == destination)
            .count()
    }

    /// Adds a subscription to session `id`.
    ///
    /// # Errors
    ///
    /// Returns a reason string if the destination is not the session's own
    /// user topic, or if the session is gone.
    pub async fn subscribe(
        &self,
        id: SessionId,
        subscription: String,
        destination: String,
    ) -> Result<(), String> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&id)
            .ok_or_else(|| "session not found".to_string())?;
        if topic::parse_user_messages(&destination).as_ref() != Some(&session.user) {
            return Err(format!("cannot subscribe to {destination}"));
        }
        session.subscriptions.insert(subscription, destination);
        Ok(())
    }

    /// Removes a subscription from session `id`.
    pub async fn unsubscribe(&self, id: SessionId, subscription: &str) -> bool {
        self.sessions
            .write()
            .await
            .get_mut(&id)
            .is_some_and(|s| s.subscriptions.remove(subscription).is_some())
    }

    /// Accepts a record published by `sender`: assigns an id, stores it and
    /// pushes it to both participants' topics. Returns the stored record.
    ///
    /// # Errors
    ///
    /// Returns a reason string if the content is invalid.
    pub async fn publish(
        &self,
        sender: &UserId,
        mut record: MessageRecord,
    ) -> Result<MessageRecord, String> {
        record.validate().map_err(|e| e.to_string())?;
        // The authenticated user always wins over the claimed sender.
        record.sender_id = sender.clone();
        record.id = Some(MessageId::new(uuid::Uuid::now_v7().to_string()));

        let stored = self.history.append(record.clone()).await;
        tracing::debug!(
            sender = %record.sender_id,
            recipient = %record.recipient_id,
            stored,
            "record accepted"
        );

        self.deliver(&record.recipient_id, &record).await;
        if record.sender_id != record.recipient_id {
            self.deliver(&record.sender_id, &record).await;
        }
        Ok(record)
    }

    /// Pushes `record` to every session subscribed to `user`'s topic.
    pub async fn deliver(&self, user: &UserId, record: &MessageRecord) {
        let destination = topic::user_messages(user);
        let sessions = self.sessions.read().await;
        for session in sessions.values() {
            for (subscription, dest) in &session.subscriptions {
                if *dest != destination {
                    continue;
                }
                let frame = Frame::Message {
                    subscription: subscription.clone(),
                    destination: destination.clone(),
                    body: record.clone(),
                };
                if let Some(msg) = encode(&frame)
                    && session.tx.send(msg).is_err()
                {
                    tracing::debug!(user = %session.user, "session writer gone, push dropped");
                }
            }
        }
    }

    /// Send a WebSocket Close frame to every session.
    ///
    /// Each client's reader sees the close and reports a dropped session.
    /// Useful for graceful shutdown and testing.
    pub async fn close_all_connections(&self) {
        let sessions = self.sessions.read().await;
        for (id, session) in sessions.iter() {
            tracing::info!(session = id, user = %session.user, "sending close frame");
            let _ = session.tx.send(Message::Close(None));
        }
    }

    async fn send_to(&self, id: SessionId, frame: &Frame) {
        if let Some(session) = self.sessions.read().await.get(&id)
            && let Some(msg) = encode(frame)
        {
            let _ = session.tx.send(msg);
        }
    }
}

fn encode(frame: &Frame) -> Option<Message> {
    match frame::encode(frame) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode frame");
            None
        }
    }
}

/// Handles an upgraded WebSocket connection for a single session.
///
/// The connection lifecycle:
/// 1. Wait for a `connect` frame.
/// 2. Register the session and answer `connected`.
/// 3. Process `subscribe`/`unsubscribe`/`send` until the client leaves.
/// 4. Unregister the session.
pub async fn handle_socket(socket: WebSocket, state: Arc<BrokerState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let Some(user) = wait_for_connect(&mut ws_receiver).await else {
        tracing::warn!("connection closed before connect frame");
        return;
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let session = state.register(user.clone(), tx).await;

    let ack = Frame::Connected {
        user_id: user.clone(),
    };
    let sent = match encode(&ack) {
        Some(msg) => ws_sender.send(msg).await.is_ok(),
        None => false,
    };
    if !sent {
        tracing::error!(user = %user, "failed to send connected frame");
        state.unregister(session).await;
        return;
    }
    tracing::info!(user = %user, session, "session opened");

    let writer_user = user.clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(user = %writer_user, "WebSocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    let reader_user = user.clone();
    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    if !handle_frame(session, &reader_user, text.as_str(), &reader_state).await {
                        break;
                    }
                }
                Message::Close(_) => {
                    tracing::info!(user = %reader_user, "received close frame");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    state.unregister(session).await;
    tracing::info!(user = %user, session, "session closed");
}

/// Waits for the first frame, expecting `connect`.
async fn wait_for_connect(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
) -> Option<UserId> {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => match frame::decode(text.as_str()) {
                Ok(Frame::Connect { user_id }) => {
                    if user_id.as_str().is_empty() {
                        tracing::warn!("connect frame with empty user id");
                        return None;
                    }
                    return Some(user_id);
                }
                Ok(other) => {
                    tracing::warn!(frame = ?other, "expected connect frame");
                    return None;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to decode connect frame");
                    return None;
                }
            },
            Message::Close(_) => return None,
            _ => {}
        }
    }
    None
}

/// Processes one frame from a connected session. Returns `false` when the
/// client asked to disconnect.
async fn handle_frame(session: SessionId, user: &UserId, text: &str, state: &BrokerState) -> bool {
    let frame = match frame::decode(text) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(user = %user, error = %e, "failed to decode frame");
            state
                .send_to(session, &Frame::Error {
                    reason: format!("malformed frame: {e}"),
                })
                .await;
            return true;
        }
    };

    match frame {
        Frame::Subscribe { id, destination } => {
            tracing::debug!(user = %user, subscription = %id, destination = %destination, "subscribe");
            let receipt = match state.subscribe(session, id.clone(), destination).await {
                Ok(()) => Frame::Subscribed { id },
                Err(reason) => {
                    tracing::warn!(user = %user, reason = %reason, "subscribe refused");
                    Frame::SubscriptionRefused { id, reason }
                }
            };
            state.send_to(session, &receipt).await;
        }
        Frame::Unsubscribe { id } => {
            state.unsubscribe(session, &id).await;
        }
        Frame::Send { destination, body } => {
            let outcome = if destination == topic::PUBLISH_DESTINATION {
                state.publish(user, body.clone()).await.map(drop)
            } else {
                Err(format!("unknown destination {destination}"))
            };
            if let Err(reason) = outcome {
                tracing::warn!(user = %user, reason = %reason, "publish refused");
                state.send_to(session, &Frame::SendRefused { body, reason }).await;
            }
        }
        Frame::Disconnect => {
            tracing::debug!(user = %user, "client disconnect");
            return false;
        }
        other => {
            tracing::warn!(user = %user, frame = ?other, "unexpected frame from client");
        }
    }
    true
}

/// Starts the broker on the given address and returns the bound address
/// and a join handle.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(BrokerState::new())).await
}

/// Starts the broker with a pre-configured [`BrokerState`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<BrokerState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .route("/messages/{a}/{b}", axum::routing::get(history_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "broker server error");
        }
    });

    Ok((bound_addr, handle))
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    State(state): State<Arc<BrokerState>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// `GET /messages/{a}/{b}`: stored records of the pair, oldest first.
async fn history_handler(
    Path((a, b)): Path<(String, String)>,
    State(state): State<Arc<BrokerState>>,
) -> Json<Vec<MessageRecord>> {
    let records = state
        .history
        .between(&UserId::new(a), &UserId::new(b))
        .await;
    Json(records)
}
