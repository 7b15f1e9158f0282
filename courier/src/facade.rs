//! The public surface UI code talks to.
//!
//! A [`Courier`] owns the shared broker connection and the history source.
//! Each [`Courier::open`] yields a [`Conversation`]: a live, reconciled
//! timeline with one peer. A conversation runs three background tasks: the
//! inbound drain (pushes and refusals into the engine), the outbound worker
//! (publishes in send order) and the catch-up worker (re-fetches history
//! after every reconnect so records pushed during an outage are merged).

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

use courier_proto::message::{ClientSeq, ConversationKey, MessageRecord, UserId, ValidationError};

use crate::chat::ChatEvent;
use crate::chat::reconcile::{Outbound, ReconciliationEngine, RetryError, SeqSource};
use crate::chat::store::Snapshot;
use crate::history::HistorySource;
use crate::net::connection::DEFAULT_ROUTE_BUFFER;
use crate::net::{
    ConnectionError, ConnectionManager, ConnectionState, Inbound, ReconnectConfig, RouteId,
};
use crate::observe::ObserverId;
use crate::transport::Transport;

/// Tunables for a [`Courier`].
#[derive(Debug, Clone, PartialEq)]
pub struct CourierConfig {
    /// Retry schedule for the broker connection.
    pub reconnect: ReconnectConfig,
    /// Capacity of each conversation's inbound channel.
    pub route_buffer: usize,
    /// Fail a message still pending this long after the outbound worker
    /// picked it up, including any wait for the connection. `None` keeps it
    /// pending until the echo arrives.
    pub confirm_timeout: Option<Duration>,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            route_buffer: DEFAULT_ROUTE_BUFFER,
            confirm_timeout: None,
        }
    }
}

/// Errors from [`Courier::open`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OpenError {
    /// The connection is already open for a different local user.
    #[error("connection is open for {open}, cannot open as {requested}")]
    UserMismatch {
        /// The user the connection belongs to.
        open: UserId,
        /// The user that was requested.
        requested: UserId,
    },
    /// A conversation needs two distinct participants.
    #[error("cannot open a conversation with oneself ({0})")]
    SameParticipant(UserId),
}

impl From<ConnectionError> for OpenError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::UserMismatch { open, requested } => {
                Self::UserMismatch { open, requested }
            }
        }
    }
}

/// Errors from [`Conversation::send`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The content was rejected before anything was stored.
    #[error("invalid message: {0}")]
    Validation(#[from] ValidationError),
    /// The conversation has been closed.
    #[error("conversation is closed")]
    Closed,
}

/// Result of the history fetch performed by [`Courier::open`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryStatus {
    /// History was loaded; `count` entries were inserted.
    Loaded {
        /// Entries inserted.
        count: usize,
    },
    /// History could not be fetched; the conversation started empty.
    Unavailable {
        /// Why the fetch failed.
        reason: String,
    },
}

struct Inner<T: Transport, H: HistorySource> {
    manager: ConnectionManager<T>,
    history: H,
    seqs: Arc<SeqSource>,
    confirm_timeout: Option<Duration>,
}

/// Entry point: one shared connection, any number of conversations.
pub struct Courier<T: Transport, H: HistorySource> {
    inner: Arc<Inner<T, H>>,
}

impl<T: Transport, H: HistorySource> Clone for Courier<T, H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport, H: HistorySource> Courier<T, H> {
    /// Create a facade over `transport` and `history`. Nothing connects
    /// until the first [`open`](Self::open).
    #[must_use]
    pub fn new(transport: T, history: H, config: CourierConfig) -> Self {
        let manager = ConnectionManager::new(Arc::new(transport), config.reconnect)
            .with_route_buffer(config.route_buffer);
        Self {
            inner: Arc::new(Inner {
                manager,
                history,
                seqs: Arc::new(SeqSource::from_clock()),
                confirm_timeout: config.confirm_timeout,
            }),
        }
    }

    /// Open the conversation between `self_id` and `peer_id`.
    ///
    /// Connects (or joins the existing connection), loads history, and
    /// starts the conversation's workers. Returns once the first connect
    /// attempt has an outcome and history is loaded or known to be
    /// unavailable. Neither a failed attempt nor an unavailable history is
    /// an error: the connection keeps retrying, and history is reported
    /// through [`Conversation::history_status`].
    ///
    /// # Errors
    ///
    /// [`OpenError::UserMismatch`] if the connection belongs to another
    /// local user, [`OpenError::SameParticipant`] if both ids are equal.
    pub async fn open(
        &self,
        self_id: UserId,
        peer_id: UserId,
    ) -> Result<Conversation<T, H>, OpenError> {
        if self_id == peer_id {
            return Err(OpenError::SameParticipant(self_id));
        }
        if let Some(open) = self.inner.manager.user()
            && open != self_id
        {
            return Err(OpenError::UserMismatch {
                open,
                requested: self_id,
            });
        }

        let key = ConversationKey::new(self_id.clone(), peer_id.clone());
        let route = self.inner.manager.register(key.clone());
        // Unregisters on drop, so an error or an abandoned open leaves no route.
        let mut teardown = Teardown {
            inner: Arc::clone(&self.inner),
            route: route.id,
            observer: None,
            tasks: Vec::new(),
        };

        self.inner.manager.open(&self_id).await?;
        let initial = self.inner.manager.settled().await;
        tracing::debug!(conversation = %key, state = %initial, "first connect attempt settled");

        let engine = Arc::new(ReconciliationEngine::new(
            self_id.clone(),
            peer_id.clone(),
            Arc::clone(&self.inner.seqs),
        ));
        let weak: Weak<ReconciliationEngine> = Arc::downgrade(&engine);
        let (reconnected_tx, reconnected_rx) = mpsc::unbounded_channel();
        teardown.observer = Some(self.inner.manager.on_state_change(move |state| {
            if let Some(engine) = weak.upgrade() {
                engine.notify(&ChatEvent::ConnectionChanged(*state));
            }
            if state.is_connected() {
                let _ = reconnected_tx.send(());
            }
        }));

        let history_status = match self.inner.history.fetch(&self_id, &peer_id).await {
            Ok(records) => HistoryStatus::Loaded {
                count: engine.load_history(records),
            },
            Err(e) => {
                let reason = e.to_string();
                engine.history_unavailable(&reason);
                HistoryStatus::Unavailable { reason }
            }
        };

        teardown
            .tasks
            .push(tokio::spawn(drain_inbound(Arc::clone(&engine), route.receiver)));
        teardown.tasks.push(tokio::spawn(catch_up(
            Arc::clone(&self.inner),
            Arc::clone(&engine),
            reconnected_rx,
        )));

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        teardown.tasks.push(tokio::spawn(publish_outbound(
            Arc::clone(&self.inner),
            Arc::clone(&engine),
            outbound_rx,
        )));

        tracing::info!(conversation = %key, history = ?history_status, "conversation opened");
        Ok(Conversation {
            key,
            engine,
            outbound: outbound_tx,
            history_status,
            teardown: Mutex::new(Some(teardown)),
        })
    }

    /// Current state of the shared connection.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.manager.state()
    }

    /// Number of conversations currently open.
    #[must_use]
    pub fn open_conversations(&self) -> usize {
        self.inner.manager.route_count()
    }
}

/// Everything a conversation must release when it ends.
struct Teardown<T: Transport, H: HistorySource> {
    inner: Arc<Inner<T, H>>,
    route: RouteId,
    observer: Option<ObserverId>,
    tasks: Vec<JoinHandle<()>>,
}

impl<T: Transport, H: HistorySource> Teardown<T, H> {
    /// Synchronous part of closing: stop workers and unregister.
    fn release(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(observer) = self.observer.take() {
            self.inner.manager.remove_observer(observer);
        }
        self.inner.manager.unregister(self.route);
    }
}

impl<T: Transport, H: HistorySource> Drop for Teardown<T, H> {
    fn drop(&mut self) {
        self.release();
    }
}

/// A live two-party conversation.
///
/// Dropping it performs the same teardown as [`close`](Self::close), minus
/// waiting for the connection to shut down.
pub struct Conversation<T: Transport, H: HistorySource> {
    key: ConversationKey,
    engine: Arc<ReconciliationEngine>,
    outbound: mpsc::UnboundedSender<MessageRecord>,
    history_status: HistoryStatus,
    teardown: Mutex<Option<Teardown<T, H>>>,
}

impl<T: Transport, H: HistorySource> Conversation<T, H> {
    /// The pair this conversation is between.
    #[must_use]
    pub const fn key(&self) -> &ConversationKey {
        &self.key
    }

    /// The local user.
    #[must_use]
    pub fn self_id(&self) -> &UserId {
        self.engine.self_id()
    }

    /// The other participant.
    #[must_use]
    pub fn peer_id(&self) -> &UserId {
        self.engine.peer_id()
    }

    /// Send `content`: it appears as pending at once and is published in
    /// the background. Never waits for the network.
    ///
    /// # Errors
    ///
    /// [`SendError::Validation`] for empty, whitespace-only or oversized
    /// content (nothing is stored or published), [`SendError::Closed`] after
    /// [`close`](Self::close).
    pub fn send(&self, content: &str) -> Result<ClientSeq, SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        let Outbound { seq, record } = self.engine.begin_send(content)?;
        self.enqueue(seq, record);
        Ok(seq)
    }

    /// Publish a failed message again under the same sequence number.
    ///
    /// # Errors
    ///
    /// [`RetryError::UnknownMessage`] or [`RetryError::NotFailed`].
    pub fn retry(&self, seq: ClientSeq) -> Result<(), RetryError> {
        let Outbound { seq, record } = self.engine.begin_retry(seq)?;
        self.enqueue(seq, record);
        Ok(())
    }

    fn enqueue(&self, seq: ClientSeq, record: MessageRecord) {
        if self.outbound.send(record).is_err() {
            self.engine.publish_failed(seq, "conversation closed");
        }
    }

    /// Call `on_change` for every visible change to this conversation.
    pub fn subscribe(&self, on_change: impl Fn(&ChatEvent) + Send + Sync + 'static) -> ObserverId {
        self.engine.subscribe(on_change)
    }

    /// Remove a change observer.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.engine.unsubscribe(id)
    }

    /// The timeline as of now.
    #[must_use]
    pub fn messages(&self) -> Snapshot {
        self.engine.snapshot()
    }

    /// State of the shared connection.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.teardown
            .lock()
            .as_ref()
            .map_or(ConnectionState::Disconnected, |t| t.inner.manager.state())
    }

    /// How the initial history fetch went.
    #[must_use]
    pub const fn history_status(&self) -> &HistoryStatus {
        &self.history_status
    }

    /// Whether [`close`](Self::close) has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.teardown.lock().is_none()
    }

    /// Stop this conversation's workers and unregister it. If it was the
    /// last open conversation, the connection is closed and awaited.
    ///
    /// Idempotent.
    pub async fn close(&self) {
        let teardown = self.teardown.lock().take();
        let Some(mut teardown) = teardown else {
            return;
        };
        teardown.release();
        let inner = Arc::clone(&teardown.inner);
        drop(teardown);
        if inner.manager.route_count() == 0 {
            inner.manager.close().await;
        }
        tracing::info!(conversation = %self.key, "conversation closed");
    }
}

/// Feed routed pushes and refusals into the engine until the route closes.
async fn drain_inbound(engine: Arc<ReconciliationEngine>, mut inbound: mpsc::Receiver<Inbound>) {
    while let Some(item) = inbound.recv().await {
        match item {
            Inbound::Push(record) => {
                engine.apply_push(record);
            }
            Inbound::Refused { record, reason } => {
                if record.sender_id == *engine.self_id()
                    && let Some(seq) = record.client_seq
                {
                    engine.publish_failed(seq, &reason);
                }
            }
        }
    }
}

/// Merge the stored history again after every (re)connect signalled on
/// `reconnected`. Bursts of signals collapse into one fetch.
async fn catch_up<T: Transport, H: HistorySource>(
    inner: Arc<Inner<T, H>>,
    engine: Arc<ReconciliationEngine>,
    mut reconnected: mpsc::UnboundedReceiver<()>,
) {
    while reconnected.recv().await.is_some() {
        while reconnected.try_recv().is_ok() {}
        match inner.history.fetch(engine.self_id(), engine.peer_id()).await {
            Ok(records) => {
                let merged = engine.catch_up(records);
                tracing::debug!(conversation = %engine.key(), merged, "caught up after reconnect");
            }
            Err(e) => {
                tracing::warn!(conversation = %engine.key(), err = %e, "catch-up fetch failed");
            }
        }
    }
}

/// Publish queued records in order; mark failures and arm confirm timers.
///
/// A record waits for the connection before it goes out. The wait is
/// abandoned when the record's confirm timer fails it, and a record that is
/// no longer pending once connected (an earlier attempt was echoed) is
/// skipped.
async fn publish_outbound<T: Transport, H: HistorySource>(
    inner: Arc<Inner<T, H>>,
    engine: Arc<ReconciliationEngine>,
    mut queue: mpsc::UnboundedReceiver<MessageRecord>,
) {
    let mut timers = JoinSet::new();
    loop {
        let record = tokio::select! {
            record = queue.recv() => match record {
                Some(record) => record,
                None => break,
            },
            Some(_) = timers.join_next(), if !timers.is_empty() => continue,
        };
        let Some(seq) = record.client_seq else {
            continue;
        };
        if let Some(timeout) = inner.confirm_timeout {
            let engine = Arc::downgrade(&engine);
            timers.spawn(async move {
                tokio::time::sleep(timeout).await;
                let expired = engine.upgrade().is_some_and(|engine| engine.expire(seq));
                (seq, expired)
            });
        }

        let publish = async {
            inner.manager.ready().await?;
            if !engine.is_pending(seq) {
                return Ok(false);
            }
            inner.manager.publish(&record).await.map(|()| true)
        };
        tokio::pin!(publish);
        let result = loop {
            tokio::select! {
                result = &mut publish => break result,
                Some(joined) = timers.join_next(), if !timers.is_empty() => {
                    if matches!(joined, Ok((expired, true)) if expired == seq) {
                        break Ok(false);
                    }
                }
            }
        };

        match result {
            Ok(true) => tracing::trace!(seq = %seq, "published"),
            Ok(false) => tracing::debug!(seq = %seq, "no longer pending, not published"),
            Err(e) => {
                tracing::warn!(seq = %seq, err = %e, "publish failed");
                engine.publish_failed(seq, &e.to_string());
            }
        }
    }
}
