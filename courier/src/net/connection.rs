//! The shared, self-healing broker connection.
//!
//! A [`ConnectionManager`] runs one background supervisor task per open
//! period. The supervisor connects, subscribes the user's topic, pumps
//! inbound pushes to registered conversations, and on any failure backs
//! off and tries again until told to stop. Refusals the broker sends for
//! earlier publishes travel the same routes as pushes. State transitions are
//! published synchronously to observers and mirrored on a `watch` channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use courier_proto::message::{ConversationKey, MessageRecord, UserId};
use courier_proto::topic;

use super::{ConnectionState, ReconnectConfig};
use crate::observe::{ObserverId, Observers};
use crate::transport::{SubscriptionId, Transport, TransportError, TransportEvent};

/// Default capacity of each conversation's inbound channel.
pub const DEFAULT_ROUTE_BUFFER: usize = 64;

/// Errors from [`ConnectionManager::open`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// The manager is already open for another user.
    #[error("connection is open for {open}, not {requested}")]
    UserMismatch {
        /// The user the connection was opened for.
        open: UserId,
        /// The user that was requested.
        requested: UserId,
    },
}

/// Handle identifying one registered conversation route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteId(u64);

/// One item on a conversation's inbound feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A record pushed by the broker.
    Push(MessageRecord),
    /// The broker refused a record published from this client.
    Refused {
        /// The record as it was published.
        record: MessageRecord,
        /// The broker's reason.
        reason: String,
    },
}

impl Inbound {
    fn record(&self) -> &MessageRecord {
        match self {
            Self::Push(record) | Self::Refused { record, .. } => record,
        }
    }
}

/// A registered conversation's inbound feed.
#[derive(Debug)]
pub struct Route {
    /// Pass back to [`ConnectionManager::unregister`].
    pub id: RouteId,
    /// The conversation the feed carries pushes for.
    pub key: ConversationKey,
    /// Pushes and refusals for `key`, in receipt order.
    pub receiver: mpsc::Receiver<Inbound>,
}

/// State shared between the manager handle and its supervisor task.
struct Shared {
    state: watch::Sender<ConnectionState>,
    observers: Observers<ConnectionState>,
    routes: Mutex<HashMap<RouteId, (ConversationKey, mpsc::Sender<Inbound>)>>,
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(from = %previous, to = %next, "connection state changed");
            self.observers.notify(&next);
        }
    }

    /// Hand `item` to every conversation registered for its record's key.
    async fn route(&self, item: Inbound) {
        let key = ConversationKey::of(item.record());
        let targets: Vec<mpsc::Sender<Inbound>> = self
            .routes
            .lock()
            .values()
            .filter(|(k, _)| *k == key)
            .map(|(_, tx)| tx.clone())
            .collect();

        if targets.is_empty() {
            tracing::debug!(conversation = %key, "push for unregistered conversation dropped");
            return;
        }
        for tx in targets {
            if tx.send(item.clone()).await.is_err() {
                tracing::debug!(conversation = %key, "conversation closed before push was routed");
            }
        }
    }
}

/// A running supervisor and the means to stop it.
struct Supervisor {
    user: UserId,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Supervisor {
    fn signal_stop(self) -> JoinHandle<()> {
        let _ = self.stop.send(true);
        self.handle
    }
}

/// Owns the transport's lifecycle for every conversation of one facade.
pub struct ConnectionManager<T: Transport> {
    transport: Arc<T>,
    reconnect: ReconnectConfig,
    route_buffer: usize,
    shared: Arc<Shared>,
    supervisor: Mutex<Option<Supervisor>>,
    /// Supervisor told to stop without being awaited (last route removed).
    stopping: Mutex<Option<JoinHandle<()>>>,
    /// Serializes `open` and `close`.
    lifecycle: tokio::sync::Mutex<()>,
    next_route: AtomicU64,
}

impl<T: Transport> ConnectionManager<T> {
    /// Create a closed manager over `transport`.
    #[must_use]
    pub fn new(transport: Arc<T>, reconnect: ReconnectConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            reconnect,
            route_buffer: DEFAULT_ROUTE_BUFFER,
            shared: Arc::new(Shared {
                state,
                observers: Observers::new(),
                routes: Mutex::new(HashMap::new()),
            }),
            supervisor: Mutex::new(None),
            stopping: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            next_route: AtomicU64::new(0),
        }
    }

    /// Set the capacity of each conversation's inbound channel.
    #[must_use]
    pub fn with_route_buffer(mut self, buffer: usize) -> Self {
        self.route_buffer = buffer.max(1);
        self
    }

    /// Start maintaining a connection for `user`.
    ///
    /// The state is `Connecting` when this returns; use
    /// [`settled`](Self::settled) to wait for the first attempt's outcome.
    /// Opening again for the same user is a no-op.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::UserMismatch`] if already open for another user.
    pub async fn open(&self, user: &UserId) -> Result<(), ConnectionError> {
        let _guard = self.lifecycle.lock().await;

        let stopping = self.stopping.lock().take();
        if let Some(handle) = stopping {
            let _ = handle.await;
        }

        if let Some(running) = self.supervisor.lock().as_ref() {
            if running.user != *user {
                return Err(ConnectionError::UserMismatch {
                    open: running.user.clone(),
                    requested: user.clone(),
                });
            }
            return Ok(());
        }

        tracing::info!(user = %user, "opening broker connection");
        self.shared.set_state(ConnectionState::Connecting);
        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(supervise(
            Arc::clone(&self.transport),
            Arc::clone(&self.shared),
            self.reconnect.clone(),
            user.clone(),
            stop_rx,
        ));
        *self.supervisor.lock() = Some(Supervisor {
            user: user.clone(),
            stop,
            handle,
        });
        Ok(())
    }

    /// Wait until no connect attempt is in progress and return the state.
    ///
    /// After [`open`](Self::open) this resolves with `Connected` once the
    /// first attempt succeeds, or `Dropped` if it failed.
    pub async fn settled(&self) -> ConnectionState {
        let mut state = self.watch_state();
        let _ = state
            .wait_for(|s| *s != ConnectionState::Connecting)
            .await
            .map(drop);
        self.state()
    }

    /// Wait until the connection is `Connected`.
    ///
    /// # Errors
    ///
    /// [`TransportError::NotConnected`] if the manager is closed, or closes
    /// while waiting.
    pub async fn ready(&self) -> Result<(), TransportError> {
        let mut state = self.watch_state();
        let connected = state
            .wait_for(|s| s.is_connected() || *s == ConnectionState::Disconnected)
            .await
            .map(|s| s.is_connected());
        match connected {
            Ok(true) => Ok(()),
            _ => Err(TransportError::NotConnected),
        }
    }

    /// Stop the supervisor, release the transport and wait until done.
    ///
    /// Idempotent. No retries happen after this returns.
    pub async fn close(&self) {
        let _guard = self.lifecycle.lock().await;
        let running = self.supervisor.lock().take();
        let stopping = self.stopping.lock().take();

        if let Some(supervisor) = running {
            tracing::info!(user = %supervisor.user, "closing broker connection");
            let _ = supervisor.signal_stop().await;
        }
        if let Some(handle) = stopping {
            let _ = handle.await;
        }
        self.shared.set_state(ConnectionState::Disconnected);
    }

    /// The user the connection is open for, if open.
    #[must_use]
    pub fn user(&self) -> Option<UserId> {
        self.supervisor.lock().as_ref().map(|s| s.user.clone())
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// A `watch` receiver that tracks the connection state.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Call `handler` on every state transition, synchronously with it.
    pub fn on_state_change(
        &self,
        handler: impl Fn(&ConnectionState) + Send + Sync + 'static,
    ) -> ObserverId {
        self.shared.observers.add(handler)
    }

    /// Remove a state observer.
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.shared.observers.remove(id)
    }

    /// Publish `record` to the chat destination.
    ///
    /// Waits for `Connected` first, so a publish made while connecting or
    /// reconnecting goes out on the next session. A transport with no
    /// session at the moment of the write also means waiting for the next
    /// one.
    ///
    /// # Errors
    ///
    /// [`TransportError::NotConnected`] if the manager is closed, otherwise
    /// whatever the transport reports.
    pub async fn publish(&self, record: &MessageRecord) -> Result<(), TransportError> {
        let mut state = self.watch_state();
        loop {
            self.ready().await?;
            match self
                .transport
                .publish(topic::PUBLISH_DESTINATION, record)
                .await
            {
                Err(TransportError::NotConnected) => {
                    tracing::debug!("no session at publish time, waiting for the next one");
                    let _ = state.wait_for(|s| !s.is_connected()).await.map(drop);
                }
                other => return other,
            }
        }
    }

    /// Start routing pushes for `key` to a new bounded channel.
    pub fn register(&self, key: ConversationKey) -> Route {
        let id = RouteId(self.next_route.fetch_add(1, Ordering::Relaxed));
        let (tx, receiver) = mpsc::channel(self.route_buffer);
        self.shared
            .routes
            .lock()
            .insert(id, (key.clone(), tx));
        tracing::debug!(conversation = %key, "conversation registered");
        Route { id, key, receiver }
    }

    /// Stop routing to `id`.
    ///
    /// When the last route goes away the supervisor is told to stop; the
    /// next [`open`](Self::open) or [`close`](Self::close) waits for it.
    /// Safe to call from `Drop`.
    pub fn unregister(&self, id: RouteId) -> bool {
        let (removed, now_empty) = {
            let mut routes = self.shared.routes.lock();
            let removed = routes.remove(&id).is_some();
            (removed, routes.is_empty())
        };
        if removed && now_empty {
            let running = self.supervisor.lock().take();
            if let Some(supervisor) = running {
                tracing::info!(user = %supervisor.user, "last conversation closed, stopping connection");
                let handle = supervisor.signal_stop();
                let mut stopping = self.stopping.lock();
                if let Some(previous) = stopping.replace(handle) {
                    previous.abort();
                }
            }
        }
        removed
    }

    /// Number of registered routes.
    #[must_use]
    pub fn route_count(&self) -> usize {
        self.shared.routes.lock().len()
    }
}

impl<T: Transport> Drop for ConnectionManager<T> {
    fn drop(&mut self) {
        if let Some(supervisor) = self.supervisor.get_mut().take() {
            let _ = supervisor.stop.send(true);
        }
    }
}

/// Resolves once a stop has been requested (or the manager is gone).
async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}

/// Connect and subscribe the user's topic.
async fn establish<T: Transport>(
    transport: &T,
    user: &UserId,
    destination: &str,
) -> Result<(mpsc::Receiver<TransportEvent>, SubscriptionId), TransportError> {
    let events = transport.connect(user).await?;
    match transport.subscribe(destination).await {
        Ok(subscription) => Ok((events, subscription)),
        Err(e) => {
            transport.disconnect().await;
            Err(e)
        }
    }
}

/// Why a connected session ended.
enum SessionEnd {
    Stopped,
    Lost(String),
}

/// Pump one session's events until it drops or a stop is requested.
async fn pump(
    shared: &Shared,
    events: &mut mpsc::Receiver<TransportEvent>,
    stop: &mut watch::Receiver<bool>,
) -> SessionEnd {
    loop {
        let event = tokio::select! {
            biased;
            () = stopped(stop) => return SessionEnd::Stopped,
            event = events.recv() => event,
        };
        match event {
            Some(TransportEvent::Message { record, .. }) => {
                shared.route(Inbound::Push(record)).await;
            }
            Some(TransportEvent::PublishRefused { record, reason }) => {
                tracing::warn!(reason = %reason, "broker refused a publish");
                shared.route(Inbound::Refused { record, reason }).await;
            }
            Some(TransportEvent::Dropped { reason }) => return SessionEnd::Lost(reason),
            None => return SessionEnd::Lost("event stream closed".to_string()),
        }
    }
}

/// Connect, pump, back off, repeat until stopped.
async fn supervise<T: Transport>(
    transport: Arc<T>,
    shared: Arc<Shared>,
    reconnect: ReconnectConfig,
    user: UserId,
    mut stop: watch::Receiver<bool>,
) {
    let destination = topic::user_messages(&user);
    let mut attempt: u32 = 0;

    loop {
        shared.set_state(ConnectionState::Connecting);
        let established = tokio::select! {
            biased;
            () = stopped(&mut stop) => break,
            result = establish(transport.as_ref(), &user, &destination) => result,
        };

        match established {
            Ok((mut events, subscription)) => {
                attempt = 0;
                tracing::info!(user = %user, topic = %destination, "connected and subscribed");
                shared.set_state(ConnectionState::Connected);
                match pump(&shared, &mut events, &mut stop).await {
                    SessionEnd::Stopped => {
                        if let Err(e) = transport.unsubscribe(&subscription).await {
                            tracing::debug!(err = %e, "unsubscribe on close failed");
                        }
                        break;
                    }
                    SessionEnd::Lost(reason) => {
                        tracing::warn!(user = %user, reason = %reason, "connection dropped");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(user = %user, attempt, err = %e, "connect attempt failed");
            }
        }

        shared.set_state(ConnectionState::Dropped);
        let delay = reconnect.delay_for(attempt);
        attempt = attempt.saturating_add(1);
        tracing::debug!(delay = ?delay, attempt, "scheduling reconnect");
        tokio::select! {
            biased;
            () = stopped(&mut stop) => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    transport.disconnect().await;
    shared.set_state(ConnectionState::Disconnected);
    tracing::debug!(user = %user, "supervisor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use courier_proto::message::{ClientSeq, MessageId};

    use crate::transport::loopback::{LoopbackBroker, LoopbackTransport};

    fn fast() -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    fn manager(broker: &LoopbackBroker) -> ConnectionManager<LoopbackTransport> {
        ConnectionManager::new(Arc::new(broker.transport()), fast())
    }

    async fn wait_for_state(
        manager: &ConnectionManager<LoopbackTransport>,
        wanted: ConnectionState,
    ) {
        let mut rx = manager.watch_state();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == wanted))
            .await
            .expect("timed out waiting for state")
            .expect("state channel closed");
    }

    fn key() -> ConversationKey {
        ConversationKey::new(UserId::new("1"), UserId::new("2"))
    }

    #[tokio::test]
    async fn open_connects_and_subscribes_user_topic() {
        let broker = LoopbackBroker::new();
        let manager = manager(&broker);
        let _route = manager.register(key());
        manager.open(&UserId::new("1")).await.unwrap();
        wait_for_state(&manager, ConnectionState::Connected).await;
        assert_eq!(broker.subscription_count("user/1/messages"), 1);
        manager.close().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(broker.session_count(), 0);
    }

    #[tokio::test]
    async fn observers_see_each_transition() {
        let broker = LoopbackBroker::new();
        let manager = manager(&broker);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        manager.on_state_change(move |s| sink.lock().push(*s));

        let _route = manager.register(key());
        manager.open(&UserId::new("1")).await.unwrap();
        wait_for_state(&manager, ConnectionState::Connected).await;
        manager.close().await;

        assert_eq!(
            *seen.lock(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected
            ]
        );
    }

    #[tokio::test]
    async fn pushes_are_routed_by_conversation() {
        let broker = LoopbackBroker::new();
        let manager = manager(&broker);
        let mut with_2 = manager.register(key());
        let mut with_3 = manager.register(ConversationKey::new(UserId::new("1"), UserId::new("3")));
        manager.open(&UserId::new("1")).await.unwrap();
        wait_for_state(&manager, ConnectionState::Connected).await;

        let mut record = MessageRecord::outbound(
            UserId::new("3"),
            UserId::new("1"),
            "from three".into(),
            ClientSeq::new(1),
        );
        record.id = Some(MessageId::new("x"));
        broker.push(&record);

        let got = tokio::time::timeout(Duration::from_secs(1), with_3.receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, Inbound::Push(record));
        assert!(with_2.receiver.try_recv().is_err());
        manager.close().await;
    }

    #[tokio::test]
    async fn publish_refusals_are_routed_to_the_conversation() {
        let broker = LoopbackBroker::new();
        let manager = manager(&broker);
        let mut route = manager.register(key());
        manager.open(&UserId::new("1")).await.unwrap();
        assert_eq!(manager.settled().await, ConnectionState::Connected);

        broker.refuse_next_publishes(1);
        let record = MessageRecord::outbound(
            UserId::new("1"),
            UserId::new("2"),
            "hi".into(),
            ClientSeq::new(3),
        );
        manager.publish(&record).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), route.receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(got, Inbound::Refused { record: r, .. } if r == record));
        manager.close().await;
    }

    #[tokio::test]
    async fn open_is_connecting_until_the_first_attempt_settles() {
        let broker = LoopbackBroker::new();
        let manager = manager(&broker);
        let _route = manager.register(key());
        manager.open(&UserId::new("1")).await.unwrap();
        assert_ne!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.settled().await, ConnectionState::Connected);
        manager.close().await;

        broker.set_reachable(false);
        manager.open(&UserId::new("1")).await.unwrap();
        assert_eq!(manager.settled().await, ConnectionState::Dropped);
        manager.close().await;
    }

    #[tokio::test]
    async fn refused_subscription_is_not_reported_connected() {
        let broker = LoopbackBroker::new();
        let manager = manager(&broker);
        let user = UserId::new("a/b");
        let _route = manager.register(ConversationKey::new(user.clone(), UserId::new("2")));
        manager.open(&user).await.unwrap();
        assert_eq!(manager.settled().await, ConnectionState::Dropped);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(broker.connect_count() >= 2);
        assert_ne!(manager.state(), ConnectionState::Connected);
        assert_eq!(broker.session_count(), 0);
        manager.close().await;
    }

    #[tokio::test]
    async fn publish_waits_for_the_connection() {
        let broker = LoopbackBroker::new();
        broker.set_reachable(false);
        let manager = Arc::new(manager(&broker));
        let _route = manager.register(key());
        manager.open(&UserId::new("1")).await.unwrap();

        let record = MessageRecord::outbound(
            UserId::new("1"),
            UserId::new("2"),
            "early".into(),
            ClientSeq::new(1),
        );
        let publisher = Arc::clone(&manager);
        let pending = tokio::spawn(async move { publisher.publish(&record).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());
        assert!(broker.published().is_empty());

        broker.set_reachable(true);
        tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(broker.published().len(), 1);
        manager.close().await;
    }

    #[tokio::test]
    async fn publish_on_closed_manager_is_not_connected() {
        let broker = LoopbackBroker::new();
        let manager = manager(&broker);
        let record = MessageRecord::outbound(
            UserId::new("1"),
            UserId::new("2"),
            "hi".into(),
            ClientSeq::new(1),
        );
        assert!(matches!(
            manager.publish(&record).await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn drop_triggers_reconnect_and_resubscribe() {
        let broker = LoopbackBroker::new();
        let manager = manager(&broker);
        let _route = manager.register(key());
        manager.open(&UserId::new("1")).await.unwrap();
        wait_for_state(&manager, ConnectionState::Connected).await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        manager.on_state_change(move |s| sink.lock().push(*s));
        broker.drop_connections("network gone");
        tokio::time::timeout(Duration::from_secs(2), async {
            while broker.connect_count() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        wait_for_state(&manager, ConnectionState::Connected).await;

        assert_eq!(broker.connect_count(), 2);
        assert_eq!(broker.subscription_count("user/1/messages"), 1);
        assert_eq!(
            seen.lock()[..3],
            [
                ConnectionState::Dropped,
                ConnectionState::Connecting,
                ConnectionState::Connected
            ]
        );
        manager.close().await;
    }

    #[tokio::test]
    async fn unreachable_broker_is_retried_until_it_returns() {
        let broker = LoopbackBroker::new();
        broker.set_reachable(false);
        let manager = manager(&broker);
        let _route = manager.register(key());
        manager.open(&UserId::new("1")).await.unwrap();
        wait_for_state(&manager, ConnectionState::Dropped).await;

        broker.set_reachable(true);
        wait_for_state(&manager, ConnectionState::Connected).await;
        manager.close().await;
    }

    #[tokio::test]
    async fn close_stops_retries() {
        let broker = LoopbackBroker::new();
        broker.set_reachable(false);
        let manager = manager(&broker);
        let _route = manager.register(key());
        manager.open(&UserId::new("1")).await.unwrap();
        wait_for_state(&manager, ConnectionState::Dropped).await;
        manager.close().await;
        manager.close().await;

        broker.set_reachable(true);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(broker.connect_count(), 0);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn open_for_other_user_is_rejected() {
        let broker = LoopbackBroker::new();
        let manager = manager(&broker);
        let _route = manager.register(key());
        manager.open(&UserId::new("1")).await.unwrap();
        manager.open(&UserId::new("1")).await.unwrap();
        let err = manager.open(&UserId::new("9")).await.unwrap_err();
        assert_eq!(
            err,
            ConnectionError::UserMismatch {
                open: UserId::new("1"),
                requested: UserId::new("9"),
            }
        );
        manager.close().await;
    }

    #[tokio::test]
    async fn last_unregister_shuts_down() {
        let broker = LoopbackBroker::new();
        let manager = manager(&broker);
        let route = manager.register(key());
        manager.open(&UserId::new("1")).await.unwrap();
        wait_for_state(&manager, ConnectionState::Connected).await;

        assert!(manager.unregister(route.id));
        assert!(!manager.unregister(route.id));
        wait_for_state(&manager, ConnectionState::Disconnected).await;
        assert_eq!(manager.user(), None);
        assert_eq!(broker.session_count(), 0);
    }
}
