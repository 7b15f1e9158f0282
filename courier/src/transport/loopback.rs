//! Loopback transport for testing.
//!
//! [`LoopbackBroker`] is an in-process stand-in for the real broker: it
//! accepts publishes, assigns ids, and pushes records to every session
//! subscribed to the recipient's (and, unless disabled, the sender's) user
//! topic. Subscriptions to another user's topic are refused. Test hooks let
//! a caller sever sessions, refuse connects, fail or refuse publishes,
//! inject pushes and replay already-delivered pushes.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use courier_proto::message::{MessageId, MessageRecord, UserId};
use courier_proto::topic;

use super::{SubscriptionId, Transport, TransportError, TransportEvent};

/// Default per-session event channel capacity.
const DEFAULT_BUFFER: usize = 256;

/// One connected client session.
struct Session {
    /// The user the session was opened for.
    user: UserId,
    /// Sender feeding the session's event stream.
    tx: mpsc::Sender<TransportEvent>,
    /// Live subscriptions and the destinations they point at.
    subscriptions: HashMap<SubscriptionId, String>,
}

#[derive(Default)]
struct BrokerState {
    /// Whether new sessions may be opened.
    unreachable: bool,
    /// Whether accepted publishes are echoed to the sender's topic.
    suppress_echo: bool,
    /// Number of upcoming publishes to reject.
    failing_publishes: usize,
    /// Number of upcoming publishes to accept and then refuse asynchronously.
    refused_publishes: usize,
    next_session: u64,
    next_subscription: u64,
    next_message: u64,
    sessions: HashMap<u64, Session>,
    /// Every record accepted through `publish`, in order.
    published: Vec<MessageRecord>,
    /// Every record pushed to each user's topic, in order (for replay).
    delivered: HashMap<UserId, Vec<MessageRecord>>,
    /// Number of successful connects.
    connects: usize,
}

impl BrokerState {
    /// Push `record` to every session subscribed to `user`'s topic.
    fn deliver(&mut self, user: &UserId, record: &MessageRecord) {
        let destination = topic::user_messages(user);
        self.delivered
            .entry(user.clone())
            .or_default()
            .push(record.clone());

        for session in self.sessions.values() {
            for (subscription, dest) in &session.subscriptions {
                if *dest != destination {
                    continue;
                }
                let event = TransportEvent::Message {
                    subscription: subscription.clone(),
                    destination: destination.clone(),
                    record: record.clone(),
                };
                if session.tx.try_send(event).is_err() {
                    tracing::warn!(
                        user = %session.user,
                        destination = %destination,
                        "loopback session buffer full or closed, push dropped"
                    );
                }
            }
        }
    }
}

/// In-process broker shared by any number of [`LoopbackTransport`]s.
///
/// Cloning is cheap; clones refer to the same broker.
#[derive(Clone, Default)]
pub struct LoopbackBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl LoopbackBroker {
    /// Create an empty, reachable broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport attached to this broker.
    #[must_use]
    pub fn transport(&self) -> LoopbackTransport {
        self.transport_with_buffer(DEFAULT_BUFFER)
    }

    /// Create a transport whose session event channels hold `buffer` events.
    #[must_use]
    pub fn transport_with_buffer(&self, buffer: usize) -> LoopbackTransport {
        LoopbackTransport {
            state: Arc::clone(&self.state),
            session: Mutex::new(None),
            buffer,
        }
    }

    /// Make subsequent connects fail (`false`) or succeed (`true`).
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().unreachable = !reachable;
    }

    /// Stop (`false`) or resume (`true`) echoing publishes to their sender.
    pub fn set_echo(&self, echo: bool) {
        self.state.lock().suppress_echo = !echo;
    }

    /// Reject the next `count` publishes.
    pub fn fail_next_publishes(&self, count: usize) {
        self.state.lock().failing_publishes = count;
    }

    /// Accept the next `count` publishes, then answer each with a
    /// [`TransportEvent::PublishRefused`] on the sender's session instead of
    /// delivering it.
    pub fn refuse_next_publishes(&self, count: usize) {
        self.state.lock().refused_publishes = count;
    }

    /// Sever every open session as if the network had gone away.
    pub fn drop_connections(&self, reason: &str) {
        let sessions: Vec<Session> = {
            let mut state = self.state.lock();
            state.sessions.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            tracing::debug!(user = %session.user, reason, "loopback dropping session");
            let _ = session.tx.try_send(TransportEvent::Dropped {
                reason: reason.to_string(),
            });
        }
    }

    /// Push `record` to its recipient's topic without going through `publish`.
    pub fn push(&self, record: &MessageRecord) {
        self.state.lock().deliver(&record.recipient_id, record);
    }

    /// Re-deliver the last `count` records pushed to `user`'s topic.
    ///
    /// Simulates an at-least-once broker replaying after a resubscribe.
    pub fn replay(&self, user: &UserId, count: usize) {
        let mut state = self.state.lock();
        let records: Vec<MessageRecord> = state
            .delivered
            .get(user)
            .map(|log| log[log.len().saturating_sub(count)..].to_vec())
            .unwrap_or_default();
        for record in &records {
            state.deliver(user, record);
        }
    }

    /// Every record accepted through `publish`, in acceptance order.
    #[must_use]
    pub fn published(&self) -> Vec<MessageRecord> {
        self.state.lock().published.clone()
    }

    /// Number of sessions successfully opened so far.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.state.lock().connects
    }

    /// Number of live subscriptions to `destination` across all sessions.
    #[must_use]
    pub fn subscription_count(&self, destination: &str) -> usize {
        self.state
            .lock()
            .sessions
            .values()
            .flat_map(|s| s.subscriptions.values())
            .filter(|d| *d == destination)
            .count()
    }

    /// Number of currently open sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }
}

/// Client handle onto a [`LoopbackBroker`].
pub struct LoopbackTransport {
    state: Arc<Mutex<BrokerState>>,
    /// Id of this transport's current session, if connected.
    session: Mutex<Option<u64>>,
    buffer: usize,
}

impl LoopbackTransport {
    /// Run `f` against this transport's live session.
    fn with_session<R>(
        &self,
        f: impl FnOnce(&mut BrokerState, u64) -> Result<R, TransportError>,
    ) -> Result<R, TransportError> {
        let Some(id) = *self.session.lock() else {
            return Err(TransportError::NotConnected);
        };
        let mut state = self.state.lock();
        if !state.sessions.contains_key(&id) {
            return Err(TransportError::ConnectionClosed);
        }
        f(&mut state, id)
    }
}

impl Transport for LoopbackTransport {
    async fn connect(
        &self,
        user: &UserId,
    ) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        let mut current = self.session.lock();
        let mut state = self.state.lock();
        if let Some(old) = current.take() {
            state.sessions.remove(&old);
        }
        if state.unreachable {
            return Err(TransportError::Unreachable("loopback".to_string()));
        }

        let (tx, rx) = mpsc::channel(self.buffer);
        let id = state.next_session;
        state.next_session += 1;
        state.connects += 1;
        state.sessions.insert(
            id,
            Session {
                user: user.clone(),
                tx,
                subscriptions: HashMap::new(),
            },
        );
        *current = Some(id);
        Ok(rx)
    }

    async fn subscribe(&self, destination: &str) -> Result<SubscriptionId, TransportError> {
        self.with_session(|state, id| {
            let subscription = SubscriptionId::new(format!("sub-{}", state.next_subscription));
            state.next_subscription += 1;
            let Some(session) = state.sessions.get_mut(&id) else {
                return Err(TransportError::ConnectionClosed);
            };
            if topic::parse_user_messages(destination).as_ref() != Some(&session.user) {
                return Err(TransportError::Rejected(format!(
                    "cannot subscribe to {destination}"
                )));
            }
            session
                .subscriptions
                .insert(subscription.clone(), destination.to_string());
            Ok(subscription)
        })
    }

    async fn unsubscribe(&self, subscription: &SubscriptionId) -> Result<(), TransportError> {
        self.with_session(|state, id| {
            if let Some(session) = state.sessions.get_mut(&id) {
                session.subscriptions.remove(subscription);
            }
            Ok(())
        })
    }

    async fn publish(
        &self,
        destination: &str,
        record: &MessageRecord,
    ) -> Result<(), TransportError> {
        self.with_session(|state, id| {
            if destination != topic::PUBLISH_DESTINATION {
                return Err(TransportError::Rejected(format!(
                    "unknown destination {destination}"
                )));
            }
            if state.failing_publishes > 0 {
                state.failing_publishes -= 1;
                return Err(TransportError::Rejected("injected failure".to_string()));
            }
            if state.refused_publishes > 0 {
                state.refused_publishes -= 1;
                if let Some(session) = state.sessions.get(&id) {
                    let _ = session.tx.try_send(TransportEvent::PublishRefused {
                        record: record.clone(),
                        reason: "injected refusal".to_string(),
                    });
                }
                return Ok(());
            }

            let mut accepted = record.clone();
            if accepted.id.is_none() {
                accepted.id = Some(MessageId::new(format!("m-{}", state.next_message)));
                state.next_message += 1;
            }
            state.published.push(accepted.clone());

            state.deliver(&accepted.recipient_id, &accepted);
            if !state.suppress_echo && accepted.sender_id != accepted.recipient_id {
                state.deliver(&accepted.sender_id, &accepted);
            }
            Ok(())
        })
    }

    async fn disconnect(&self) {
        if let Some(id) = self.session.lock().take() {
            self.state.lock().sessions.remove(&id);
        }
    }
}
