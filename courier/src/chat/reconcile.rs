//! Merges history, optimistic sends and broker pushes into one timeline.
//!
//! [`ReconciliationEngine`] is the only writer of its [`ConversationStore`].
//! Every source goes through it, so the dedup and ordering rules live in
//! one place:
//!
//! - history records are appended as confirmed, in fetch order;
//! - a local send is appended as pending before anything reaches the network;
//! - a push that carries the local user's `(sender, client_seq)` is the echo
//!   of a local send and resolves it in place; any other push is appended.
//!
//! Ordering is receipt order. Each mutation queues its events while it still
//! holds the store lock, so the queue is in mutation order whichever thread
//! made the change. Delivery happens after the lock is released, one event
//! at a time, by the caller that finds nobody else delivering; concurrent
//! and re-entrant callers leave their events to it. Observers may therefore
//! read or mutate the engine from inside their callback.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use courier_proto::message::{
    ClientSeq, ConversationKey, MessageRecord, UserId, ValidationError, validate_content,
};

use super::store::{ConversationStore, Resolution, Snapshot};
use super::{ChatEvent, Message};
use crate::observe::{ObserverId, Observers};

/// Source of client sequence numbers.
///
/// Seeded from wall-clock milliseconds so numbers handed out in a later
/// session sort after those of an earlier one.
#[derive(Debug)]
pub struct SeqSource {
    next: AtomicU64,
}

impl SeqSource {
    /// Start from the current time in milliseconds.
    #[must_use]
    pub fn from_clock() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(1, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX / 2));
        Self::starting_at(millis)
    }

    /// Start from a fixed value.
    #[must_use]
    pub const fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// Hand out the next sequence number.
    pub fn next(&self) -> ClientSeq {
        ClientSeq::new(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Make sure later numbers are strictly greater than `seen`.
    pub fn advance_past(&self, seen: ClientSeq) {
        self.next
            .fetch_max(seen.get().saturating_add(1), Ordering::Relaxed);
    }
}

/// What [`ReconciliationEngine::apply_push`] did with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// A new entry was appended at this index.
    Appended(usize),
    /// The echo of a local send confirmed the entry at this index.
    Resolved(usize),
    /// The local entry at this index was dropped in favour of a confirmed copy.
    Merged(usize),
    /// Already present; nothing changed.
    Duplicate,
    /// The record belongs to a different conversation.
    Foreign,
}

/// A record ready for the outbound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    /// Sequence number the record carries.
    pub seq: ClientSeq,
    /// The record to publish.
    pub record: MessageRecord,
}

/// Errors returned by [`ReconciliationEngine::begin_retry`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetryError {
    /// No local message carries this sequence number.
    #[error("no local message with sequence {0}")]
    UnknownMessage(ClientSeq),
    /// The message exists but is not in the failed state.
    #[error("message {0} is not failed")]
    NotFailed(ClientSeq),
}

/// Events not yet delivered, oldest first.
#[derive(Default)]
struct Outbox {
    queue: VecDeque<ChatEvent>,
    /// Some caller is delivering from `queue` right now.
    draining: bool,
}

/// The single writer of one conversation's store.
pub struct ReconciliationEngine {
    self_id: UserId,
    peer_id: UserId,
    key: ConversationKey,
    store: Mutex<ConversationStore>,
    /// Locked only while `store` is held or on its own, never the other way round.
    outbox: Mutex<Outbox>,
    seqs: Arc<SeqSource>,
    observers: Observers<ChatEvent>,
}

impl ReconciliationEngine {
    /// Create an engine for the conversation between `self_id` and `peer_id`.
    #[must_use]
    pub fn new(self_id: UserId, peer_id: UserId, seqs: Arc<SeqSource>) -> Self {
        Self {
            key: ConversationKey::new(self_id.clone(), peer_id.clone()),
            store: Mutex::new(ConversationStore::new(self_id.clone(), peer_id.clone())),
            outbox: Mutex::new(Outbox::default()),
            self_id,
            peer_id,
            seqs,
            observers: Observers::new(),
        }
    }

    /// The local user.
    #[must_use]
    pub const fn self_id(&self) -> &UserId {
        &self.self_id
    }

    /// The other participant.
    #[must_use]
    pub const fn peer_id(&self) -> &UserId {
        &self.peer_id
    }

    /// The conversation this engine owns.
    #[must_use]
    pub const fn key(&self) -> &ConversationKey {
        &self.key
    }

    /// Insert fetched history as confirmed entries, in fetch order.
    ///
    /// Records outside this conversation and records already present are
    /// skipped. Returns the number of entries inserted.
    pub fn load_history(&self, records: Vec<MessageRecord>) -> usize {
        let count = {
            let mut events = Vec::with_capacity(records.len() + 1);
            let mut store = self.store.lock();
            for record in records {
                if ConversationKey::of(&record) != self.key {
                    tracing::warn!(
                        conversation = %self.key,
                        sender = %record.sender_id,
                        recipient = %record.recipient_id,
                        "history record outside conversation skipped"
                    );
                    continue;
                }
                if record.sender_id == self.self_id
                    && let Some(seq) = record.client_seq
                {
                    self.seqs.advance_past(seq);
                }
                let message = Message::confirmed(record);
                if store.append(message.clone()) {
                    events.push(ChatEvent::Appended {
                        index: store.len() - 1,
                        message,
                    });
                }
            }
            let count = events.len();
            events.push(ChatEvent::HistoryLoaded { count });
            self.enqueue(events);
            count
        };
        tracing::debug!(conversation = %self.key, count, "history loaded");
        self.flush();
        count
    }

    /// Merge records fetched again after a reconnect.
    ///
    /// Each record goes through [`apply_push`](Self::apply_push), so entries
    /// already present are skipped and a stored copy of a local send
    /// confirms it. Returns the number of entries appended or confirmed.
    pub fn catch_up(&self, records: Vec<MessageRecord>) -> usize {
        records
            .into_iter()
            .map(|record| self.apply_push(record))
            .filter(|outcome| {
                matches!(
                    outcome,
                    PushOutcome::Appended(_) | PushOutcome::Resolved(_) | PushOutcome::Merged(_)
                )
            })
            .count()
    }

    /// Record that history could not be fetched.
    pub fn history_unavailable(&self, reason: &str) {
        tracing::warn!(conversation = %self.key, reason, "history unavailable");
        self.publish_event(ChatEvent::HistoryUnavailable {
            reason: reason.to_string(),
        });
    }

    /// Append a pending local message and return the record to publish.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] for empty, whitespace-only or oversized
    /// content. The store is untouched in that case.
    pub fn begin_send(&self, content: &str) -> Result<Outbound, ValidationError> {
        validate_content(content)?;
        let seq = self.seqs.next();
        let message = Message::pending(
            self.self_id.clone(),
            self.peer_id.clone(),
            content.to_string(),
            seq,
        );
        let record = message.to_record();
        {
            let mut store = self.store.lock();
            if store.append(message.clone()) {
                self.enqueue([ChatEvent::Appended {
                    index: store.len() - 1,
                    message,
                }]);
            } else {
                tracing::warn!(seq = %seq, "local send collided with an existing entry");
            }
        }
        self.flush();
        tracing::debug!(conversation = %self.key, seq = %seq, "optimistic send");
        Ok(Outbound { seq, record })
    }

    /// Move the pending message `seq` to failed. Returns whether it changed.
    pub fn publish_failed(&self, seq: ClientSeq, reason: &str) -> bool {
        self.fail_pending(seq, reason)
    }

    /// Fail the message `seq` if it is still pending after the confirmation
    /// window. Returns whether it changed.
    pub fn expire(&self, seq: ClientSeq) -> bool {
        self.fail_pending(seq, "not confirmed in time")
    }

    /// Whether the local message `seq` is waiting for its echo.
    #[must_use]
    pub fn is_pending(&self, seq: ClientSeq) -> bool {
        let store = self.store.lock();
        store
            .find_local(seq)
            .and_then(|index| store.get(index))
            .is_some_and(|message| message.delivery.is_pending())
    }

    fn fail_pending(&self, seq: ClientSeq, reason: &str) -> bool {
        let changed = {
            let mut store = self.store.lock();
            let event = store.mark_failed(seq, reason).and_then(|index| {
                store.get(index).map(|message| ChatEvent::Updated {
                    index,
                    message: message.clone(),
                })
            });
            let changed = event.is_some();
            self.enqueue(event);
            changed
        };
        if changed {
            tracing::info!(conversation = %self.key, seq = %seq, reason, "message failed");
            self.flush();
        }
        changed
    }

    /// Move the failed message `seq` back to pending and return the record to
    /// publish again. The sequence number is unchanged.
    ///
    /// # Errors
    ///
    /// [`RetryError::UnknownMessage`] if no local message has `seq`,
    /// [`RetryError::NotFailed`] if it is pending or confirmed.
    pub fn begin_retry(&self, seq: ClientSeq) -> Result<Outbound, RetryError> {
        let record = {
            let mut store = self.store.lock();
            if store.find_local(seq).is_none() {
                return Err(RetryError::UnknownMessage(seq));
            }
            let index = store.mark_pending(seq).ok_or(RetryError::NotFailed(seq))?;
            let message = store
                .get(index)
                .cloned()
                .ok_or(RetryError::UnknownMessage(seq))?;
            let record = message.to_record();
            self.enqueue([ChatEvent::Updated { index, message }]);
            record
        };
        tracing::debug!(conversation = %self.key, seq = %seq, "retrying send");
        self.flush();
        Ok(Outbound { seq, record })
    }

    /// Merge a record pushed by the broker.
    pub fn apply_push(&self, record: MessageRecord) -> PushOutcome {
        if ConversationKey::of(&record) != self.key {
            tracing::debug!(conversation = %self.key, "push for another conversation ignored");
            return PushOutcome::Foreign;
        }

        let outcome = {
            let mut store = self.store.lock();
            let echo_seq = record
                .client_seq
                .filter(|_| record.sender_id == self.self_id)
                .filter(|seq| store.find_local(*seq).is_some());

            let (outcome, event) = if let Some(seq) = echo_seq {
                let resolution = match record.id.clone() {
                    Some(id) => store.resolve(seq, id),
                    None => store.confirm_unidentified(seq),
                };
                match resolution {
                    Resolution::Promoted(index) => (
                        PushOutcome::Resolved(index),
                        store.get(index).map(|message| ChatEvent::Updated {
                            index,
                            message: message.clone(),
                        }),
                    ),
                    Resolution::MergedDuplicate(index) => {
                        (PushOutcome::Merged(index), Some(ChatEvent::Removed { index }))
                    }
                    Resolution::AlreadyConfirmed(_) | Resolution::Unknown => {
                        (PushOutcome::Duplicate, None)
                    }
                }
            } else {
                if record.sender_id == self.self_id
                    && let Some(seq) = record.client_seq
                {
                    self.seqs.advance_past(seq);
                }
                let message = Message::confirmed(record);
                if store.append(message.clone()) {
                    let index = store.len() - 1;
                    (
                        PushOutcome::Appended(index),
                        Some(ChatEvent::Appended { index, message }),
                    )
                } else {
                    (PushOutcome::Duplicate, None)
                }
            };
            self.enqueue(event);
            outcome
        };

        tracing::trace!(conversation = %self.key, outcome = ?outcome, "push applied");
        self.flush();
        outcome
    }

    /// A consistent view of the timeline.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        self.store.lock().list()
    }

    /// Register a change observer.
    pub fn subscribe(&self, on_change: impl Fn(&ChatEvent) + Send + Sync + 'static) -> ObserverId {
        self.observers.add(on_change)
    }

    /// Remove a change observer.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.observers.remove(id)
    }

    /// Forward an event that did not originate in the store.
    pub fn notify(&self, event: &ChatEvent) {
        self.publish_event(event.clone());
    }

    fn publish_event(&self, event: ChatEvent) {
        self.enqueue([event]);
        self.flush();
    }

    /// Queue `events` for delivery. Call with the store lock held when the
    /// events describe a store mutation.
    fn enqueue(&self, events: impl IntoIterator<Item = ChatEvent>) {
        self.outbox.lock().queue.extend(events);
    }

    /// Deliver queued events unless another caller already is.
    fn flush(&self) {
        {
            let mut outbox = self.outbox.lock();
            if outbox.draining {
                return;
            }
            outbox.draining = true;
        }
        let _unwind = DrainGuard(&self.outbox);
        loop {
            // Emptiness and giving up the role are decided under one lock,
            // so an event queued concurrently is never left behind.
            let next = {
                let mut outbox = self.outbox.lock();
                let next = outbox.queue.pop_front();
                if next.is_none() {
                    outbox.draining = false;
                }
                next
            };
            let Some(event) = next else {
                return;
            };
            self.observers.notify(&event);
        }
    }
}

/// Gives up the draining role if an observer panics mid-delivery.
struct DrainGuard<'a>(&'a Mutex<Outbox>);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.lock().draining = false;
        }
    }
}
