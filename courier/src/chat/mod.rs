//! Conversation state for `Courier`.
//!
//! Contains the local [`Message`] model with its explicit [`DeliveryState`],
//! the per-conversation [`store::ConversationStore`], and the
//! [`reconcile::ReconciliationEngine`] that merges history, optimistic
//! sends and server pushes into the store.

pub mod reconcile;
pub mod store;

use courier_proto::message::{ClientSeq, MessageId, MessageRecord, UserId};

use crate::net::ConnectionState;

/// Where a message is in its delivery lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryState {
    /// Sent locally, not yet confirmed by the broker.
    Pending,
    /// Confirmed by the broker (echo received) or loaded from history.
    Confirmed,
    /// The publish attempt failed; eligible for retry.
    Failed {
        /// Why the publish failed, for display.
        reason: String,
    },
}

impl DeliveryState {
    /// Returns whether this is [`DeliveryState::Pending`].
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// Returns whether this is [`DeliveryState::Confirmed`].
    #[must_use]
    pub const fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed)
    }

    /// Returns whether this is [`DeliveryState::Failed`].
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// A message as held in a conversation's timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Server-issued id; `None` until confirmed (and for id-less backends).
    pub id: Option<MessageId>,
    /// Author of the message.
    pub sender_id: UserId,
    /// The other participant.
    pub recipient_id: UserId,
    /// Text payload.
    pub content: String,
    /// Sequence assigned by the authoring client, when known.
    pub client_seq: Option<ClientSeq>,
    /// Delivery lifecycle state.
    pub delivery: DeliveryState,
}

impl Message {
    /// A message accepted as confirmed (history or push).
    #[must_use]
    pub fn confirmed(record: MessageRecord) -> Self {
        Self {
            id: record.id,
            sender_id: record.sender_id,
            recipient_id: record.recipient_id,
            content: record.content,
            client_seq: record.client_seq,
            delivery: DeliveryState::Confirmed,
        }
    }

    /// A locally authored message that has not been confirmed yet.
    #[must_use]
    pub const fn pending(
        sender_id: UserId,
        recipient_id: UserId,
        content: String,
        client_seq: ClientSeq,
    ) -> Self {
        Self {
            id: None,
            sender_id,
            recipient_id,
            content,
            client_seq: Some(client_seq),
            delivery: DeliveryState::Pending,
        }
    }

    /// The wire record to publish for this message.
    #[must_use]
    pub fn to_record(&self) -> MessageRecord {
        MessageRecord {
            id: self.id.clone(),
            sender_id: self.sender_id.clone(),
            recipient_id: self.recipient_id.clone(),
            content: self.content.clone(),
            client_seq: self.client_seq,
            chat_id: None,
        }
    }

    /// Whether `user` authored this message.
    #[must_use]
    pub fn is_from(&self, user: &UserId) -> bool {
        self.sender_id == *user
    }
}

/// A visible change to a conversation, delivered to facade observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// A message was added at the tail of the timeline.
    Appended {
        /// Position of the new entry.
        index: usize,
        /// The entry as inserted.
        message: Message,
    },
    /// An existing entry changed in place (confirmed, failed, retried).
    Updated {
        /// Position of the entry.
        index: usize,
        /// The entry after the change.
        message: Message,
    },
    /// A local entry was dropped because its confirmed copy was already present.
    ///
    /// Entries after `index` move down by one; a mirror of the timeline
    /// should remove the same position.
    Removed {
        /// Position the entry occupied.
        index: usize,
    },
    /// History finished loading.
    HistoryLoaded {
        /// Number of entries inserted from history.
        count: usize,
    },
    /// History could not be fetched; the conversation started empty.
    HistoryUnavailable {
        /// Why the fetch failed.
        reason: String,
    },
    /// The shared connection changed state.
    ConnectionChanged(ConnectionState),
}
