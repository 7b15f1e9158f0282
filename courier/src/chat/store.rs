//! Ordered, deduplicated message log for one two-party conversation.
//!
//! Entries are kept in insertion order. Dedup is by server id for
//! confirmed entries and by `(sender, client_seq)` for client-originated
//! ones. Reads go through [`Snapshot`], an immutable copy-on-write view, so
//! a reader never observes a half-applied mutation.

use std::collections::HashSet;
use std::ops::Deref;
use std::sync::Arc;

use courier_proto::message::{ClientSeq, ConversationKey, MessageId, UserId};

use super::{DeliveryState, Message};

/// Immutable view of a conversation at one point in time.
///
/// Cheap to clone and to hold; later mutations of the store do not show
/// through. Iterate it as many times as needed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot(Arc<Vec<Message>>);

impl Snapshot {
    /// Iterate the messages in timeline order.
    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.0.iter()
    }

    /// Copy the messages out.
    #[must_use]
    pub fn to_vec(&self) -> Vec<Message> {
        self.0.as_ref().clone()
    }
}

impl Deref for Snapshot {
    type Target = [Message];

    fn deref(&self) -> &[Message] {
        &self.0
    }
}

impl<'a> IntoIterator for &'a Snapshot {
    type Item = &'a Message;
    type IntoIter = std::slice::Iter<'a, Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Outcome of [`ConversationStore::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The local entry at this index was promoted to confirmed.
    Promoted(usize),
    /// The local entry at this index was already confirmed; nothing changed.
    AlreadyConfirmed(usize),
    /// The id already belonged to another entry, so the local entry that
    /// used to sit at this index was removed.
    ///
    /// This is the one mutation that moves entries: every entry after the
    /// removed one, confirmed or not, now sits one index lower. Their order
    /// relative to each other is unchanged.
    MergedDuplicate(usize),
    /// No local entry carries that sequence number.
    Unknown,
}

/// Message log of one conversation, owned by its reconciliation engine.
#[derive(Debug)]
pub struct ConversationStore {
    key: ConversationKey,
    /// The local user; entries they authored are the ones `resolve` targets.
    owner: UserId,
    messages: Arc<Vec<Message>>,
    ids: HashSet<MessageId>,
    local_keys: HashSet<(UserId, ClientSeq)>,
}

impl ConversationStore {
    /// Create an empty store for the conversation between `owner` and `peer`.
    #[must_use]
    pub fn new(owner: UserId, peer: UserId) -> Self {
        Self {
            key: ConversationKey::new(owner.clone(), peer),
            owner,
            messages: Arc::new(Vec::new()),
            ids: HashSet::new(),
            local_keys: HashSet::new(),
        }
    }

    /// The conversation this store holds.
    #[must_use]
    pub const fn key(&self) -> &ConversationKey {
        &self.key
    }

    /// The local user.
    #[must_use]
    pub const fn owner(&self) -> &UserId {
        &self.owner
    }

    /// Append `message` at the tail unless it duplicates an existing entry.
    ///
    /// Returns `false` (and changes nothing) when an entry with the same id,
    /// or with the same `(sender, client_seq)`, is already present.
    pub fn append(&mut self, message: Message) -> bool {
        if let Some(id) = &message.id
            && self.ids.contains(id)
        {
            return false;
        }
        let local_key = message
            .client_seq
            .map(|seq| (message.sender_id.clone(), seq));
        if let Some(k) = &local_key
            && self.local_keys.contains(k)
        {
            return false;
        }

        if let Some(id) = &message.id {
            self.ids.insert(id.clone());
        }
        if let Some(k) = local_key {
            self.local_keys.insert(k);
        }
        Arc::make_mut(&mut self.messages).push(message);
        true
    }

    /// A consistent view of the current timeline.
    #[must_use]
    pub fn list(&self) -> Snapshot {
        Snapshot(Arc::clone(&self.messages))
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the timeline is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Whether an entry with this server id is present.
    #[must_use]
    pub fn contains_id(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    /// Position of the owner's entry carrying `seq`, if any.
    #[must_use]
    pub fn find_local(&self, seq: ClientSeq) -> Option<usize> {
        self.messages
            .iter()
            .rposition(|m| m.client_seq == Some(seq) && m.sender_id == self.owner)
    }

    /// The entry at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Message> {
        self.messages.get(index)
    }

    /// Promote the owner's entry with `seq` to confirmed under `id`, in place.
    ///
    /// Works from `Pending` and from `Failed` (a publish can be reported as
    /// failed and still reach the broker). Never appends.
    pub fn resolve(&mut self, seq: ClientSeq, id: MessageId) -> Resolution {
        let Some(index) = self.find_local(seq) else {
            return Resolution::Unknown;
        };
        let entry = &self.messages[index];
        if entry.delivery.is_confirmed() {
            if entry.id.as_ref() != Some(&id) {
                tracing::warn!(
                    seq = %seq,
                    existing = ?entry.id,
                    echoed = %id,
                    "echo carries a different id for an already confirmed message"
                );
            }
            return Resolution::AlreadyConfirmed(index);
        }
        if self.ids.contains(&id) {
            Arc::make_mut(&mut self.messages).remove(index);
            return Resolution::MergedDuplicate(index);
        }

        self.ids.insert(id.clone());
        let entry = &mut Arc::make_mut(&mut self.messages)[index];
        entry.id = Some(id);
        entry.delivery = DeliveryState::Confirmed;
        Resolution::Promoted(index)
    }

    /// Promote the owner's entry with `seq` to confirmed when the echo
    /// carries no server id.
    pub fn confirm_unidentified(&mut self, seq: ClientSeq) -> Resolution {
        let Some(index) = self.find_local(seq) else {
            return Resolution::Unknown;
        };
        let entry = &mut Arc::make_mut(&mut self.messages)[index];
        if entry.delivery.is_confirmed() {
            return Resolution::AlreadyConfirmed(index);
        }
        entry.delivery = DeliveryState::Confirmed;
        Resolution::Promoted(index)
    }

    /// Move the owner's `Pending` entry with `seq` to `Failed`.
    ///
    /// Returns its index, or `None` if there is no such pending entry.
    pub fn mark_failed(&mut self, seq: ClientSeq, reason: &str) -> Option<usize> {
        let index = self.find_local(seq)?;
        if !self.messages[index].delivery.is_pending() {
            return None;
        }
        Arc::make_mut(&mut self.messages)[index].delivery = DeliveryState::Failed {
            reason: reason.to_string(),
        };
        Some(index)
    }

    /// Move the owner's `Failed` entry with `seq` back to `Pending`.
    ///
    /// Returns its index, or `None` if there is no such failed entry.
    pub fn mark_pending(&mut self, seq: ClientSeq) -> Option<usize> {
        let index = self.find_local(seq)?;
        if !self.messages[index].delivery.is_failed() {
            return None;
        }
        Arc::make_mut(&mut self.messages)[index].delivery = DeliveryState::Pending;
        Some(index)
    }
}
