//! In-memory conversation history with FIFO eviction.
//!
//! The [`HistoryLog`] keeps the records accepted by the broker, grouped by
//! conversation. Each conversation is capped; when the cap is exceeded the
//! oldest record is dropped.

use std::collections::{HashMap, VecDeque};

use tokio::sync::RwLock;

use courier_proto::message::{ConversationKey, MessageRecord, UserId};

/// Default maximum number of records kept per conversation.
pub const DEFAULT_MAX_HISTORY: usize = 1000;

/// Per-conversation record log.
///
/// Thread-safe via [`RwLock`]. Each conversation is independent.
pub struct HistoryLog {
    conversations: RwLock<HashMap<ConversationKey, VecDeque<MessageRecord>>>,
    max_per_conversation: usize,
}

impl Default for HistoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryLog {
    /// Creates an empty log with the default cap.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_history(DEFAULT_MAX_HISTORY)
    }

    /// Creates an empty log keeping at most `max_per_conversation` records
    /// per conversation.
    #[must_use]
    pub fn with_max_history(max_per_conversation: usize) -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            max_per_conversation: max_per_conversation.max(1),
        }
    }

    /// Appends `record` to its conversation, returning the new length.
    pub async fn append(&self, record: MessageRecord) -> usize {
        let mut conversations = self.conversations.write().await;
        let log = conversations
            .entry(ConversationKey::of(&record))
            .or_default();
        log.push_back(record);
        if log.len() > self.max_per_conversation {
            log.pop_front();
        }
        log.len()
    }

    /// Every stored record between `a` and `b`, oldest first.
    pub async fn between(&self, a: &UserId, b: &UserId) -> Vec<MessageRecord> {
        let key = ConversationKey::new(a.clone(), b.clone());
        self.conversations
            .read()
            .await
            .get(&key)
            .map(|log| log.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of stored records between `a` and `b`.
    pub async fn len(&self, a: &UserId, b: &UserId) -> usize {
        let key = ConversationKey::new(a.clone(), b.clone());
        self.conversations.read().await.get(&key).map_or(0, VecDeque::len)
    }
}
