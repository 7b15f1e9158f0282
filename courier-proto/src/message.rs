//! Wire format message types for the `Courier` protocol.
//!
//! A [`MessageRecord`] is the JSON shape exchanged with the broker: it is
//! what the history endpoint returns, what the publish destination accepts,
//! and what arrives on a user's push topic. Field names are camelCase on
//! the wire.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// Maximum allowed message content size in bytes (64 KB).
pub const MAX_CONTENT_LEN: usize = 64 * 1024;

/// Accepts either a JSON string or a JSON number and yields its text form.
///
/// Backends disagree on whether identifiers are numeric (`1`) or textual
/// (`"1"`); both must compare equal once decoded.
#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    Text(String),
    Unsigned(u64),
    Signed(i64),
}

impl From<StringOrNumber> for String {
    fn from(value: StringOrNumber) -> Self {
        match value {
            StringOrNumber::Text(s) => s,
            StringOrNumber::Unsigned(n) => n.to_string(),
            StringOrNumber::Signed(n) => n.to_string(),
        }
    }
}

/// Identifies a chat participant. Opaque; compared for equality only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Creates a user identifier from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string form of this identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for UserId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        StringOrNumber::deserialize(deserializer).map(|v| Self(v.into()))
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Server-issued message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Creates a message identifier from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string form of this identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        StringOrNumber::deserialize(deserializer).map(|v| Self(v.into()))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Client-assigned sequence number correlating an optimistic send with its echo.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ClientSeq(u64);

impl ClientSeq {
    /// Wraps a raw sequence value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw sequence value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The unordered participant pair identifying a two-party conversation.
///
/// `ConversationKey::new(a, b) == ConversationKey::new(b, a)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    low: UserId,
    high: UserId,
}

impl ConversationKey {
    /// Builds the key for the conversation between `a` and `b`.
    #[must_use]
    pub fn new(a: UserId, b: UserId) -> Self {
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    /// Returns the key of the conversation a record belongs to.
    #[must_use]
    pub fn of(record: &MessageRecord) -> Self {
        Self::new(record.sender_id.clone(), record.recipient_id.clone())
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<->{}", self.low, self.high)
    }
}

/// A chat message as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    /// Server-issued identifier; absent until the broker has accepted the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    /// Author of the message.
    pub sender_id: UserId,
    /// The other participant.
    pub recipient_id: UserId,
    /// Text payload.
    pub content: String,
    /// Sequence assigned by the authoring client, echoed back by the broker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_seq: Option<ClientSeq>,
    /// Opaque chat identifier some backends attach; carried through untouched.
    #[serde(default)]
    pub chat_id: Option<String>,
}

impl MessageRecord {
    /// Builds an outbound record for the publish destination.
    #[must_use]
    pub const fn outbound(
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
            chat_id: None,
        }
    }

    /// Validates the record's content for publishing.
    ///
    /// # Errors
    ///
    /// See [`validate_content`].
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_content(&self.content)
    }
}

/// Errors that can occur when validating message content.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Message content is empty or whitespace only.
    #[error("message content is empty")]
    Empty,
    /// Message content exceeds the maximum allowed size.
    #[error("message too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size of the content in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
}

/// Checks that `content` is non-empty after trimming and within
/// [`MAX_CONTENT_LEN`].
///
/// # Errors
///
/// Returns [`ValidationError::Empty`] for empty or whitespace-only text, or
/// [`ValidationError::TooLarge`] if it exceeds `MAX_CONTENT_LEN` bytes.
pub fn validate_content(content: &str) -> Result<(), ValidationError> {
    if content.trim().is_empty() {
        return Err(ValidationError::Empty);
    }
    let size = content.len();
    if size > MAX_CONTENT_LEN {
        return Err(ValidationError::TooLarge {
            size,
            max: MAX_CONTENT_LEN,
        });
    }
    Ok(())
}
