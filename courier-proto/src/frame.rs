//! Broker wire protocol.
//!
//! Defines the [`Frame`] enum exchanged as JSON text over a WebSocket
//! between clients and the broker. The protocol is a small STOMP-style
//! publish/subscribe dialect: a client announces its user id, subscribes
//! to destinations, publishes records to a destination, and receives
//! records pushed to its subscriptions.

use serde::{Deserialize, Serialize};

use crate::message::{MessageRecord, UserId};

/// Frames exchanged between clients and the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Frame {
    /// Client opens a session for a user.
    ///
    /// Must be the first frame sent after the WebSocket is established.
    /// The broker answers with [`Frame::Connected`] on success.
    #[serde(rename_all = "camelCase")]
    Connect {
        /// The user this session acts for.
        user_id: UserId,
    },

    /// Broker acknowledges the session.
    #[serde(rename_all = "camelCase")]
    Connected {
        /// The user the session was opened for (echoed back).
        user_id: UserId,
    },

    /// Client subscribes to a destination under a client-chosen id.
    Subscribe {
        /// Subscription id, unique within the session.
        id: String,
        /// Destination to receive records from.
        destination: String,
    },

    /// Client cancels a subscription.
    Unsubscribe {
        /// Subscription id given in the matching [`Frame::Subscribe`].
        id: String,
    },

    /// Client publishes a record to a destination.
    Send {
        /// Target destination.
        destination: String,
        /// The record being published.
        body: MessageRecord,
    },

    /// Broker delivers a record to a subscription.
    Message {
        /// Subscription id the record is delivered under.
        subscription: String,
        /// Destination the record was delivered to.
        destination: String,
        /// The delivered record.
        body: MessageRecord,
    },

    /// Broker accepted a subscription.
    Subscribed {
        /// Subscription id given in the matching [`Frame::Subscribe`].
        id: String,
    },

    /// Broker refused a subscription; no records will arrive under `id`.
    SubscriptionRefused {
        /// Subscription id given in the matching [`Frame::Subscribe`].
        id: String,
        /// Why the broker refused.
        reason: String,
    },

    /// Broker refused a published record; it was neither stored nor
    /// delivered.
    SendRefused {
        /// The record as the client sent it.
        body: MessageRecord,
        /// Why the broker refused.
        reason: String,
    },

    /// Broker reports an error not tied to a single request.
    Error {
        /// Human-readable error description.
        reason: String,
    },

    /// Client ends the session.
    Disconnect,
}

/// Error type for frame encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Serialization or deserialization failed.
    #[error("frame serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Encodes a [`Frame`] as a JSON string.
///
/// # Errors
///
/// Returns [`FrameError::Serialization`] if the frame cannot be serialized.
pub fn encode(frame: &Frame) -> Result<String, FrameError> {
    Ok(serde_json::to_string(frame)?)
}

/// Decodes a [`Frame`] from JSON text.
///
/// # Errors
///
/// Returns [`FrameError::Serialization`] for malformed JSON or an unknown
/// frame type.
pub fn decode(text: &str) -> Result<Frame, FrameError> {
    Ok(serde_json::from_str(text)?)
}
