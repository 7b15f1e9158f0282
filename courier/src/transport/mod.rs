//! Transport layer abstraction for `Courier`.
//!
//! Defines the [`Transport`] trait that all publish/subscribe adapters must
//! satisfy. Concrete implementations include:
//! - [`loopback::LoopbackBroker`] - in-process broker for testing
//! - [`websocket::WebSocketTransport`] - JSON frames over a WebSocket
//!
//! A transport performs framing and the raw connect/subscribe/publish
//! primitives only. It does not reconnect on its own; that is the job of
//! [`crate::net::ConnectionManager`].

pub mod loopback;
pub mod websocket;

use std::fmt;

use tokio::sync::mpsc;

use courier_proto::message::{MessageRecord, UserId};

/// Identifier of one live subscription on a transport session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    /// Create a subscription identifier from a string representation.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Return the string representation of this subscription ID.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Something that happened on an established transport session.
///
/// Delivered through the channel returned by [`Transport::connect`]. The
/// session is over once `Dropped` is received or the channel closes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A record arrived on one of the session's subscriptions.
    Message {
        /// The subscription it was delivered under.
        subscription: SubscriptionId,
        /// The destination it was published to.
        destination: String,
        /// The delivered record.
        record: MessageRecord,
    },
    /// The broker refused a record that `publish` had already handed over.
    PublishRefused {
        /// The record as it was sent.
        record: MessageRecord,
        /// The broker's reason.
        reason: String,
    },
    /// The session ended without the client asking for it.
    Dropped {
        /// Human-readable reason, for logging.
        reason: String,
    },
}

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The session was closed while the operation was in progress.
    #[error("connection closed")]
    ConnectionClosed,

    /// There is no established session to perform the operation on.
    #[error("not connected")]
    NotConnected,

    /// The operation timed out before completing.
    #[error("transport operation timed out")]
    Timeout,

    /// The broker could not be reached.
    #[error("broker {0} is unreachable")]
    Unreachable(String),

    /// The broker refused the operation.
    #[error("rejected by broker: {0}")]
    Rejected(String),

    /// A frame could not be encoded or decoded.
    #[error("frame codec error: {0}")]
    Codec(#[from] courier_proto::frame::FrameError),

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Async publish/subscribe transport.
///
/// One transport value carries at most one session at a time. A session is
/// opened with [`connect`](Transport::connect), which hands back the stream
/// of [`TransportEvent`]s for that session. Subscriptions belong to the
/// session and do not survive it: after a drop the caller must reconnect
/// and subscribe again.
pub trait Transport: Send + Sync + 'static {
    /// Open a session for `user`.
    ///
    /// Returns the receiving end of the session's event stream. Any
    /// previous session on this transport is discarded first.
    fn connect(
        &self,
        user: &UserId,
    ) -> impl std::future::Future<Output = Result<mpsc::Receiver<TransportEvent>, TransportError>>
    + Send;

    /// Subscribe the current session to `destination`.
    ///
    /// Resolves once the broker has confirmed the subscription. A refusal
    /// is reported as [`TransportError::Rejected`].
    fn subscribe(
        &self,
        destination: &str,
    ) -> impl std::future::Future<Output = Result<SubscriptionId, TransportError>> + Send;

    /// Cancel a subscription of the current session.
    fn unsubscribe(
        &self,
        subscription: &SubscriptionId,
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;

    /// Publish `record` to `destination`.
    ///
    /// Returns `Ok(())` once the record has been handed to the broker. This
    /// does NOT mean it was accepted; acceptance is signalled by the echo
    /// and a later refusal arrives as [`TransportEvent::PublishRefused`].
    fn publish(
        &self,
        destination: &str,
        record: &MessageRecord,
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;

    /// End the current session, if any. Never fails.
    fn disconnect(&self) -> impl std::future::Future<Output = ()> + Send;
}
