//! Connection lifecycle for `Courier`.
//!
//! [`ConnectionManager`] owns one [`Transport`](crate::transport::Transport)
//! session at a time, keeps it alive across drops with exponential backoff,
//! and routes inbound pushes to the conversations registered with it.

pub mod connection;

use std::fmt;
use std::time::Duration;

pub use connection::{ConnectionError, ConnectionManager, Inbound, Route, RouteId};

/// State of the shared broker connection.
///
/// `Disconnected → Connecting → Connected → (Dropped → Connecting)*`, and
/// back to `Disconnected` on close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Not open, or closed.
    #[default]
    Disconnected,
    /// A connect attempt is in progress.
    Connecting,
    /// Connected and subscribed to the user topic.
    Connected,
    /// The last attempt failed or the session was lost; a retry is scheduled.
    Dropped,
}

impl ConnectionState {
    /// Whether publishes can go out.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Dropped => "dropped",
        };
        f.write_str(label)
    }
}

/// Retry schedule used after a failed connect or a dropped session.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for the exponential part of the delay.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Add up to this fraction of the delay as random jitter (0 disables).
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl ReconnectConfig {
    /// Delay to wait before retry number `attempt` (zero-based).
    ///
    /// `initial_delay * multiplier^attempt`, capped at `max_delay`, plus a
    /// random share of up to `jitter` of that value.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.capped_delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let extra = base.as_secs_f64() * self.jitter.min(1.0) * rand::random::<f64>();
        base + Duration::from_secs_f64(extra)
    }

    fn capped_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        let max = self.max_delay.as_secs_f64();
        if !scaled.is_finite() || scaled >= max {
            self.max_delay
        } else {
            Duration::from_secs_f64(scaled)
        }
    }
}
