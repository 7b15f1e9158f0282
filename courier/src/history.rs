//! Conversation history sources.
//!
//! History is fetched when a conversation is opened and again after every
//! reconnect. A failed fetch is not fatal: the conversation starts empty and
//! reports the reason.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use url::Url;

use courier_proto::message::{ConversationKey, MessageRecord, UserId};

/// Default timeout for one history request.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors that can occur while fetching history.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    /// The base URL cannot carry a path.
    #[error("invalid history base url: {0}")]
    InvalidUrl(String),

    /// The request could not be sent or the body could not be read.
    #[error("history request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("history endpoint returned status {0}")]
    Status(u16),

    /// The response body was not a list of message records.
    #[error("history response could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),

    /// The source is unavailable for another reason.
    #[error("history unavailable: {0}")]
    Unavailable(String),
}

/// Something that can produce the stored history of a conversation.
pub trait HistorySource: Send + Sync + 'static {
    /// Fetch every stored message between `self_id` and `peer_id`, oldest first.
    fn fetch(
        &self,
        self_id: &UserId,
        peer_id: &UserId,
    ) -> impl Future<Output = Result<Vec<MessageRecord>, HistoryError>> + Send;
}

/// Fetches history from `GET {base}/messages/{self}/{peer}`.
#[derive(Debug, Clone)]
pub struct HttpHistorySource {
    client: reqwest::Client,
    base: Url,
}

impl HttpHistorySource {
    /// Create a source rooted at `base_url`, with the default timeout.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::InvalidUrl`] if `base_url` does not parse or
    /// cannot carry a path, or [`HistoryError::Http`] if the client cannot
    /// be built.
    pub fn new(base_url: &str) -> Result<Self, HistoryError> {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    /// Create a source with a custom per-request timeout.
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new).
    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, HistoryError> {
        let base =
            Url::parse(base_url).map_err(|e| HistoryError::InvalidUrl(format!("{base_url}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(HistoryError::InvalidUrl(base_url.to_string()));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base })
    }

    /// The URL history for this pair is fetched from.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::InvalidUrl`] if the base cannot carry a path.
    pub fn endpoint(&self, self_id: &UserId, peer_id: &UserId) -> Result<Url, HistoryError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| HistoryError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(["messages", self_id.as_str(), peer_id.as_str()]);
        Ok(url)
    }
}

impl HistorySource for HttpHistorySource {
    async fn fetch(
        &self,
        self_id: &UserId,
        peer_id: &UserId,
    ) -> Result<Vec<MessageRecord>, HistoryError> {
        let url = self.endpoint(self_id, peer_id)?;
        tracing::debug!(url = %url, "fetching history");

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(HistoryError::Status(status.as_u16()));
        }
        let body = response.bytes().await?;
        let records: Vec<MessageRecord> = serde_json::from_slice(&body)?;
        tracing::debug!(count = records.len(), "history fetched");
        Ok(records)
    }
}

#[derive(Default)]
struct Stored {
    conversations: HashMap<ConversationKey, Vec<MessageRecord>>,
    unavailable: Option<String>,
    fetches: usize,
}

/// In-memory history, for tests and offline use.
///
/// Cloning is cheap; clones share the same records.
#[derive(Clone, Default)]
pub struct InMemoryHistory {
    inner: Arc<Mutex<Stored>>,
}

impl InMemoryHistory {
    /// Create an empty history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `record` to its conversation.
    pub fn insert(&self, record: MessageRecord) {
        self.inner
            .lock()
            .conversations
            .entry(ConversationKey::of(&record))
            .or_default()
            .push(record);
    }

    /// Make fetches fail with `reason` (`Some`) or succeed again (`None`).
    pub fn set_unavailable(&self, reason: Option<&str>) {
        self.inner.lock().unavailable = reason.map(str::to_string);
    }

    /// Number of fetches served or refused so far.
    #[must_use]
    pub fn fetch_count(&self) -> usize {
        self.inner.lock().fetches
    }
}

impl HistorySource for InMemoryHistory {
    async fn fetch(
        &self,
        self_id: &UserId,
        peer_id: &UserId,
    ) -> Result<Vec<MessageRecord>, HistoryError> {
        let mut inner = self.inner.lock();
        inner.fetches += 1;
        if let Some(reason) = &inner.unavailable {
            return Err(HistoryError::Unavailable(reason.clone()));
        }
        let key = ConversationKey::new(self_id.clone(), peer_id.clone());
        Ok(inner.conversations.get(&key).cloned().unwrap_or_default())
    }
}
