//! Destination names shared by the client and the broker.

use crate::message::UserId;

/// Destination accepting outbound chat records.
pub const PUBLISH_DESTINATION: &str = "app/chat";

const USER_PREFIX: &str = "user/";
const MESSAGES_SUFFIX: &str = "/messages";

/// Returns the per-user push topic, `user/{user_id}/messages`.
#[must_use]
pub fn user_messages(user: &UserId) -> String {
    format!("{USER_PREFIX}{user}{MESSAGES_SUFFIX}")
}

/// Extracts the user from a per-user push topic, if `topic` is one.
#[must_use]
pub fn parse_user_messages(topic: &str) -> Option<UserId> {
    let user = topic
        .strip_prefix(USER_PREFIX)?
        .strip_suffix(MESSAGES_SUFFIX)?;
    if user.is_empty() || user.contains('/') {
        return None;
    }
    Some(UserId::new(user))
}
