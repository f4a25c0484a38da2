//! Inbound message from a channel: the unit the spool hands to waiting conversations.

use crate::conversation::ConversationKey;

/// A message from a channel, already reduced to its conversation key, sender and text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub key: ConversationKey,
    pub user: String,
    pub text: String,
}

impl InboundMessage {
    pub fn new(key: ConversationKey, user: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            key,
            user: user.into(),
            text: text.into(),
        }
    }
}
