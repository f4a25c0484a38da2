//! Conversation handle: one ongoing exchange with a single user on one channel.
//!
//! A conversation is a capability, not state: it pairs a channel adapter with
//! the key that scopes the exchange. `recv` registers a wait with the adapter's
//! spool; `send` goes straight to the adapter's outbound transport.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::channels::{ChannelAdapter, ChannelError};

/// Scope of a conversation: channel namespace (e.g. "slack") plus the
/// channel-side id (Slack channel, Messenger sender, ...). Equality is by value.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct ConversationKey {
    pub namespace: String,
    pub channel: String,
}

impl ConversationKey {
    pub fn new(namespace: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            channel: channel.into(),
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.channel)
    }
}

/// Handle for one exchange, bound to exactly one (adapter, key) pair.
#[derive(Clone)]
pub struct Conversation {
    channel: Arc<dyn ChannelAdapter>,
    key: ConversationKey,
    user: String,
}

impl fmt::Debug for Conversation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conversation")
            .field("channel", &self.channel.id())
            .field("key", &self.key)
            .field("user", &self.user)
            .finish()
    }
}

impl Conversation {
    /// Bind a handle. Does not register anything with the spool.
    pub fn new(
        channel: Arc<dyn ChannelAdapter>,
        key: ConversationKey,
        user: impl Into<String>,
    ) -> Self {
        Self {
            channel,
            key,
            user: user.into(),
        }
    }

    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    /// Namespace of the user id (two equal ids in different namespaces are different users).
    pub fn namespace(&self) -> &str {
        &self.key.namespace
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// `(namespace, user)`, stable for the lifetime of the handle.
    pub fn identity(&self) -> (&str, &str) {
        (&self.key.namespace, &self.user)
    }

    pub async fn send(&self, text: &str) -> Result<(), ChannelError> {
        self.channel.send(&self.key, text).await
    }

    /// Wait for the next message in this conversation. Each call registers a fresh wait.
    pub async fn recv(&self) -> Result<String, ChannelError> {
        let waiter = self.channel.core().spool().wait(self.key.clone())?;
        let msg = waiter.await?;
        Ok(msg.text)
    }

    /// Like [`recv`](Self::recv) but gives up after `timeout`; the abandoned wait is deregistered.
    ///
    /// A message dispatched in the instant between the deadline and the
    /// deregistration counts as delivered and is lost (logged by the spool).
    pub async fn recv_timeout(&self, timeout: Duration) -> Result<String, ChannelError> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(res) => res,
            Err(_) => Err(ChannelError::Timeout(timeout)),
        }
    }
}

/// Receives the first message of every conversation nobody was waiting on.
#[async_trait]
pub trait ConversationHandler: Send + Sync {
    async fn converse(&self, text: String, conv: Conversation) -> anyhow::Result<()>;
}
