//! Channel adapter trait and registry: register and lookup adapters by id.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::channels::adapter::{ChannelCore, ChannelError};
use crate::conversation::{ConversationHandler, ConversationKey};

/// A running chat surface (Slack, Messenger, terminal, web).
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Channel id, also the namespace of its conversation keys (e.g. "slack").
    fn id(&self) -> &str;
    /// Spool, handler slot and connection state.
    fn core(&self) -> &ChannelCore;
    /// Deliver `text` to the endpoint identified by `key`. Fails with `NotReady` before the connection is up.
    async fn send(&self, key: &ConversationKey, text: &str) -> Result<(), ChannelError>;
    /// Stop the connector; pending waiters are dropped.
    fn stop(&self);
}

/// Registry of channel ids to adapters. Shared across the server.
pub struct ChannelRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<dyn ChannelAdapter>>>>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register an adapter under its id. A previous adapter with the same id is stopped.
    pub async fn register(&self, channel: Arc<dyn ChannelAdapter>) {
        let mut g = self.inner.write().await;
        if let Some(old) = g.insert(channel.id().to_string(), channel) {
            log::info!("replacing channel {}", old.id());
            old.stop();
        }
    }

    /// Register an adapter and hook `handler` up as its new-conversation handler.
    pub async fn register_with_handler(
        &self,
        channel: Arc<dyn ChannelAdapter>,
        handler: Arc<dyn ConversationHandler>,
    ) -> Result<(), ChannelError> {
        channel.core().set_handler(handler)?;
        self.register(channel).await;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<Arc<dyn ChannelAdapter>> {
        let g = self.inner.read().await;
        g.get(id).cloned()
    }

    pub async fn ids(&self) -> Vec<String> {
        let g = self.inner.read().await;
        let mut ids: Vec<String> = g.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn stop_all(&self) {
        let g = self.inner.read().await;
        for channel in g.values() {
            channel.stop();
        }
    }
}
