//! Test doubles shared by channel and bot tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::channels::adapter::{ChannelCore, ChannelError, ConnectionState};
use crate::channels::registry::ChannelAdapter;
use crate::conversation::{Conversation, ConversationHandler, ConversationKey};
use crate::spool::WaitPolicy;

/// In-memory adapter that records everything sent through it.
pub struct MockChannel {
    core: ChannelCore,
    sent: Mutex<Vec<(ConversationKey, String)>>,
}

impl MockChannel {
    /// A `Ready` mock, both as concrete and trait-object handles.
    pub fn ready() -> (Arc<MockChannel>, Arc<dyn ChannelAdapter>) {
        Self::ready_with(WaitPolicy::Queue)
    }

    pub fn ready_with(policy: WaitPolicy) -> (Arc<MockChannel>, Arc<dyn ChannelAdapter>) {
        let channel = Arc::new(MockChannel {
            core: ChannelCore::new("mock", policy),
            sent: Mutex::new(Vec::new()),
        });
        channel.core.set_state(ConnectionState::Ready);
        let dyn_channel: Arc<dyn ChannelAdapter> = channel.clone();
        (channel, dyn_channel)
    }

    pub fn key(channel: &str) -> ConversationKey {
        ConversationKey::new("mock", channel)
    }

    pub fn sent(&self) -> Vec<(ConversationKey, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent().into_iter().map(|(_, t)| t).collect()
    }
}

#[async_trait]
impl ChannelAdapter for MockChannel {
    fn id(&self) -> &str {
        "mock"
    }

    fn core(&self) -> &ChannelCore {
        &self.core
    }

    async fn send(&self, key: &ConversationKey, text: &str) -> Result<(), ChannelError> {
        self.core.ensure_ready()?;
        self.sent
            .lock()
            .unwrap()
            .push((key.clone(), text.to_string()));
        Ok(())
    }

    fn stop(&self) {
        self.core.set_state(ConnectionState::Disconnected);
    }
}

/// Handler that forwards every new conversation to a channel for inspection.
pub struct RecordingHandler {
    tx: mpsc::UnboundedSender<(String, Conversation)>,
}

impl RecordingHandler {
    pub fn new() -> (
        Arc<RecordingHandler>,
        mpsc::UnboundedReceiver<(String, Conversation)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(RecordingHandler { tx }), rx)
    }
}

#[async_trait]
impl ConversationHandler for RecordingHandler {
    async fn converse(&self, text: String, conv: Conversation) -> anyhow::Result<()> {
        let _ = self.tx.send((text, conv));
        Ok(())
    }
}

/// Handler whose every conversation fails.
pub struct FailingHandler;

#[async_trait]
impl ConversationHandler for FailingHandler {
    async fn converse(&self, text: String, _conv: Conversation) -> anyhow::Result<()> {
        anyhow::bail!("handler failed on {:?}", text)
    }
}
