//! State every channel adapter shares: its spool, its conversation handler and
//! its connection state; plus [`deliver`], the single inbound entry point.

use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use std::time::Duration;

use crate::channels::inbound::InboundMessage;
use crate::channels::registry::ChannelAdapter;
use crate::conversation::{Conversation, ConversationHandler, ConversationKey};
use crate::spool::{Dispatch, Spool, SpoolError, WaitPolicy};

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// `send` or inbound delivery while the connection is not `Ready`.
    #[error("channel {0} is not ready")]
    NotReady(String),
    #[error(transparent)]
    Spool(#[from] SpoolError),
    #[error("conversation handler already set for channel {0}")]
    HandlerAlreadySet(String),
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Connection lifecycle of one adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
}

/// What [`deliver`] did with an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// A conversation waiting in `recv` got the message.
    Resumed,
    /// Nobody was waiting; the handler was started on a new conversation.
    Started,
    /// Nobody was waiting and no handler is registered.
    Dropped,
}

pub struct ChannelCore {
    id: String,
    spool: Spool<ConversationKey, InboundMessage>,
    handler: OnceLock<Arc<dyn ConversationHandler>>,
    state: RwLock<ConnectionState>,
}

impl ChannelCore {
    pub fn new(id: impl Into<String>, policy: WaitPolicy) -> Self {
        Self {
            id: id.into(),
            spool: Spool::new(policy),
            handler: OnceLock::new(),
            state: RwLock::new(ConnectionState::Disconnected),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn spool(&self) -> &Spool<ConversationKey, InboundMessage> {
        &self.spool
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    pub fn ensure_ready(&self) -> Result<(), ChannelError> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(ChannelError::NotReady(self.id.clone()))
        }
    }

    /// Move to `next`. Leaving `Ready` drops every pending waiter so nothing
    /// from the old session is resumed by events of the next one.
    pub fn set_state(&self, next: ConnectionState) {
        let prev = {
            let mut g = self.state.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *g, next)
        };
        if prev == next {
            return;
        }
        log::info!("{}: {:?} -> {:?}", self.id, prev, next);
        if prev == ConnectionState::Ready {
            let dropped = self.spool.clear();
            if dropped > 0 {
                log::info!("{}: dropped {} stale waiter(s)", self.id, dropped);
            }
        }
    }

    /// Register the new-conversation handler. Can be set once per adapter.
    pub fn set_handler(&self, handler: Arc<dyn ConversationHandler>) -> Result<(), ChannelError> {
        self.handler
            .set(handler)
            .map_err(|_| ChannelError::HandlerAlreadySet(self.id.clone()))
    }

    pub fn handler(&self) -> Option<Arc<dyn ConversationHandler>> {
        self.handler.get().cloned()
    }
}

/// Route one inbound message: resume the conversation waiting on its key, or
/// start a new one with the registered handler, or drop it.
///
/// Handlers run on their own task; an error or panic inside one never reaches
/// the caller or other conversations.
pub fn deliver(
    channel: &Arc<dyn ChannelAdapter>,
    inbound: InboundMessage,
) -> Result<Delivery, ChannelError> {
    let core = channel.core();
    core.ensure_ready()?;
    let key = inbound.key.clone();
    let inbound = match core.spool().dispatch(&key, inbound) {
        Dispatch::Consumed => {
            log::debug!("{}: resumed conversation on {}", core.id(), key);
            return Ok(Delivery::Resumed);
        }
        Dispatch::Unconsumed(inbound) => inbound,
    };
    let Some(handler) = core.handler() else {
        log::info!("{}: no conversation handler, dropping message on {}", core.id(), key);
        return Ok(Delivery::Dropped);
    };
    log::debug!("{}: new conversation on {}", core.id(), key);
    let conv = Conversation::new(channel.clone(), inbound.key, inbound.user);
    let text = inbound.text;
    tokio::spawn(async move {
        if let Err(e) = handler.converse(text, conv).await {
            log::warn!("conversation on {} failed: {:#}", key, e);
        }
    });
    Ok(Delivery::Started)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::testing::{MockChannel, RecordingHandler};
    use std::time::Duration;

    async fn until_waiting(channel: &MockChannel, key: &ConversationKey) {
        for _ in 0..200 {
            if channel.core().spool().is_waiting(key) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no waiter registered on {}", key);
    }

    #[tokio::test]
    async fn waiter_resolves_then_fallback_starts_new_conversation() {
        let (channel, dyn_channel) = MockChannel::ready();
        let (handler, mut started) = RecordingHandler::new();
        channel.core().set_handler(handler).unwrap();
        let key = MockChannel::key("chan1");

        let conv = Conversation::new(dyn_channel.clone(), key.clone(), "u1");
        let pending = tokio::spawn(async move { conv.recv().await });
        until_waiting(&channel, &key).await;

        let res = deliver(&dyn_channel, InboundMessage::new(key.clone(), "u1", "hello"));
        assert_eq!(res.unwrap(), Delivery::Resumed);
        assert_eq!(pending.await.unwrap().unwrap(), "hello");

        let res = deliver(&dyn_channel, InboundMessage::new(key.clone(), "u1", "again"));
        assert_eq!(res.unwrap(), Delivery::Started);
        let (text, conv) = started.recv().await.unwrap();
        assert_eq!(text, "again");
        assert_eq!(conv.key(), &key);
        assert_eq!(conv.identity(), ("mock", "u1"));
        assert!(started.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsolicited_message_without_handler_is_dropped() {
        let (_channel, dyn_channel) = MockChannel::ready();
        let res = deliver(
            &dyn_channel,
            InboundMessage::new(MockChannel::key("chan2"), "u", "hi"),
        );
        assert_eq!(res.unwrap(), Delivery::Dropped);
    }

    #[tokio::test]
    async fn interleaved_conversations_resolve_their_own_waiters() {
        let (channel, dyn_channel) = MockChannel::ready();
        let a = MockChannel::key("a");
        let b = MockChannel::key("b");
        let conv_a = Conversation::new(dyn_channel.clone(), a.clone(), "ua");
        let conv_b = Conversation::new(dyn_channel.clone(), b.clone(), "ub");
        let task_a = tokio::spawn(async move {
            let first = conv_a.recv().await.unwrap();
            let second = conv_a.recv().await.unwrap();
            (first, second)
        });
        let task_b = tokio::spawn(async move {
            let first = conv_b.recv().await.unwrap();
            let second = conv_b.recv().await.unwrap();
            (first, second)
        });

        for (key, text) in [(&a, "a1"), (&b, "b1"), (&a, "a2"), (&b, "b2")] {
            until_waiting(&channel, key).await;
            let res = deliver(&dyn_channel, InboundMessage::new(key.clone(), "u", text));
            assert_eq!(res.unwrap(), Delivery::Resumed);
        }
        assert_eq!(task_a.await.unwrap(), ("a1".to_string(), "a2".to_string()));
        assert_eq!(task_b.await.unwrap(), ("b1".to_string(), "b2".to_string()));
    }

    #[tokio::test]
    async fn building_a_conversation_does_not_touch_the_spool() {
        let (channel, dyn_channel) = MockChannel::ready();
        let conv = Conversation::new(dyn_channel, MockChannel::key("k"), "u");
        assert!(channel.core().spool().is_empty());
        drop(conv);
        assert!(channel.core().spool().is_empty());
    }

    #[tokio::test]
    async fn not_ready_rejects_send_and_delivery() {
        let (channel, dyn_channel) = MockChannel::ready();
        channel.core().set_state(ConnectionState::Connecting);
        let key = MockChannel::key("k");
        let res = deliver(&dyn_channel, InboundMessage::new(key.clone(), "u", "x"));
        assert!(matches!(res, Err(ChannelError::NotReady(_))));
        let conv = Conversation::new(dyn_channel, key, "u");
        assert!(matches!(conv.send("hi").await, Err(ChannelError::NotReady(_))));
        assert!(channel.sent().is_empty());
    }

    #[tokio::test]
    async fn leaving_ready_closes_stale_waiters() {
        let (channel, dyn_channel) = MockChannel::ready();
        let key = MockChannel::key("k");
        let conv = Conversation::new(dyn_channel, key.clone(), "u");
        let pending = tokio::spawn(async move { conv.recv().await });
        until_waiting(&channel, &key).await;

        channel.core().set_state(ConnectionState::Disconnected);
        let res = pending.await.unwrap();
        assert!(matches!(res, Err(ChannelError::Spool(SpoolError::Closed))));
        assert!(channel.core().spool().is_empty());
    }

    #[tokio::test]
    async fn handler_can_only_be_set_once() {
        let (channel, _) = MockChannel::ready();
        let (first, _rx1) = RecordingHandler::new();
        let (second, _rx2) = RecordingHandler::new();
        channel.core().set_handler(first).unwrap();
        assert!(matches!(
            channel.core().set_handler(second),
            Err(ChannelError::HandlerAlreadySet(_))
        ));
    }

    #[tokio::test]
    async fn recv_timeout_leaves_no_phantom_waiter() {
        let (channel, dyn_channel) = MockChannel::ready();
        let key = MockChannel::key("k");
        let conv = Conversation::new(dyn_channel.clone(), key.clone(), "u");
        let res = conv.recv_timeout(Duration::from_millis(10)).await;
        assert!(matches!(res, Err(ChannelError::Timeout(_))));
        assert!(channel.core().spool().is_empty());
        let res = deliver(&dyn_channel, InboundMessage::new(key, "u", "later"));
        assert_eq!(res.unwrap(), Delivery::Dropped);
    }

    #[tokio::test]
    async fn failing_handler_does_not_disturb_other_conversations() {
        let (channel, dyn_channel) = MockChannel::ready();
        channel
            .core()
            .set_handler(std::sync::Arc::new(crate::channels::testing::FailingHandler))
            .unwrap();
        let bad = MockChannel::key("bad");
        let res = deliver(&dyn_channel, InboundMessage::new(bad, "u", "boom"));
        assert_eq!(res.unwrap(), Delivery::Started);

        let good = MockChannel::key("good");
        let conv = Conversation::new(dyn_channel.clone(), good.clone(), "u");
        let pending = tokio::spawn(async move { conv.recv().await });
        until_waiting(&channel, &good).await;
        let res = deliver(&dyn_channel, InboundMessage::new(good, "u", "fine"));
        assert_eq!(res.unwrap(), Delivery::Resumed);
        assert_eq!(pending.await.unwrap().unwrap(), "fine");
    }

    #[tokio::test]
    async fn exclusive_policy_rejects_second_recv_on_busy_key() {
        let (channel, dyn_channel) = MockChannel::ready_with(WaitPolicy::Exclusive);
        let key = MockChannel::key("busy");
        let first = Conversation::new(dyn_channel.clone(), key.clone(), "u");
        let pending = tokio::spawn(async move { first.recv().await });
        until_waiting(&channel, &key).await;

        let second = Conversation::new(dyn_channel.clone(), key.clone(), "u");
        assert!(matches!(
            second.recv().await,
            Err(ChannelError::Spool(SpoolError::DuplicateWaiter))
        ));
        assert_eq!(channel.core().spool().len(), 1);

        let res = deliver(&dyn_channel, InboundMessage::new(key, "u", "next"));
        assert_eq!(res.unwrap(), Delivery::Resumed);
        assert_eq!(pending.await.unwrap().unwrap(), "next");
    }
}
