//! Communication channels (Slack, Messenger, terminal, web).
//!
//! Every adapter owns a [`ChannelCore`] (spool, handler slot, connection
//! state) and funnels inbound messages through [`deliver`], which either
//! resumes the conversation waiting on the message's key or starts a new one.

mod adapter;
mod inbound;
mod messenger;
mod registry;
mod slack;
mod terminal;
mod web;

#[cfg(test)]
pub(crate) mod testing;

pub use adapter::{deliver, ChannelCore, ChannelError, ConnectionState, Delivery};
pub use inbound::InboundMessage;
pub use messenger::{MessengerChannel, VerifyQuery, WebhookPayload, MESSENGER_NAMESPACE};
pub use registry::{ChannelAdapter, ChannelRegistry};
pub use slack::{SlackChannel, SlackChannelInfo, SlackWorkspace, SLACK_NAMESPACE};
pub use terminal::{TerminalChannel, TERMINAL_NAMESPACE};
pub use web::{WebChannel, WEB_NAMESPACE};
