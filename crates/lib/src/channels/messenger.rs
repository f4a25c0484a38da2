//! Facebook Messenger channel: webhook for inbound messages, Send API for replies.
//!
//! `GET /fb` answers the verify-token handshake; `POST /fb` carries
//! `entry[].messaging[]` events. Conversations are keyed by sender id.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use crate::channels::adapter::{deliver, ChannelCore, ChannelError, ConnectionState};
use crate::channels::inbound::InboundMessage;
use crate::channels::registry::ChannelAdapter;
use crate::conversation::ConversationKey;
use crate::spool::WaitPolicy;

const GRAPH_API_BASE: &str = "https://graph.facebook.com/v2.6";

pub const MESSENGER_NAMESPACE: &str = "facebook";

/// Query of the subscription handshake (`hub.mode=subscribe&hub.verify_token=..&hub.challenge=..`).
#[derive(Debug, Deserialize)]
pub struct VerifyQuery {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

/// Webhook POST body.
#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub object: Option<String>,
    #[serde(default)]
    pub entry: Vec<WebhookEntry>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookEntry {
    #[serde(default)]
    pub messaging: Vec<MessagingEvent>,
}

#[derive(Debug, Deserialize)]
pub struct MessagingEvent {
    #[serde(default)]
    pub sender: Option<Participant>,
    #[serde(default)]
    pub message: Option<MessengerMessage>,
}

#[derive(Debug, Deserialize)]
pub struct Participant {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct MessengerMessage {
    #[serde(default)]
    pub mid: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub is_echo: bool,
}

impl WebhookPayload {
    /// Text messages from users, in delivery order. Echoes of our own sends and
    /// non-text events (attachments, postbacks) are skipped.
    pub fn inbound_messages(self) -> Vec<InboundMessage> {
        self.entry
            .into_iter()
            .flat_map(|e| e.messaging)
            .filter_map(|ev| {
                let sender = ev.sender?;
                let message = ev.message?;
                if message.is_echo {
                    return None;
                }
                let text = message.text?;
                Some(InboundMessage::new(
                    ConversationKey::new(MESSENGER_NAMESPACE, sender.id.clone()),
                    sender.id,
                    text,
                ))
            })
            .collect()
    }
}

/// Messenger connector. Ready once activated; the webhook itself is mounted by the server.
pub struct MessengerChannel {
    core: ChannelCore,
    page_token: String,
    verify_token: String,
    api_base: String,
    client: reqwest::Client,
}

impl MessengerChannel {
    pub fn new(page_token: String, verify_token: String, policy: WaitPolicy) -> Self {
        Self {
            core: ChannelCore::new(MESSENGER_NAMESPACE, policy),
            page_token,
            verify_token,
            api_base: GRAPH_API_BASE.to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    /// Mark the channel ready to receive webhook events and send replies.
    pub fn activate(&self) {
        self.core.set_state(ConnectionState::Ready);
    }

    /// Routes for the webhook (`/fb`).
    pub fn routes(self: Arc<Self>) -> Router {
        Router::new()
            .route("/fb", get(verify_webhook).post(receive_webhook))
            .with_state(self)
    }

    /// Returns the challenge to echo when the handshake carries our verify token.
    pub fn verify_subscription(&self, query: &VerifyQuery) -> Option<String> {
        if query.mode.as_deref() != Some("subscribe") {
            return None;
        }
        if query.verify_token.as_deref() != Some(self.verify_token.as_str()) {
            return None;
        }
        query.challenge.clone()
    }

    /// Deliver every message in the payload. Returns how many were routed.
    pub fn handle_payload(self: &Arc<Self>, payload: WebhookPayload) -> Result<usize, ChannelError> {
        self.core.ensure_ready()?;
        let this: Arc<dyn ChannelAdapter> = self.clone();
        let mut routed = 0;
        for inbound in payload.inbound_messages() {
            match deliver(&this, inbound) {
                Ok(_) => routed += 1,
                Err(e) => log::debug!("messenger: inbound message not delivered: {}", e),
            }
        }
        Ok(routed)
    }
}

/// GET /fb: subscription handshake.
async fn verify_webhook(
    State(channel): State<Arc<MessengerChannel>>,
    Query(query): Query<VerifyQuery>,
) -> Result<String, StatusCode> {
    match channel.verify_subscription(&query) {
        Some(challenge) => {
            log::info!("messenger: webhook subscription verified");
            Ok(challenge)
        }
        None => {
            log::warn!("messenger: webhook verification rejected");
            Err(StatusCode::FORBIDDEN)
        }
    }
}

/// POST /fb: inbound events.
async fn receive_webhook(
    State(channel): State<Arc<MessengerChannel>>,
    Json(payload): Json<WebhookPayload>,
) -> StatusCode {
    if payload.object.as_deref().is_some_and(|o| o != "page") {
        return StatusCode::NOT_FOUND;
    }
    match channel.handle_payload(payload) {
        Ok(_) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

#[async_trait]
impl ChannelAdapter for MessengerChannel {
    fn id(&self) -> &str {
        MESSENGER_NAMESPACE
    }

    fn core(&self) -> &ChannelCore {
        &self.core
    }

    async fn send(&self, key: &ConversationKey, text: &str) -> Result<(), ChannelError> {
        self.core.ensure_ready()?;
        let url = format!("{}/me/messages", self.api_base);
        let body = serde_json::json!({
            "recipient": { "id": key.channel },
            "message": { "text": text },
        });
        let res = self
            .client
            .post(&url)
            .query(&[("access_token", self.page_token.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(ChannelError::Transport(format!(
                "send message failed: {} {}",
                status, body
            )));
        }
        Ok(())
    }

    fn stop(&self) {
        self.core.set_state(ConnectionState::Disconnected);
    }
}
