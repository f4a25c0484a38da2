//! Browser chat channel: `/chat` serves the page, which POSTs lines to
//! `/chat/messages` and listens for replies on the same path as a
//! Server-Sent-Events stream.

use std::convert::Infallible;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        Html, IntoResponse,
    },
    routing::get,
    Router,
};
use futures_util::stream::{self, Stream};
use tokio::sync::{broadcast, watch};

use crate::channels::adapter::{deliver, ChannelCore, ChannelError, ConnectionState};
use crate::channels::inbound::InboundMessage;
use crate::channels::registry::ChannelAdapter;
use crate::conversation::ConversationKey;
use crate::spool::WaitPolicy;

pub const WEB_NAMESPACE: &str = "web";
const WEB_CONVERSATION: &str = "local";
const WEB_USER: &str = "user";
const EVENT_BUFFER: usize = 64;

const CHAT_PAGE: &str = include_str!("../../assets/chat.html");
const CHAT_JS: &str = include_str!("../../assets/chat.js");

pub struct WebChannel {
    core: ChannelCore,
    events: broadcast::Sender<String>,
    stopped: watch::Sender<bool>,
}

impl WebChannel {
    pub fn new(policy: WaitPolicy) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (stopped, _) = watch::channel(false);
        Self {
            core: ChannelCore::new(WEB_NAMESPACE, policy),
            events,
            stopped,
        }
    }

    pub fn key() -> ConversationKey {
        ConversationKey::new(WEB_NAMESPACE, WEB_CONVERSATION)
    }

    /// Mark the channel ready; call once its routes are being served.
    pub fn activate(&self) {
        self.stopped.send_replace(false);
        self.core.set_state(ConnectionState::Ready);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.events.subscribe()
    }

    pub fn routes(self: Arc<Self>) -> Router {
        Router::new()
            .route("/chat", get(chat_page))
            .route("/chat.js", get(chat_js))
            .route("/chat/messages", get(stream_messages).post(post_message))
            .with_state(self)
    }

    /// Deliver one line typed in the browser.
    pub fn receive(self: &Arc<Self>, text: &str) -> Result<(), ChannelError> {
        let this: Arc<dyn ChannelAdapter> = self.clone();
        deliver(
            &this,
            InboundMessage::new(WebChannel::key(), WEB_USER, text.trim()),
        )
        .map(|_| ())
    }
}

async fn chat_page() -> Html<&'static str> {
    Html(CHAT_PAGE)
}

async fn chat_js() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "application/javascript")], CHAT_JS)
}

/// GET /chat/messages: replies as `message` events. The stream ends when the channel stops.
async fn stream_messages(
    State(channel): State<Arc<WebChannel>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    log::debug!("web: chat listener connected");
    let rx = channel.subscribe();
    let stop = channel.stopped.subscribe();
    let events = stream::unfold((rx, stop), |(mut rx, mut stop)| async move {
        loop {
            let received = tokio::select! {
                r = rx.recv() => r,
                _ = stop.wait_for(|stopped| *stopped) => return None,
            };
            match received {
                Ok(text) => {
                    let event = Event::default().event("message").data(text);
                    return Some((Ok::<Event, Infallible>(event), (rx, stop)));
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::debug!("web: chat listener lagged {} message(s)", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

/// POST /chat/messages: body is the raw message text.
async fn post_message(State(channel): State<Arc<WebChannel>>, body: String) -> StatusCode {
    if body.trim().is_empty() {
        return StatusCode::BAD_REQUEST;
    }
    match channel.receive(&body) {
        Ok(()) => StatusCode::ACCEPTED,
        Err(ChannelError::NotReady(_)) => StatusCode::SERVICE_UNAVAILABLE,
        Err(e) => {
            log::warn!("web: inbound message failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[async_trait]
impl ChannelAdapter for WebChannel {
    fn id(&self) -> &str {
        WEB_NAMESPACE
    }

    fn core(&self) -> &ChannelCore {
        &self.core
    }

    /// Best effort: with no browser listening the reply is dropped.
    async fn send(&self, _key: &ConversationKey, text: &str) -> Result<(), ChannelError> {
        self.core.ensure_ready()?;
        if self.events.send(text.to_string()).is_err() {
            log::debug!("web: no chat listener, reply dropped");
        }
        Ok(())
    }

    fn stop(&self) {
        self.stopped.send_replace(true);
        self.core.set_state(ConnectionState::Disconnected);
    }
}
