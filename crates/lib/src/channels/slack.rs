//! Slack channel: RTM session over a websocket, outbound messages as RTM frames.
//!
//! `rtm.start` returns the websocket URL plus a snapshot of the team, the bot
//! user, channels and IMs. The snapshot is owned by the adapter and replaced on
//! every reconnect. Conversations are keyed by Slack channel id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::channels::adapter::{deliver, ChannelCore, ChannelError, ConnectionState, Delivery};
use crate::channels::inbound::InboundMessage;
use crate::channels::registry::ChannelAdapter;
use crate::conversation::ConversationKey;
use crate::spool::WaitPolicy;

const SLACK_API_BASE: &str = "https://slack.com/api";
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

pub const SLACK_NAMESPACE: &str = "slack";

#[derive(Debug, Deserialize)]
struct RtmStartResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default, rename = "self")]
    self_user: Option<SlackUser>,
    #[serde(default)]
    team: Option<SlackTeam>,
    #[serde(default)]
    channels: Vec<SlackChannelInfo>,
    #[serde(default)]
    ims: Vec<SlackIm>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlackUser {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlackTeam {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlackChannelInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub is_member: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlackIm {
    pub id: String,
    pub user: String,
}

/// Team, bot identity, channels and IMs as of the last `rtm.start`.
#[derive(Debug, Clone, Default)]
pub struct SlackWorkspace {
    pub team: Option<SlackTeam>,
    pub self_user: Option<SlackUser>,
    pub channels: HashMap<String, SlackChannelInfo>,
    pub ims: HashMap<String, SlackIm>,
}

impl SlackWorkspace {
    fn from_start(start: &RtmStartResponse) -> Self {
        Self {
            team: start.team.clone(),
            self_user: start.self_user.clone(),
            channels: start
                .channels
                .iter()
                .map(|c| (c.id.clone(), c.clone()))
                .collect(),
            ims: start.ims.iter().map(|im| (im.id.clone(), im.clone())).collect(),
        }
    }

    /// Channel with this name, only if the bot is a member.
    pub fn channel_by_name(&self, name: &str) -> Option<&SlackChannelInfo> {
        self.channels
            .values()
            .find(|c| c.name == name && c.is_member)
    }
}

/// RTM event; only the fields needed for routing.
#[derive(Debug, Deserialize)]
pub struct SlackEvent {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub bot_id: Option<String>,
}

/// Slack RTM connector.
pub struct SlackChannel {
    core: ChannelCore,
    token: String,
    api_base: String,
    status_channel: Option<String>,
    client: reqwest::Client,
    running: AtomicBool,
    shutdown: Notify,
    workspace: RwLock<SlackWorkspace>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    next_frame_id: AtomicU64,
}

impl SlackChannel {
    pub fn new(token: String, status_channel: Option<String>, policy: WaitPolicy) -> Self {
        Self {
            core: ChannelCore::new(SLACK_NAMESPACE, policy),
            token,
            api_base: SLACK_API_BASE.to_string(),
            status_channel,
            client: reqwest::Client::new(),
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
            workspace: RwLock::new(SlackWorkspace::default()),
            outbound: Mutex::new(None),
            next_frame_id: AtomicU64::new(1),
        }
    }

    /// Point the Web API calls elsewhere (tests, proxies).
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn workspace(&self) -> SlackWorkspace {
        self.workspace
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn channel_by_name(&self, name: &str) -> Option<SlackChannelInfo> {
        self.workspace
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .channel_by_name(name)
            .cloned()
    }

    fn self_id(&self) -> Option<String> {
        self.workspace
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .self_user
            .as_ref()
            .map(|u| u.id.clone())
    }

    fn set_outbound(&self, tx: Option<mpsc::UnboundedSender<String>>) {
        *self.outbound.lock().unwrap_or_else(PoisonError::into_inner) = tx;
    }

    /// Start the RTM loop (connect, read, reconnect). Returns a handle to await on shutdown.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        log::info!("slack channel: starting rtm loop");
        tokio::spawn(async move {
            run_rtm_loop(self).await;
        })
    }

    async fn rtm_start(&self) -> Result<RtmStartResponse, ChannelError> {
        let url = format!("{}/rtm.start", self.api_base);
        let res = self
            .client
            .post(&url)
            .form(&[("token", self.token.as_str())])
            .send()
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(ChannelError::Transport(format!(
                "rtm.start failed: {} {}",
                status, body
            )));
        }
        let data: RtmStartResponse = res
            .json()
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;
        if !data.ok {
            return Err(ChannelError::Transport(format!(
                "rtm.start returned ok: false ({})",
                data.error.as_deref().unwrap_or("no error given")
            )));
        }
        Ok(data)
    }

    /// One RTM session: returns when the socket closes or the channel is stopped.
    async fn run_session(self: &Arc<Self>) -> Result<(), ChannelError> {
        let start = self.rtm_start().await?;
        let url = start
            .url
            .clone()
            .ok_or_else(|| ChannelError::Transport("rtm.start returned no url".to_string()))?;
        *self.workspace.write().unwrap_or_else(PoisonError::into_inner) =
            SlackWorkspace::from_start(&start);

        let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        self.set_outbound(Some(tx));
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = sink.send(Message::Text(frame)).await {
                    log::debug!("slack: websocket write failed: {}", e);
                    break;
                }
            }
        });

        self.core.set_state(ConnectionState::Ready);
        self.announce().await;

        let result = loop {
            tokio::select! {
                _ = self.shutdown.notified() => break Ok(()),
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        self.handle_frame(&text);
                    }
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(ChannelError::Transport(e.to_string())),
                },
            }
        };
        self.set_outbound(None);
        writer.abort();
        result
    }

    /// Say hello in the status channel, if configured and joined.
    async fn announce(&self) {
        let ws = self.workspace();
        if let (Some(me), Some(team)) = (&ws.self_user, &ws.team) {
            log::info!("slack: connected as {} on {}", me.name, team.name);
        }
        let Some(ref name) = self.status_channel else {
            return;
        };
        let Some(status) = ws.channel_by_name(name) else {
            log::debug!("slack: status channel #{} not joined", name);
            return;
        };
        let key = ConversationKey::new(SLACK_NAMESPACE, status.id.clone());
        let hello = format!(":wave: @ {}", env!("CARGO_PKG_VERSION"));
        if let Err(e) = self.send(&key, &hello).await {
            log::debug!("slack: status announcement failed: {}", e);
        }
    }

    /// Reduce an RTM frame to an inbound message. Ignores non-messages,
    /// edits and other subtypes, bot posts and the bot's own messages.
    pub fn parse_event(&self, raw: &str) -> Option<InboundMessage> {
        let event: SlackEvent = match serde_json::from_str(raw) {
            Ok(e) => e,
            Err(e) => {
                log::debug!("slack: unparseable frame: {}", e);
                return None;
            }
        };
        if event.kind.as_deref() != Some("message") || event.subtype.is_some() || event.bot_id.is_some() {
            return None;
        }
        let user = event.user?;
        if self.self_id().as_deref() == Some(user.as_str()) {
            return None;
        }
        let channel = event.channel?;
        let text = event.text?;
        Some(InboundMessage::new(
            ConversationKey::new(SLACK_NAMESPACE, channel),
            user,
            text,
        ))
    }

    /// Route one RTM frame. `None` for frames that are not user messages or could not be delivered.
    fn handle_frame(self: &Arc<Self>, raw: &str) -> Option<Delivery> {
        let inbound = self.parse_event(raw)?;
        let this: Arc<dyn ChannelAdapter> = self.clone();
        match deliver(&this, inbound) {
            Ok(delivery) => Some(delivery),
            Err(e) => {
                log::debug!("slack: inbound message not delivered: {}", e);
                None
            }
        }
    }

    fn message_frame(&self, channel: &str, text: &str) -> String {
        let id = self.next_frame_id.fetch_add(1, Ordering::SeqCst);
        serde_json::json!({
            "id": id,
            "type": "message",
            "channel": channel,
            "text": text,
        })
        .to_string()
    }
}

async fn run_rtm_loop(channel: Arc<SlackChannel>) {
    while channel.running() {
        channel.core.set_state(ConnectionState::Connecting);
        match channel.run_session().await {
            Ok(()) => log::info!("slack: rtm session closed"),
            Err(e) => log::warn!("slack: rtm session failed: {}", e),
        }
        channel.set_outbound(None);
        channel.core.set_state(ConnectionState::Disconnected);
        if !channel.running() {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            _ = channel.shutdown.notified() => break,
        }
    }
    log::info!("slack channel: rtm loop stopped");
}

#[async_trait]
impl ChannelAdapter for SlackChannel {
    fn id(&self) -> &str {
        SLACK_NAMESPACE
    }

    fn core(&self) -> &ChannelCore {
        &self.core
    }

    async fn send(&self, key: &ConversationKey, text: &str) -> Result<(), ChannelError> {
        self.core.ensure_ready()?;
        let frame = self.message_frame(&key.channel, text);
        let g = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = g
            .as_ref()
            .ok_or_else(|| ChannelError::NotReady(SLACK_NAMESPACE.to_string()))?;
        tx.send(frame)
            .map_err(|_| ChannelError::Transport("slack writer closed".to_string()))
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_one();
        self.core.set_state(ConnectionState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::testing::RecordingHandler;

    fn channel_with_workspace() -> SlackChannel {
        let channel = SlackChannel::new("xoxb-test".to_string(), None, WaitPolicy::Queue);
        let start: RtmStartResponse = serde_json::from_str(
            r#"{
                "ok": true,
                "url": "wss://example.invalid/rtm",
                "self": { "id": "UBOT", "name": "opal" },
                "team": { "id": "T1", "name": "Lab" },
                "channels": [
                    { "id": "C1", "name": "bot-status", "is_member": true },
                    { "id": "C2", "name": "random", "is_member": false }
                ],
                "ims": [ { "id": "D1", "user": "U1" } ]
            }"#,
        )
        .unwrap();
        *channel.workspace.write().unwrap() = SlackWorkspace::from_start(&start);
        channel
    }

    #[test]
    fn parses_user_message() {
        let channel = channel_with_workspace();
        let msg = channel
            .parse_event(r#"{"type":"message","channel":"D1","user":"U1","text":"hi opal"}"#)
            .unwrap();
        assert_eq!(msg.key, ConversationKey::new("slack", "D1"));
        assert_eq!(msg.user, "U1");
        assert_eq!(msg.text, "hi opal");
    }

    #[test]
    fn ignores_own_bot_and_subtyped_messages() {
        let channel = channel_with_workspace();
        for raw in [
            r#"{"type":"message","channel":"D1","user":"UBOT","text":"echo"}"#,
            r#"{"type":"message","channel":"D1","bot_id":"B1","text":"other bot"}"#,
            r#"{"type":"message","subtype":"message_changed","channel":"D1","user":"U1"}"#,
            r#"{"type":"presence_change","user":"U1"}"#,
            r#"not json"#,
        ] {
            assert!(channel.parse_event(raw).is_none(), "should ignore {}", raw);
        }
    }

    #[test]
    fn channel_lookup_requires_membership() {
        let channel = channel_with_workspace();
        assert_eq!(channel.channel_by_name("bot-status").unwrap().id, "C1");
        assert!(channel.channel_by_name("random").is_none());
        assert_eq!(channel.workspace().ims["D1"].user, "U1");
    }

    #[tokio::test]
    async fn send_requires_ready_then_writes_rtm_frames() {
        let channel = channel_with_workspace();
        let key = ConversationKey::new("slack", "C1");
        assert!(matches!(
            channel.send(&key, "early").await,
            Err(ChannelError::NotReady(_))
        ));

        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.set_outbound(Some(tx));
        channel.core.set_state(ConnectionState::Ready);
        channel.send(&key, "first").await.unwrap();
        channel.send(&key, "second").await.unwrap();

        let first: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        let second: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(first["type"], "message");
        assert_eq!(first["channel"], "C1");
        assert_eq!(first["text"], "first");
        assert!(second["id"].as_u64().unwrap() > first["id"].as_u64().unwrap());
    }

    #[tokio::test]
    async fn frames_start_then_resume_the_im_conversation() {
        let channel = Arc::new(channel_with_workspace());
        let (handler, mut started) = RecordingHandler::new();
        channel.core.set_handler(handler).unwrap();
        let frame = |text: &str| {
            serde_json::json!({"type": "message", "channel": "D1", "user": "U1", "text": text})
                .to_string()
        };

        assert_eq!(channel.handle_frame(&frame("early")), None);

        channel.core.set_state(ConnectionState::Ready);
        assert_eq!(channel.handle_frame(&frame("hi opal")), Some(Delivery::Started));
        let (text, conv) = started.recv().await.unwrap();
        assert_eq!(text, "hi opal");
        assert_eq!(conv.identity(), ("slack", "U1"));

        let key = conv.key().clone();
        let pending = tokio::spawn(async move { conv.recv().await });
        for _ in 0..200 {
            if channel.core.spool().is_waiting(&key) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(channel.handle_frame(&frame("tomorrow")), Some(Delivery::Resumed));
        assert_eq!(pending.await.unwrap().unwrap(), "tomorrow");

        let own = r#"{"type":"message","channel":"D1","user":"UBOT","text":"echo"}"#;
        assert_eq!(channel.handle_frame(own), None);
        assert!(started.try_recv().is_err());
    }

    #[tokio::test]
    async fn stop_ends_loop_during_reconnect_backoff() {
        // Nothing listens on the discard port, so every session fails at rtm.start.
        let channel = Arc::new(
            SlackChannel::new("xoxb-test".to_string(), None, WaitPolicy::Queue)
                .with_api_base("http://127.0.0.1:9"),
        );
        let handle = channel.clone().start();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!handle.is_finished());
        channel.stop();
        tokio::time::timeout(RECONNECT_DELAY / 2, handle)
            .await
            .expect("rtm loop still sleeping after stop")
            .unwrap();
        assert_eq!(channel.core.state(), ConnectionState::Disconnected);
    }
}
