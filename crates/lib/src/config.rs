//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.opal/config.json`); secrets can
//! be supplied through the environment instead.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::spool::WaitPolicy;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Which channels to run and their credentials.
    #[serde(default)]
    pub channels: ChannelsConfig,

    /// Intent classifier (Wit.ai).
    #[serde(default)]
    pub wit: WitConfig,

    /// User settings store.
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub conversation: ConversationConfig,
}

/// Bind and port for webhooks, the web chat and health.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Port (default 4000).
    #[serde(default = "default_server_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_server_bind")]
    pub bind: String,

    /// Externally reachable base url, used in settings-form links and the Messenger webhook hint.
    /// Defaults to `http://<bind>:<port>`.
    pub public_url: Option<String>,
}

fn default_server_port() -> u16 {
    4000
}

fn default_server_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_server_port(),
            bind: default_server_bind(),
            public_url: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelsConfig {
    #[serde(default)]
    pub slack: SlackChannelConfig,
    #[serde(default)]
    pub messenger: MessengerChannelConfig,
    #[serde(default)]
    pub web: WebChannelConfig,
    #[serde(default)]
    pub terminal: TerminalChannelConfig,
}

/// Slack RTM channel. Runs when a bot token is configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlackChannelConfig {
    /// Bot token (xoxb-...). Overridden by SLACK_BOT_TOKEN env when set.
    pub bot_token: Option<String>,
    /// Channel name for the startup announcement; empty disables it.
    #[serde(default = "default_status_channel")]
    pub status_channel: String,
}

fn default_status_channel() -> String {
    "bot-status".to_string()
}

impl Default for SlackChannelConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            status_channel: default_status_channel(),
        }
    }
}

/// Facebook Messenger webhook channel. Runs when both tokens are configured.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessengerChannelConfig {
    /// Page access token. Overridden by FB_PAGE_TOKEN env.
    pub page_token: Option<String>,
    /// Webhook verify token. Overridden by FB_VERIFY_TOKEN env.
    pub verify_token: Option<String>,
}

/// Browser chat over SSE.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebChannelConfig {
    #[serde(default)]
    pub enabled: bool,
}

/// Chat on the server's own stdin/stdout alongside the other channels.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalChannelConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WitConfig {
    /// Server access token. Overridden by WIT_ACCESS_TOKEN env.
    pub access_token: Option<String>,
    /// API base url (default https://api.wit.ai).
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    /// Store file. Relative paths are resolved against the config file's parent.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationConfig {
    /// "queue" (default): several waits on one conversation are served in order.
    /// "exclusive": a second concurrent wait fails.
    #[serde(default)]
    pub wait_policy: WaitPolicy,
    /// How long the bot waits for an answer to a question (default 300).
    #[serde(default = "default_reply_timeout_secs")]
    pub reply_timeout_secs: u64,
}

/// How long the bot waits for an answer to one of its questions, by default.
pub const DEFAULT_REPLY_TIMEOUT_SECS: u64 = 300;

fn default_reply_timeout_secs() -> u64 {
    DEFAULT_REPLY_TIMEOUT_SECS
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            wait_policy: WaitPolicy::default(),
            reply_timeout_secs: default_reply_timeout_secs(),
        }
    }
}

impl ConversationConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.reply_timeout_secs)
    }
}

/// Env var if set and non-blank, else the trimmed config value if non-blank.
fn env_or(var: &str, configured: Option<&String>) -> Option<String> {
    std::env::var(var)
        .ok()
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .or_else(|| {
            configured
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

/// Resolve the Slack bot token: env SLACK_BOT_TOKEN overrides config.
pub fn resolve_slack_token(config: &Config) -> Option<String> {
    env_or("SLACK_BOT_TOKEN", config.channels.slack.bot_token.as_ref())
}

/// Resolve the Wit.ai token: env WIT_ACCESS_TOKEN overrides config.
pub fn resolve_wit_token(config: &Config) -> Option<String> {
    env_or("WIT_ACCESS_TOKEN", config.wit.access_token.as_ref())
}

/// Resolve Messenger (page token, verify token); `None` unless both are set.
pub fn resolve_messenger_tokens(config: &Config) -> Option<(String, String)> {
    let page = env_or("FB_PAGE_TOKEN", config.channels.messenger.page_token.as_ref())?;
    let verify = env_or(
        "FB_VERIFY_TOKEN",
        config.channels.messenger.verify_token.as_ref(),
    )?;
    Some((page, verify))
}

/// Status channel for the Slack startup announcement, `None` when disabled.
pub fn resolve_status_channel(config: &Config) -> Option<String> {
    let name = config.channels.slack.status_channel.trim();
    if name.is_empty() {
        None
    } else {
        Some(name.trim_start_matches('#').to_string())
    }
}

/// Base url users reach this server at, without a trailing slash.
pub fn resolve_public_url(config: &Config) -> String {
    config
        .server
        .public_url
        .as_ref()
        .map(|u| u.trim().trim_end_matches('/').to_string())
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| format!("http://{}:{}", config.server.bind.trim(), config.server.port))
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("OPAL_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".opal").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Load config from the given path, or the default path (or OPAL_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used (for resolving the store path).
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

fn config_dir(config_path: &Path) -> &Path {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Resolve the settings store file: `store.path` if set (relative to the config file's parent),
/// otherwise `store.json` beside the config file.
pub fn resolve_store_path(config: &Config, config_path: &Path) -> PathBuf {
    match &config.store.path {
        Some(p) if !p.as_os_str().is_empty() => {
            if p.is_absolute() {
                p.clone()
            } else {
                config_dir(config_path).join(p)
            }
        }
        _ => config_dir(config_path).join("store.json"),
    }
}
