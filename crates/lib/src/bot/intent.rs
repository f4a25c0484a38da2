//! Intent classification: the Wit.ai message API and the intents the bot acts on.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;

const WIT_API_BASE: &str = "https://api.wit.ai";

#[derive(Debug, thiserror::Error)]
pub enum IntentError {
    #[error("intent classifier not configured (set WIT_ACCESS_TOKEN)")]
    NotConfigured,
    #[error("wit request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("wit api error: {0}")]
    Api(String),
}

/// One recognised entity.
#[derive(Debug, Clone, Deserialize)]
pub struct Entity {
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub value: serde_json::Value,
}

/// Classifier output: entities by name, best candidate first.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Classification {
    #[serde(default, rename = "_text")]
    pub text: Option<String>,
    #[serde(default)]
    pub entities: HashMap<String, Vec<Entity>>,
}

impl Classification {
    /// Best entity with this name, if any.
    pub fn entity(&self, name: &str) -> Option<&Entity> {
        self.entities.get(name).and_then(|v| v.first())
    }

    /// String value of the best entity with this name.
    pub fn entity_value(&self, name: &str) -> Option<&str> {
        self.entity(name).and_then(|e| e.value.as_str())
    }
}

/// What the user wants from this conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Greeting,
    Bye,
    Thanks,
    ShowCalendar,
    ScheduleMeeting,
    SetupCalendar,
    Help,
    Unknown,
}

impl Intent {
    /// Trait entities (greetings, bye, thanks) win over the `intent` entity.
    pub fn from_classification(c: &Classification) -> Self {
        if c.entity("greetings").is_some() {
            return Intent::Greeting;
        }
        if c.entity("bye").is_some() {
            return Intent::Bye;
        }
        if c.entity("thanks").is_some() {
            return Intent::Thanks;
        }
        match c.entity_value("intent") {
            Some("show_calendar") => Intent::ShowCalendar,
            Some("schedule_meeting") => Intent::ScheduleMeeting,
            Some("setup_calendar") => Intent::SetupCalendar,
            Some("help") => Intent::Help,
            _ => Intent::Unknown,
        }
    }
}

#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<Classification, IntentError>;
}

/// Client for the Wit.ai HTTP API.
#[derive(Clone)]
pub struct WitClient {
    base_url: String,
    access_token: Option<String>,
    client: reqwest::Client,
}

impl WitClient {
    pub fn new(access_token: Option<String>, base_url: Option<String>) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| WIT_API_BASE.to_string());
        Self {
            base_url,
            access_token,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl IntentClassifier for WitClient {
    /// GET /message?q=: classify one utterance.
    async fn classify(&self, text: &str) -> Result<Classification, IntentError> {
        let token = self.access_token.as_ref().ok_or(IntentError::NotConfigured)?;
        let url = format!("{}/message", self.base_url);
        let res = self
            .client
            .get(&url)
            .bearer_auth(token)
            .query(&[("q", text)])
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(IntentError::Api(format!("{} {}", status, body)));
        }
        Ok(res.json().await?)
    }
}
