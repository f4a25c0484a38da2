//! The assistant: classifies the first message of a conversation and runs the
//! matching dialogue, asking follow-up questions through the same conversation.

mod calendar;
mod forms;
mod intent;

pub use calendar::{summarize, upcoming_window, CalendarEvent, CalendarSource, UPCOMING_DAYS};
pub use forms::SettingsForms;
pub use intent::{Classification, Entity, Intent, IntentClassifier, IntentError, WitClient};

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use crate::channels::ChannelError;
use crate::conversation::{Conversation, ConversationHandler};
use crate::settings::{CalDavSettings, SettingsStore, UserRecord};

const DEFAULT_REPLY: &str = ":confused: :grey_question:";
const NEVER_MIND: &str = "never mind, I'll be right here";

pub struct Bot {
    classifier: Arc<dyn IntentClassifier>,
    settings: Arc<SettingsStore>,
    calendar: Option<Arc<dyn CalendarSource>>,
    forms: Option<Arc<SettingsForms>>,
    reply_timeout: Duration,
}

impl Bot {
    pub fn new(
        classifier: Arc<dyn IntentClassifier>,
        settings: Arc<SettingsStore>,
        reply_timeout: Duration,
    ) -> Self {
        Self {
            classifier,
            settings,
            calendar: None,
            forms: None,
            reply_timeout,
        }
    }

    pub fn with_calendar(mut self, calendar: Arc<dyn CalendarSource>) -> Self {
        self.calendar = Some(calendar);
        self
    }

    /// Gather settings through a web form link instead of asking in chat.
    pub fn with_settings_form(mut self, forms: Arc<SettingsForms>) -> Self {
        self.forms = Some(forms);
        self
    }

    /// Classify `text` and act on it. Classifier failures fall back to the default reply.
    pub async fn interact(&self, text: &str, conv: &Conversation) -> anyhow::Result<()> {
        let intent = match self.classifier.classify(text).await {
            Ok(c) => Intent::from_classification(&c),
            Err(e) => {
                log::warn!("bot: classifying {:?} from {} failed: {}", text, conv.key(), e);
                Intent::Unknown
            }
        };
        log::debug!("bot: {} -> {:?}", conv.key(), intent);

        match intent {
            Intent::Greeting => conv.send("hi!").await?,
            Intent::Bye => conv.send(":wave: I'll be right here").await?,
            Intent::Thanks => conv.send("nbd yo").await?,
            Intent::Help => {
                conv.send("I can schedule a meeting or show your calendar")
                    .await?
            }
            Intent::ScheduleMeeting => {
                conv.send("let's get to schedulin'! [actually this is not quite implemented yet]")
                    .await?
            }
            Intent::ShowCalendar => self.show_calendar(conv).await?,
            Intent::SetupCalendar => self.setup_calendar(conv).await?,
            Intent::Unknown => conv.send(DEFAULT_REPLY).await?,
        }
        Ok(())
    }

    async fn show_calendar(&self, conv: &Conversation) -> anyhow::Result<()> {
        conv.send("let's get your calendar!").await?;
        let (namespace, user) = conv.identity();
        let record = self.settings.get_or_create(namespace, user).await?;
        let account = match record.caldav.clone() {
            Some(account) => account,
            None => match self.gather_settings(conv, record).await? {
                Some(account) => account,
                None => return Ok(()),
            },
        };

        let Some(source) = &self.calendar else {
            conv.send(&format!(
                "no calendar backend configured, so I can't read {} yet",
                account.url
            ))
            .await?;
            return Ok(());
        };
        let (start, end) = upcoming_window(chrono::Utc::now());
        match source.events(&account, start, end).await {
            Ok(events) => conv.send(&summarize(&events)).await?,
            Err(e) => {
                log::warn!("bot: calendar fetch for {} failed: {:#}", conv.key(), e);
                conv.send("I couldn't reach your calendar :(").await?;
            }
        }
        Ok(())
    }

    async fn setup_calendar(&self, conv: &Conversation) -> anyhow::Result<()> {
        let (namespace, user) = conv.identity();
        let record = self.settings.get_or_create(namespace, user).await?;
        if self.gather_settings(conv, record).await?.is_some() {
            conv.send("ok, all set!").await?;
        }
        Ok(())
    }

    /// Get CalDAV details from the user and persist them. `None` when the user cancels.
    async fn gather_settings(
        &self,
        conv: &Conversation,
        mut record: UserRecord,
    ) -> anyhow::Result<Option<CalDavSettings>> {
        let account = match &self.forms {
            Some(forms) => self.gather_by_form(conv, forms).await?,
            None => match self.gather_by_chat(conv).await? {
                Some(account) => account,
                None => return self.cancelled(conv).await,
            },
        };
        record.caldav = Some(account.clone());
        self.settings.update(record).await?;
        log::info!("bot: stored calendar settings for {}", conv.key());
        Ok(Some(account))
    }

    async fn gather_by_form(
        &self,
        conv: &Conversation,
        forms: &SettingsForms,
    ) -> anyhow::Result<CalDavSettings> {
        let (token, waiter) = forms.open()?;
        conv.send(&format!("please fill out the form at {}", forms.url(&token)))
            .await?;
        match tokio::time::timeout(self.reply_timeout, waiter).await {
            Ok(settings) => Ok(settings?),
            Err(_) => Err(ChannelError::Timeout(self.reply_timeout).into()),
        }
    }

    async fn gather_by_chat(&self, conv: &Conversation) -> anyhow::Result<Option<CalDavSettings>> {
        let mut question = "what's your CalDAV url?";
        let url = loop {
            let Some(answer) = self.ask(conv, question).await? else {
                return Ok(None);
            };
            match find_url(&answer) {
                Some(url) => break url,
                None => question = "that doesn't look like a url, try again (or say cancel)",
            }
        };
        let Some(username) = self.ask(conv, "and your username?").await? else {
            return Ok(None);
        };
        let Some(password) = self.ask(conv, "and your password?").await? else {
            return Ok(None);
        };
        Ok(Some(CalDavSettings {
            url,
            username,
            password,
        }))
    }

    async fn cancelled(&self, conv: &Conversation) -> anyhow::Result<Option<CalDavSettings>> {
        conv.send("ok, never mind").await?;
        Ok(None)
    }

    /// Send `question` and wait for the answer. `None` if the answer is "cancel".
    async fn ask(&self, conv: &Conversation, question: &str) -> anyhow::Result<Option<String>> {
        conv.send(question).await?;
        let answer = conv.recv_timeout(self.reply_timeout).await?;
        let answer = answer.trim();
        if answer.eq_ignore_ascii_case("cancel") {
            return Ok(None);
        }
        Ok(Some(answer.to_string()))
    }
}

#[async_trait]
impl ConversationHandler for Bot {
    async fn converse(&self, text: String, conv: Conversation) -> anyhow::Result<()> {
        match self.interact(&text, &conv).await {
            Err(e) if matches!(e.downcast_ref::<ChannelError>(), Some(ChannelError::Timeout(_))) => {
                log::debug!("bot: {} stopped answering", conv.key());
                conv.send(NEVER_MIND).await?;
                Ok(())
            }
            other => other,
        }
    }
}

static URL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bhttps?://[^\s<>|]+").expect("valid url pattern"));

/// First http(s) url in `text`, unwrapping Slack's `<url|label>` links.
pub fn find_url(text: &str) -> Option<String> {
    URL_PATTERN
        .find_iter(text)
        .map(|m| m.as_str().trim_end_matches([')', '>', '.', ',']))
        .find(|url| !url.ends_with("://"))
        .map(str::to_string)
}
