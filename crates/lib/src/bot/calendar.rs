//! Calendar access as the bot sees it: a source of upcoming events for a user's account.
//!
//! Protocol clients (CalDAV, Office 365, iCloud) live outside this crate and
//! plug in through [`CalendarSource`].

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::settings::CalDavSettings;

/// How far ahead "show my calendar" looks.
pub const UPCOMING_DAYS: i64 = 7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarEvent {
    pub start: DateTime<Utc>,
    pub summary: String,
}

#[async_trait]
pub trait CalendarSource: Send + Sync {
    /// Events starting in `[start, end)`.
    async fn events(
        &self,
        account: &CalDavSettings,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<Vec<CalendarEvent>>;
}

pub fn upcoming_window(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    (now, now + Duration::days(UPCOMING_DAYS))
}

/// One `start: summary` line per event, earliest first.
pub fn summarize(events: &[CalendarEvent]) -> String {
    if events.is_empty() {
        return "nothing on your calendar this week".to_string();
    }
    let mut sorted: Vec<&CalendarEvent> = events.iter().collect();
    sorted.sort_by_key(|e| e.start);
    sorted
        .iter()
        .map(|e| format!("{}: {}", e.start.format("%a %b %-d %H:%M"), e.summary))
        .collect::<Vec<_>>()
        .join("\n")
}
