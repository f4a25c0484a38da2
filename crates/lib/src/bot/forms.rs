//! One-shot settings forms: the bot sends the user a link carrying a fresh
//! token and waits for the form posted to it. Pending forms live in a spool
//! keyed by token, so a token is valid exactly while someone waits on it.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Html,
    routing::get,
    Form, Router,
};

use crate::settings::CalDavSettings;
use crate::spool::{Spool, SpoolError, WaitPolicy, Waiter};

const SETTINGS_FORM: &str = include_str!("../../assets/settings.html");

pub struct SettingsForms {
    base_url: String,
    pending: Spool<String, CalDavSettings>,
}

impl SettingsForms {
    /// `base_url` is how users reach this server (e.g. `https://opal.example`).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            pending: Spool::new(WaitPolicy::Exclusive),
        }
    }

    /// Open a form under a new token. The token is live until the waiter resolves or is dropped.
    pub fn open(&self) -> Result<(String, Waiter<String, CalDavSettings>), SpoolError> {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let waiter = self.pending.wait(token.clone())?;
        Ok((token, waiter))
    }

    pub fn url(&self, token: &str) -> String {
        format!("{}/settings/{}", self.base_url, token)
    }

    pub fn is_open(&self, token: &str) -> bool {
        self.pending.is_waiting(&token.to_string())
    }

    /// Hand the posted settings to whoever holds the token. False for unknown or used tokens.
    pub fn submit(&self, token: &str, settings: CalDavSettings) -> bool {
        self.pending
            .dispatch(&token.to_string(), settings)
            .is_consumed()
    }

    pub fn routes(self: Arc<Self>) -> Router {
        Router::new()
            .route("/settings/:token", get(show_form).post(submit_form))
            .with_state(self)
    }
}

/// GET /settings/:token
async fn show_form(
    State(forms): State<Arc<SettingsForms>>,
    Path(token): Path<String>,
) -> Result<Html<&'static str>, (StatusCode, &'static str)> {
    if forms.is_open(&token) {
        Ok(Html(SETTINGS_FORM))
    } else {
        Err((StatusCode::NOT_FOUND, "invalid token"))
    }
}

/// POST /settings/:token: urlencoded `url`, `username`, `password`.
async fn submit_form(
    State(forms): State<Arc<SettingsForms>>,
    Path(token): Path<String>,
    Form(form): Form<CalDavSettings>,
) -> (StatusCode, &'static str) {
    let settings = CalDavSettings {
        url: form.url.trim().to_string(),
        username: form.username.trim().to_string(),
        password: form.password,
    };
    if settings.url.is_empty() || settings.username.is_empty() {
        return (StatusCode::BAD_REQUEST, "url and username are required");
    }
    if forms.submit(&token, settings) {
        log::info!("settings form submitted");
        (StatusCode::OK, "got it; thanks!")
    } else {
        (StatusCode::NOT_FOUND, "invalid token")
    }
}
