//! HTTP server (single port): health, Messenger webhook and the web chat, plus
//! the connector tasks for socket-based channels.

use crate::bot::{Bot, SettingsForms, WitClient};
use crate::channels::{
    ChannelAdapter, ChannelRegistry, MessengerChannel, SlackChannel, TerminalChannel, WebChannel,
};
use crate::config::{self, Config};
use crate::conversation::ConversationHandler;
use crate::settings::SettingsStore;
use anyhow::{Context, Result};
use axum::{extract::State, routing::get, Json, Router};
use serde_json::json;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// Shared state for the HTTP routes.
#[derive(Clone)]
pub struct ServerState {
    pub port: u16,
    pub channel_registry: Arc<ChannelRegistry>,
    /// Connector tasks (Slack RTM, ...); awaited during graceful shutdown.
    pub channel_tasks: Arc<RwLock<Vec<JoinHandle<()>>>>,
}

impl ServerState {
    /// Register a connector task to be awaited during graceful shutdown.
    pub async fn register_channel_task(&self, handle: JoinHandle<()>) {
        self.channel_tasks.write().await.push(handle);
    }
}

/// Load the user store and build the bot that handles every new conversation.
/// With `forms`, calendar settings are gathered through a web form instead of in chat.
pub async fn build_bot(
    config: &Config,
    config_path: &Path,
    forms: Option<Arc<SettingsForms>>,
) -> Arc<Bot> {
    let store_path = config::resolve_store_path(config, config_path);
    let settings = Arc::new(SettingsStore::load(&store_path).await);
    log::info!(
        "user store at {} ({} user(s))",
        store_path.display(),
        settings.len().await
    );
    let wit_token = config::resolve_wit_token(config);
    if wit_token.is_none() {
        log::warn!("no wit access token configured; every message gets the default reply");
    }
    let classifier = Arc::new(WitClient::new(wit_token, config.wit.base_url.clone()));
    let bot = Bot::new(classifier, settings, config.conversation.reply_timeout());
    Arc::new(match forms {
        Some(forms) => bot.with_settings_form(forms),
        None => bot,
    })
}

/// Run the server; binds to config.server.bind:config.server.port.
/// Blocks until shutdown (Ctrl+C or SIGTERM).
/// `config_path` is the path to the config file (used to resolve the user store).
pub async fn run_server(config: Config, config_path: PathBuf) -> Result<()> {
    serve(config, config_path, shutdown_signal()).await
}

/// Like [`run_server`], but stops when `shutdown` completes.
pub async fn serve<F>(config: Config, config_path: PathBuf, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let public_url = config::resolve_public_url(&config);
    let forms = Arc::new(SettingsForms::new(public_url.clone()));
    let bot = build_bot(&config, &config_path, Some(forms.clone())).await;
    let handler: Arc<dyn ConversationHandler> = bot;
    let policy = config.conversation.wait_policy;

    let state = ServerState {
        port: config.server.port,
        channel_registry: Arc::new(ChannelRegistry::new()),
        channel_tasks: Arc::new(RwLock::new(Vec::new())),
    };
    let registry = state.channel_registry.clone();

    let mut app = Router::new()
        .route("/", get(health_http))
        .with_state(state.clone())
        .merge(forms.routes());
    log::info!("settings forms served under {}/settings/", public_url);

    if let Some(token) = config::resolve_slack_token(&config) {
        let slack = Arc::new(SlackChannel::new(
            token,
            config::resolve_status_channel(&config),
            policy,
        ));
        registry
            .register_with_handler(slack.clone(), handler.clone())
            .await?;
        state.register_channel_task(slack.start()).await;
        log::info!("slack channel registered and rtm loop started");
    }

    let messenger = match config::resolve_messenger_tokens(&config) {
        Some((page_token, verify_token)) => {
            let messenger = Arc::new(MessengerChannel::new(page_token, verify_token, policy));
            registry
                .register_with_handler(messenger.clone(), handler.clone())
                .await?;
            app = app.merge(messenger.clone().routes());
            log::info!("messenger channel registered; webhook url {}/fb", public_url);
            Some(messenger)
        }
        None => None,
    };

    let web = if config.channels.web.enabled {
        let web = Arc::new(WebChannel::new(policy));
        registry
            .register_with_handler(web.clone(), handler.clone())
            .await?;
        app = app.merge(web.clone().routes());
        log::info!("web channel registered; chat page at {}/chat", public_url);
        Some(web)
    } else {
        None
    };

    // Stdin reads never finish on their own, so this task is aborted rather than awaited.
    let terminal_task = if config.channels.terminal.enabled {
        let terminal = Arc::new(TerminalChannel::new(policy));
        registry
            .register_with_handler(terminal.clone(), handler.clone())
            .await?;
        Some(terminal.run_stdin())
    } else {
        None
    };

    let bind = config.server.bind.trim();
    let bind_addr = format!("{}:{}", bind, config.server.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("server listening on {}", bind_addr);

    if let Some(messenger) = &messenger {
        messenger.activate();
    }
    if let Some(web) = &web {
        web.activate();
    }

    let channel_tasks = state.channel_tasks.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            drain_channels(registry, channel_tasks, terminal_task).await;
        })
        .await
        .context("server exited")?;
    log::info!("server stopped");
    Ok(())
}

/// Chat on stdin/stdout only; no HTTP server. Returns when input ends or on Ctrl+C.
pub async fn run_terminal(config: Config, config_path: PathBuf) -> Result<()> {
    let bot = build_bot(&config, &config_path, None).await;
    let terminal = Arc::new(TerminalChannel::new(config.conversation.wait_policy));
    terminal.core().set_handler(bot)?;
    let mut task = terminal.clone().run_stdin();
    tokio::select! {
        _ = &mut task => {}
        _ = shutdown_signal() => {
            terminal.stop();
            task.abort();
        }
    }
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, stopping channels");
}

/// Stops every channel (pending waiters are dropped, chat streams end), then awaits connector tasks.
async fn drain_channels(
    channel_registry: Arc<ChannelRegistry>,
    channel_tasks: Arc<RwLock<Vec<JoinHandle<()>>>>,
    terminal_task: Option<JoinHandle<()>>,
) {
    channel_registry.stop_all().await;
    if let Some(t) = terminal_task {
        t.abort();
    }
    let handles = {
        let mut g = channel_tasks.write().await;
        std::mem::take(&mut *g)
    };
    for h in handles {
        let _ = h.await;
    }
    log::info!("channel tasks finished");
}

/// GET / returns a simple health JSON (for probes).
async fn health_http(State(state): State<ServerState>) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": "running",
        "port": state.port,
        "channels": state.channel_registry.ids().await,
    }))
}
