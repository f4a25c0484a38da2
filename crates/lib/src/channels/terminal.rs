//! Terminal channel: one local user typing lines, replies printed as `<<< text`.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::task::JoinHandle;

use crate::channels::adapter::{deliver, ChannelCore, ChannelError, ConnectionState};
use crate::channels::inbound::InboundMessage;
use crate::channels::registry::ChannelAdapter;
use crate::conversation::ConversationKey;
use crate::spool::WaitPolicy;

pub const TERMINAL_NAMESPACE: &str = "terminal";
const TERMINAL_CONVERSATION: &str = "local";
const TERMINAL_USER: &str = "user";
const PROMPT: &str = ">>> ";

pub struct TerminalChannel {
    core: ChannelCore,
    out: Mutex<Box<dyn Write + Send>>,
    running: AtomicBool,
}

impl TerminalChannel {
    /// Terminal channel printing to stdout.
    pub fn new(policy: WaitPolicy) -> Self {
        Self::with_output(policy, Box::new(std::io::stdout()))
    }

    pub fn with_output(policy: WaitPolicy, out: Box<dyn Write + Send>) -> Self {
        Self {
            core: ChannelCore::new(TERMINAL_NAMESPACE, policy),
            out: Mutex::new(out),
            running: AtomicBool::new(false),
        }
    }

    /// The one conversation key the terminal uses.
    pub fn key() -> ConversationKey {
        ConversationKey::new(TERMINAL_NAMESPACE, TERMINAL_CONVERSATION)
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn write_raw(&self, s: &str) -> std::io::Result<()> {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        out.write_all(s.as_bytes())?;
        out.flush()
    }

    fn prompt(&self) {
        if let Err(e) = self.write_raw(PROMPT) {
            log::debug!("terminal: prompt failed: {}", e);
        }
    }

    /// Read lines from `input` until EOF or stop, delivering each non-empty line.
    pub fn run<R>(self: Arc<Self>, input: R) -> JoinHandle<()>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        self.running.store(true, Ordering::SeqCst);
        self.core.set_state(ConnectionState::Ready);
        tokio::spawn(async move {
            run_input_loop(self, input).await;
        })
    }

    /// Run on the process stdin.
    pub fn run_stdin(self: Arc<Self>) -> JoinHandle<()> {
        self.run(tokio::io::BufReader::new(tokio::io::stdin()))
    }
}

async fn run_input_loop<R>(channel: Arc<TerminalChannel>, input: R)
where
    R: AsyncBufRead + Unpin,
{
    let this: Arc<dyn ChannelAdapter> = channel.clone();
    let mut lines = input.lines();
    channel.prompt();
    while channel.running() {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                log::warn!("terminal: reading input failed: {}", e);
                break;
            }
        };
        let text = line.trim();
        if !text.is_empty() {
            let inbound = InboundMessage::new(TerminalChannel::key(), TERMINAL_USER, text);
            if let Err(e) = deliver(&this, inbound) {
                log::debug!("terminal: line not delivered: {}", e);
            }
        }
        channel.prompt();
    }
    channel.core.set_state(ConnectionState::Disconnected);
    log::info!("terminal channel: input closed");
}

#[async_trait]
impl ChannelAdapter for TerminalChannel {
    fn id(&self) -> &str {
        TERMINAL_NAMESPACE
    }

    fn core(&self) -> &ChannelCore {
        &self.core
    }

    async fn send(&self, _key: &ConversationKey, text: &str) -> Result<(), ChannelError> {
        self.core.ensure_ready()?;
        self.write_raw(&format!("<<< {}\n", text))
            .map_err(|e| ChannelError::Transport(e.to_string()))
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.core.set_state(ConnectionState::Disconnected);
    }
}
