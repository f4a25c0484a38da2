//! Server: one HTTP port for health, the Messenger webhook and the web chat;
//! socket channels (Slack) run as connector tasks beside it.

mod server;

pub use server::{build_bot, run_server, run_terminal, serve, ServerState};
