//! Opal core library: conversation spool, channel adapters, the assistant bot,
//! user settings and the HTTP server used by the CLI.

pub mod bot;
pub mod channels;
pub mod config;
pub mod conversation;
pub mod gateway;
pub mod init;
pub mod settings;
pub mod spool;
