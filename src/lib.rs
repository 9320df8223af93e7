//! Tailview: stream newly appended log lines to connected clients

pub mod auth;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod watch;
