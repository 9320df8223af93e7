//! Wire protocol between clients and the daemon
//!
//! Messages travel as newline-delimited JSON over one persistent TCP
//! connection. Requests are implicitly scoped to the sending connection;
//! `data`/`error` messages carry the file path so the client can attribute
//! lines to the correct tail.

use serde::{Deserialize, Serialize};

/// Default number of priming lines when a `start` request omits `lines`.
pub const DEFAULT_PRIMING_LINES: usize = 10;

fn default_lines() -> usize {
    DEFAULT_PRIMING_LINES
}

/// Request from a client to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Authentication handshake. Required as the first request when the
    /// server is configured with a token; otherwise optional.
    Hello {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    /// Start tailing `path`, priming with the last `lines` lines.
    Start {
        path: String,
        #[serde(default = "default_lines")]
        lines: usize,
    },
    /// Stop tailing `path`. Stopping a path that is not tailed is a no-op.
    Stop { path: String },
    /// List files matching a glob pattern under a base directory.
    List {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pattern: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        directory: Option<String>,
    },
}

/// Message from the daemon to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Line content for a tailed file. The priming batch arrives as a single
    /// `data` message with lines joined by `\n`; every subsequently appended
    /// line arrives as its own message, in append order.
    Data { path: String, content: String },
    /// A per-file (or, without a path, per-connection) failure. Errors for
    /// one tail never affect other tails on the same connection.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        message: String,
    },
    /// Reply to a `list` request.
    Files { files: Vec<String> },
}
