//! TCP server binding connection lifecycle to the session registry
//!
//! Listens for clients speaking newline-delimited JSON. Each connection gets
//! a reader task (parses [`ClientRequest`]s and drives the registry) and a
//! writer task (drains the connection's outbound channel). Every exit path
//! funnels through `release_all`, the mandatory cleanup boundary: no watch
//! handle survives its connection.

use crate::auth::AuthGate;
use crate::discovery;
use crate::protocol::{ClientRequest, ServerMessage};
use crate::registry::{ConnectionId, SessionRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Shared state every connection handler needs.
pub struct ServerContext {
    pub registry: Arc<SessionRegistry>,
    pub auth: Arc<dyn AuthGate>,
    /// Base directory for `list` requests that omit `directory`.
    pub search_root: PathBuf,
    /// Ignore globs for `list` requests.
    pub ignores: Vec<String>,
}

/// Bind `addr` and serve until the listener fails.
pub async fn start(addr: &str, ctx: Arc<ServerContext>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("listening on {}", listener.local_addr()?);
    serve(listener, ctx).await;
    Ok(())
}

/// Accept loop. Split out from [`start`] so tests can bind their own
/// ephemeral-port listener.
pub async fn serve(listener: TcpListener, ctx: Arc<ServerContext>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                trace!(%addr, "accepted connection");
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    handle_connection(stream, ctx).await;
                });
            }
            Err(e) => {
                warn!("failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, ctx: Arc<ServerContext>) {
    let conn = ConnectionId::next();
    debug!(%conn, "client connected");

    let (read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let mut line = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    warn!("failed to encode message: {}", e);
                    continue;
                }
            };
            line.push('\n');
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    ctx.registry.connect(conn);
    let mut authorized = ctx.auth.authorize(None);

    let reader = BufReader::new(read_half);
    let mut lines = reader.lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let request = match serde_json::from_str::<ClientRequest>(&line) {
            Ok(r) => r,
            Err(e) => {
                trace!(%conn, "failed to parse request: {} (line: {})", e, line);
                let _ = tx.send(ServerMessage::Error {
                    path: None,
                    message: format!("malformed request: {e}"),
                });
                continue;
            }
        };

        match request {
            ClientRequest::Hello { token } => {
                authorized = ctx.auth.authorize(token.as_deref());
                if !authorized {
                    debug!(%conn, "rejected hello");
                    let _ = tx.send(ServerMessage::Error {
                        path: None,
                        message: "unauthorized".into(),
                    });
                    break;
                }
            }
            _ if !authorized => {
                debug!(%conn, "request before successful hello");
                let _ = tx.send(ServerMessage::Error {
                    path: None,
                    message: "unauthorized".into(),
                });
                break;
            }
            ClientRequest::Start { path, lines } => {
                ctx.registry.subscribe(conn, path, lines, &tx);
            }
            ClientRequest::Stop { path } => {
                ctx.registry.unsubscribe(conn, &path);
            }
            ClientRequest::List { pattern, directory } => {
                let base = match directory {
                    // An absolute directory replaces the root; a relative one
                    // is resolved under it.
                    Some(dir) => ctx.search_root.join(dir),
                    None => ctx.search_root.clone(),
                };
                let pattern = pattern.as_deref().unwrap_or(discovery::DEFAULT_PATTERN);
                let msg = match discovery::find_files(&base, pattern, &ctx.ignores) {
                    Ok(files) => ServerMessage::Files { files },
                    Err(e) => ServerMessage::Error {
                        path: None,
                        message: format!("invalid pattern: {e}"),
                    },
                };
                let _ = tx.send(msg);
            }
        }
    }

    // Mandatory cleanup boundary: closes every gate this connection owns,
    // which also drops the writers' remaining senders.
    ctx.registry.release_all(conn);
    drop(tx);
    let _ = writer.await;
    debug!(%conn, "client disconnected");
}
