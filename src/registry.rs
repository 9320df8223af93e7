//! Session registry: the single source of truth for active tails
//!
//! Maps each connection to its set of subscriptions, keyed
//! connection → path, so "release everything this connection owns" is a
//! single map removal rather than a full-table scan. No other component
//! keeps its own copy of subscription state.
//!
//! Calls for one connection (subscribe / unsubscribe / release_all) must not
//! be issued concurrently; the dispatcher guarantees this by funnelling each
//! connection's requests through its single reader task. Calls for different
//! connections may proceed fully in parallel.

use crate::engine::{DeliveryGate, TailEngine};
use crate::protocol::ServerMessage;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

/// Opaque identity of one live client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// One live (connection, path) tail.
#[derive(Debug)]
struct Subscription {
    id: u64,
    gate: Arc<DeliveryGate>,
    task: JoinHandle<()>,
}

impl Subscription {
    /// Close the gate first so no event computed by an in-flight poll can
    /// still be delivered, then stop the task.
    fn retire(self) {
        self.gate.close();
        self.task.abort();
    }
}

/// Registry of connections and their active tails.
pub struct SessionRegistry {
    engine: Arc<TailEngine>,
    connections: Mutex<HashMap<ConnectionId, HashMap<String, Subscription>>>,
    next_sub_id: AtomicU64,
    weak_self: Weak<SessionRegistry>,
}

impl SessionRegistry {
    pub fn new(engine: Arc<TailEngine>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            engine,
            connections: Mutex::new(HashMap::new()),
            next_sub_id: AtomicU64::new(1),
            weak_self: weak.clone(),
        })
    }

    /// Register a connection with zero subscriptions.
    pub fn connect(&self, conn: ConnectionId) {
        if let Ok(mut connections) = self.connections.lock() {
            connections.insert(conn, HashMap::new());
            debug!(%conn, "{} connection(s)", connections.len());
        }
    }

    /// Start tailing `path` for `conn`, priming with the last
    /// `priming_lines` lines. An existing subscription for the same
    /// (connection, path) is fully retired before the new handle opens. The
    /// priming batch and all subsequent lines are delivered through `tx`.
    pub fn subscribe(
        &self,
        conn: ConnectionId,
        path: String,
        priming_lines: usize,
        tx: &mpsc::UnboundedSender<ServerMessage>,
    ) {
        let sub_id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let gate = Arc::new(DeliveryGate::new(tx.clone()));
        let registry = self.weak_self.clone();

        let Ok(mut connections) = self.connections.lock() else {
            return;
        };
        let Some(subs) = connections.get_mut(&conn) else {
            trace!(%conn, "subscribe for unknown connection");
            return;
        };
        if let Some(old) = subs.remove(&path) {
            debug!(%conn, %path, "replacing existing tail");
            old.retire();
        }

        info!(%conn, %path, priming_lines, "start tail");
        // Spawn and insert inside the same critical section: a fast-failing
        // task's self-removal locks `connections` and therefore cannot run
        // before the entry exists.
        let exit_path = path.clone();
        let task = TailEngine::spawn_tail(
            &self.engine,
            path.clone(),
            priming_lines,
            Arc::clone(&gate),
            move || {
                if let Some(registry) = registry.upgrade() {
                    registry.remove_finished(conn, &exit_path, sub_id);
                }
            },
        );
        subs.insert(
            path,
            Subscription {
                id: sub_id,
                gate,
                task,
            },
        );
    }

    /// Stop tailing `path` for `conn`. No-op when there is no such
    /// subscription, so double-stop is always safe. Once this returns, no
    /// further `data`/`error` for the path can reach the connection.
    pub fn unsubscribe(&self, conn: ConnectionId, path: &str) {
        let sub = match self.connections.lock() {
            Ok(mut connections) => connections
                .get_mut(&conn)
                .and_then(|subs| subs.remove(path)),
            Err(_) => None,
        };
        if let Some(sub) = sub {
            info!(%conn, %path, "stop tail");
            sub.retire();
        }
    }

    /// Release every subscription owned by `conn` and forget the connection.
    /// Safe to call after individual unsubscribes; must be called at
    /// disconnect.
    pub fn release_all(&self, conn: ConnectionId) {
        let subs = match self.connections.lock() {
            Ok(mut connections) => connections.remove(&conn),
            Err(_) => None,
        };
        if let Some(subs) = subs {
            if !subs.is_empty() {
                info!(%conn, "releasing {} tail(s)", subs.len());
            }
            for (_, sub) in subs {
                sub.retire();
            }
        }
    }

    /// Drop the bookkeeping for a tail whose task exited on its own. The id
    /// check ensures a finished tail never removes a successor subscription
    /// for the same path.
    fn remove_finished(&self, conn: ConnectionId, path: &str, sub_id: u64) {
        if let Ok(mut connections) = self.connections.lock()
            && let Some(subs) = connections.get_mut(&conn)
            && subs.get(path).is_some_and(|sub| sub.id == sub_id)
        {
            debug!(%conn, %path, "tail finished");
            subs.remove(path);
        }
    }

    /// Number of live subscriptions for a connection.
    pub fn subscription_count(&self, conn: ConnectionId) -> usize {
        self.connections
            .lock()
            .ok()
            .and_then(|connections| connections.get(&conn).map(HashMap::len))
            .unwrap_or(0)
    }

    /// Total live subscriptions across all connections.
    pub fn total_subscriptions(&self) -> usize {
        self.connections
            .lock()
            .map(|connections| connections.values().map(HashMap::len).sum())
            .unwrap_or(0)
    }

    pub fn is_subscribed(&self, conn: ConnectionId, path: &str) -> bool {
        self.connections
            .lock()
            .ok()
            .and_then(|connections| connections.get(&conn).map(|subs| subs.contains_key(path)))
            .unwrap_or(false)
    }
}
