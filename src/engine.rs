//! Tail engine: drives delivery for every open watch handle
//!
//! Each tail runs as its own tokio task: open and prime the
//! [`WatchHandle`](crate::watch::WatchHandle), deliver the priming batch,
//! then poll on a fixed interval. A process-wide `notify` watcher nudges the
//! loop early when the tailed file changes, so the interval is only the
//! fallback cadence; if the watcher backend fails to initialize, interval
//! polling alone keeps every tail correct.
//!
//! Delivery goes through a [`DeliveryGate`]. Closing the gate is the
//! cancellation boundary: once `close()` returns, no further message can be
//! delivered for that subscription, even if a poll cycle was already in
//! flight; its results are discarded.

use crate::protocol::ServerMessage;
use crate::watch::WatchHandle;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// One-way valve between a tail task and its connection's outbound channel.
///
/// The sender lives in a mutex-guarded slot. `close()` empties the slot under
/// the lock, so it strictly orders with any concurrent `deliver()`: after
/// `close()` returns, every subsequent delivery attempt is discarded.
#[derive(Debug)]
pub struct DeliveryGate {
    slot: Mutex<Option<mpsc::UnboundedSender<ServerMessage>>>,
}

impl DeliveryGate {
    pub fn new(tx: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self {
            slot: Mutex::new(Some(tx)),
        }
    }

    /// Deliver a message. Returns false once the gate is closed or the
    /// connection's channel is gone.
    pub fn deliver(&self, msg: ServerMessage) -> bool {
        let Ok(slot) = self.slot.lock() else {
            return false;
        };
        match slot.as_ref() {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }

    /// Close the gate. Idempotent.
    pub fn close(&self) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = None;
        }
    }

    pub fn is_closed(&self) -> bool {
        match self.slot.lock() {
            Ok(slot) => slot.is_none(),
            Err(_) => true,
        }
    }
}

#[derive(Debug, Default)]
struct NudgeTable {
    /// Canonical file path → notifiers of the tasks tailing it.
    by_path: HashMap<PathBuf, Vec<(u64, Arc<Notify>)>>,
    /// Refcounts of watched parent directories.
    dir_refs: HashMap<PathBuf, usize>,
}

/// Shared tailing machinery: the poll interval and the notify-based nudge
/// fan-out. One engine serves every connection in the process.
pub struct TailEngine {
    poll_interval: Duration,
    nudges: Arc<Mutex<NudgeTable>>,
    /// `None` when the watcher backend failed to initialize (pure polling).
    watcher: Mutex<Option<RecommendedWatcher>>,
    next_nudge_id: AtomicU64,
}

impl TailEngine {
    pub fn new(poll_interval: Duration) -> Arc<Self> {
        let nudges: Arc<Mutex<NudgeTable>> = Arc::default();

        let nudges_cb = Arc::clone(&nudges);
        let watcher =
            match notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                let event = match res {
                    Ok(e) => e,
                    Err(err) => {
                        // Interval polling is the backstop; nothing to do.
                        debug!(error = %err, "file watcher error");
                        return;
                    }
                };
                let Ok(table) = nudges_cb.lock() else {
                    return;
                };
                for path in &event.paths {
                    if let Some(entries) = table.by_path.get(path) {
                        for (_, nudge) in entries {
                            nudge.notify_one();
                        }
                    }
                }
            }) {
                Ok(w) => Some(w),
                Err(e) => {
                    warn!(error = %e, "failed to initialize file watcher; falling back to interval polling");
                    None
                }
            };

        Arc::new(Self {
            poll_interval,
            nudges,
            watcher: Mutex::new(watcher),
            next_nudge_id: AtomicU64::new(1),
        })
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Spawn the tail task for one subscription. `on_exit` runs when the
    /// task finishes on its own (open failure, watch error, or a closed
    /// gate) so the owner can drop its bookkeeping; it does not run when the
    /// task is aborted, which only happens after the owner has already
    /// removed the subscription.
    pub fn spawn_tail(
        engine: &Arc<Self>,
        path: String,
        priming_lines: usize,
        gate: Arc<DeliveryGate>,
        on_exit: impl FnOnce() + Send + 'static,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(engine);
        tokio::spawn(async move {
            run_tail(engine, path, priming_lines, gate).await;
            on_exit();
        })
    }

    /// Register a nudge for `path`, watching its parent directory. Returns
    /// the notifier and a guard that unregisters on drop (including when the
    /// tail task is aborted mid-await).
    fn register_nudge(engine: &Arc<Self>, path: &Path) -> (Arc<Notify>, NudgeGuard) {
        // Key by the canonical location so notify event paths match.
        let key = canonical_key(path);
        let dir = key.parent().map(Path::to_path_buf);
        let nudge = Arc::new(Notify::new());
        let id = engine.next_nudge_id.fetch_add(1, Ordering::Relaxed);

        let mut newly_watched = None;
        if let Ok(mut table) = engine.nudges.lock() {
            table
                .by_path
                .entry(key.clone())
                .or_default()
                .push((id, Arc::clone(&nudge)));
            if let Some(dir) = &dir {
                let refs = table.dir_refs.entry(dir.clone()).or_insert(0);
                *refs += 1;
                if *refs == 1 {
                    newly_watched = Some(dir.clone());
                }
            }
        }

        if let Some(dir) = newly_watched
            && let Ok(mut watcher) = engine.watcher.lock()
            && let Some(w) = watcher.as_mut()
            && let Err(e) = w.watch(&dir, RecursiveMode::NonRecursive)
        {
            debug!(path = %dir.display(), error = %e, "failed to watch directory; tail falls back to interval polling");
        }

        let guard = NudgeGuard {
            engine: Arc::clone(engine),
            key,
            dir,
            id,
        };
        (nudge, guard)
    }

    fn unregister_nudge(&self, key: &Path, id: u64, dir: Option<&Path>) {
        let mut unwatch = None;
        if let Ok(mut table) = self.nudges.lock() {
            if let Some(entries) = table.by_path.get_mut(key) {
                entries.retain(|(entry_id, _)| *entry_id != id);
                if entries.is_empty() {
                    table.by_path.remove(key);
                }
            }
            if let Some(dir) = dir
                && let Some(refs) = table.dir_refs.get_mut(dir)
            {
                *refs -= 1;
                if *refs == 0 {
                    table.dir_refs.remove(dir);
                    unwatch = Some(dir.to_path_buf());
                }
            }
        }

        // Unwatch failures are swallowed; the directory may already be gone.
        if let Some(dir) = unwatch
            && let Ok(mut watcher) = self.watcher.lock()
            && let Some(w) = watcher.as_mut()
        {
            let _ = w.unwatch(&dir);
        }
    }

    #[cfg(test)]
    fn nudge_count(&self) -> usize {
        self.nudges
            .lock()
            .map(|t| t.by_path.values().map(Vec::len).sum())
            .unwrap_or(0)
    }
}

/// Resolve the canonical location of a possibly-not-yet-canonical path by
/// canonicalizing its parent. Falls back to the path as given.
fn canonical_key(path: &Path) -> PathBuf {
    let Some(name) = path.file_name() else {
        return path.to_path_buf();
    };
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    match parent {
        Some(parent) => match std::fs::canonicalize(parent) {
            Ok(dir) => dir.join(name),
            Err(_) => path.to_path_buf(),
        },
        None => match std::fs::canonicalize(".") {
            Ok(dir) => dir.join(name),
            Err(_) => path.to_path_buf(),
        },
    }
}

struct NudgeGuard {
    engine: Arc<TailEngine>,
    key: PathBuf,
    dir: Option<PathBuf>,
    id: u64,
}

impl Drop for NudgeGuard {
    fn drop(&mut self) {
        self.engine
            .unregister_nudge(&self.key, self.id, self.dir.as_deref());
    }
}

async fn run_tail(
    engine: Arc<TailEngine>,
    path: String,
    priming_lines: usize,
    gate: Arc<DeliveryGate>,
) {
    let (mut handle, priming) = match WatchHandle::open(&path, priming_lines).await {
        Ok(v) => v,
        Err(e) => {
            debug!(%path, error = %e, "failed to open tail");
            gate.deliver(ServerMessage::Error {
                path: Some(path),
                message: e.to_string(),
            });
            gate.close();
            return;
        }
    };

    if !priming.is_empty()
        && !gate.deliver(ServerMessage::Data {
            path: path.clone(),
            content: priming.join("\n"),
        })
    {
        gate.close();
        return;
    }

    let (nudge, _nudge_guard) = TailEngine::register_nudge(&engine, handle.path());
    let mut tick = tokio::time::interval(engine.poll_interval());
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    'tail: loop {
        tokio::select! {
            biased;
            _ = nudge.notified() => {}
            _ = tick.tick() => {}
        }

        if gate.is_closed() {
            break;
        }

        match handle.poll().await {
            Ok(lines) => {
                for line in lines {
                    trace!(%path, "tail line");
                    if !gate.deliver(ServerMessage::Data {
                        path: path.clone(),
                        content: line,
                    }) {
                        break 'tail;
                    }
                }
            }
            Err(e) => {
                warn!(%path, error = %e, "tail failed");
                gate.deliver(ServerMessage::Error {
                    path: Some(path.clone()),
                    message: e.to_string(),
                });
                break;
            }
        }
    }

    handle.close();
    gate.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::AtomicBool;
    use tempfile::TempDir;
    use tokio::time::timeout;

    const POLL: Duration = Duration::from_millis(25);
    const RECV_TIMEOUT: Duration = Duration::from_secs(2);

    fn append(path: &Path, content: &str) {
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new().append(true).open(path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> ServerMessage {
        timeout(RECV_TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("channel closed")
    }

    #[test]
    fn gate_discards_after_close() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let gate = DeliveryGate::new(tx);

        assert!(gate.deliver(ServerMessage::Data {
            path: "a.log".into(),
            content: "one".into(),
        }));
        gate.close();
        gate.close();
        assert!(gate.is_closed());
        assert!(!gate.deliver(ServerMessage::Data {
            path: "a.log".into(),
            content: "two".into(),
        }));

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn gate_reports_dropped_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        let gate = DeliveryGate::new(tx);
        drop(rx);
        assert!(!gate.deliver(ServerMessage::Files { files: vec![] }));
    }

    #[tokio::test]
    async fn tail_delivers_priming_then_appended_lines() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.log");
        std::fs::write(&path, "line1\nline2\nline3\n").unwrap();
        let path_str = path.to_string_lossy().into_owned();

        let engine = TailEngine::new(POLL);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let gate = Arc::new(DeliveryGate::new(tx));
        let task =
            TailEngine::spawn_tail(&engine, path_str.clone(), 2, Arc::clone(&gate), || {});

        match recv(&mut rx).await {
            ServerMessage::Data { path: p, content } => {
                assert_eq!(p, path_str);
                assert_eq!(content, "line2\nline3");
            }
            other => panic!("unexpected message: {other:?}"),
        }

        append(&path, "line4\n");
        match recv(&mut rx).await {
            ServerMessage::Data { content, .. } => assert_eq!(content, "line4"),
            other => panic!("unexpected message: {other:?}"),
        }

        gate.close();
        task.abort();
    }

    #[tokio::test]
    async fn closed_gate_stops_delivery() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.log");
        std::fs::write(&path, "line1\n").unwrap();
        let path_str = path.to_string_lossy().into_owned();

        let engine = TailEngine::new(POLL);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let gate = Arc::new(DeliveryGate::new(tx));
        let exited = Arc::new(AtomicBool::new(false));
        let exited_flag = Arc::clone(&exited);
        let task = TailEngine::spawn_tail(&engine, path_str, 1, Arc::clone(&gate), move || {
            exited_flag.store(true, Ordering::SeqCst);
        });

        // Priming.
        recv(&mut rx).await;

        gate.close();
        append(&path, "after stop\n");
        let _ = timeout(RECV_TIMEOUT, task).await;
        assert!(exited.load(Ordering::SeqCst));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn missing_file_reports_error_once_and_exits() {
        let tmp = TempDir::new().unwrap();
        let path_str = tmp
            .path()
            .join("missing.log")
            .to_string_lossy()
            .into_owned();

        let engine = TailEngine::new(POLL);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let gate = Arc::new(DeliveryGate::new(tx));
        let exited = Arc::new(AtomicBool::new(false));
        let exited_flag = Arc::clone(&exited);
        let task = TailEngine::spawn_tail(&engine, path_str.clone(), 5, gate, move || {
            exited_flag.store(true, Ordering::SeqCst);
        });

        match recv(&mut rx).await {
            ServerMessage::Error { path, message } => {
                assert_eq!(path.as_deref(), Some(path_str.as_str()));
                assert!(message.contains("not found"), "message: {message}");
            }
            other => panic!("unexpected message: {other:?}"),
        }

        let _ = timeout(RECV_TIMEOUT, task).await;
        assert!(exited.load(Ordering::SeqCst));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn truncation_resumes_without_duplicates() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.log");
        std::fs::write(&path, "old1\nold2\n").unwrap();
        let path_str = path.to_string_lossy().into_owned();

        let engine = TailEngine::new(POLL);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let gate = Arc::new(DeliveryGate::new(tx));
        let task = TailEngine::spawn_tail(&engine, path_str, 1, Arc::clone(&gate), || {});

        recv(&mut rx).await; // priming: old2

        std::fs::write(&path, "").unwrap();
        append(&path, "fresh\n");

        match recv(&mut rx).await {
            ServerMessage::Data { content, .. } => assert_eq!(content, "fresh"),
            other => panic!("unexpected message: {other:?}"),
        }

        gate.close();
        task.abort();
    }

    #[tokio::test]
    async fn nudge_registration_is_released_on_abort() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.log");
        std::fs::write(&path, "line1\n").unwrap();

        let engine = TailEngine::new(POLL);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let gate = Arc::new(DeliveryGate::new(tx));
        let task = TailEngine::spawn_tail(
            &engine,
            path.to_string_lossy().into_owned(),
            1,
            Arc::clone(&gate),
            || {},
        );

        recv(&mut rx).await; // priming; the nudge is registered by now
        assert_eq!(engine.nudge_count(), 1);

        gate.close();
        task.abort();
        let _ = task.await;
        // Aborting runs the guard's Drop at the await point.
        assert_eq!(engine.nudge_count(), 0);
    }
}
