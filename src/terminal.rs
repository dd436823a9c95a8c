//! Interactive terminal sessions: shell processes on pseudo-terminals,
//! bridged to network channels, tracked in a shared registry.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::GatewayError;

/// Initial terminal geometry for new sessions.
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 30;

const OUTPUT_CHANNEL_CAPACITY: usize = 64;
const INPUT_CHANNEL_CAPACITY: usize = 64;

/// Liveness of a terminal session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Starting,
    Active,
    Closing,
    Closed,
}

/// Relay endpoints handed to the network side of a session: the PTY output
/// stream and the child-exit notification.
pub struct SessionIo {
    pub output_rx: mpsc::Receiver<Bytes>,
    pub exit_rx: oneshot::Receiver<()>,
}

/// One interactive shell on a pseudo-terminal.
///
/// The session manager owns the process handle; the registry keeps a
/// non-owning `Arc` for lookup. The network channel side receives a
/// [`SessionIo`] and drives the relay loop.
pub struct TerminalSession {
    pub id: String,
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    input_tx: mpsc::Sender<Bytes>,
    state: Mutex<SessionState>,
    size: Mutex<(u16, u16)>,
}

impl TerminalSession {
    /// Spawn a shell on a fresh PTY with the project root as its working
    /// directory and the gateway's environment inherited.
    ///
    /// Nothing is registered on failure; the caller inserts the returned
    /// session into the registry once the channel side is ready.
    pub fn spawn(
        project: &str,
        root: &Path,
        shell: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(Arc<Self>, SessionIo), GatewayError> {
        let id = format!("{}-{}", project, Uuid::new_v4());

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| GatewayError::SessionSpawnError(e.to_string()))?;

        let mut cmd = CommandBuilder::new(shell);
        cmd.cwd(root);
        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| GatewayError::SessionSpawnError(e.to_string()))?;
        drop(pair.slave);

        let killer = child.clone_killer();
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| GatewayError::SessionSpawnError(e.to_string()))?;
        let mut writer = pair
            .master
            .take_writer()
            .map_err(|e| GatewayError::SessionSpawnError(e.to_string()))?;

        // PTY output -> channel. Ends on EOF, read error, or when the
        // receiving side is gone.
        let (output_tx, output_rx) = mpsc::channel::<Bytes>(OUTPUT_CHANNEL_CAPACITY);
        {
            let id = id.clone();
            tokio::task::spawn_blocking(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if output_tx
                                .blocking_send(Bytes::copy_from_slice(&buf[..n]))
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                }
                debug!(session = %id, "pty reader finished");
            });
        }

        // Channel -> PTY input.
        let (input_tx, mut input_rx) = mpsc::channel::<Bytes>(INPUT_CHANNEL_CAPACITY);
        tokio::task::spawn_blocking(move || {
            while let Some(data) = input_rx.blocking_recv() {
                if writer.write_all(&data).is_err() {
                    break;
                }
                let _ = writer.flush();
            }
        });

        // Child exit monitor.
        let (exit_tx, exit_rx) = oneshot::channel();
        {
            let id = id.clone();
            tokio::task::spawn_blocking(move || {
                match child.wait() {
                    Ok(status) => debug!(session = %id, ?status, "terminal child exited"),
                    Err(e) => error!(session = %id, error = %e, "error waiting for terminal child"),
                }
                let _ = exit_tx.send(());
            });
        }

        let session = Arc::new(Self {
            id,
            master: Mutex::new(pair.master),
            killer: Mutex::new(killer),
            input_tx,
            state: Mutex::new(SessionState::Starting),
            size: Mutex::new((cols, rows)),
        });
        Ok((session, SessionIo { output_rx, exit_rx }))
    }

    /// Queue raw bytes for the process's input stream. Returns `false` once
    /// the input bridge has shut down.
    pub async fn write(&self, data: Bytes) -> bool {
        self.input_tx.send(data).await.is_ok()
    }

    /// Apply a new terminal size to the PTY immediately.
    pub fn resize(&self, cols: u16, rows: u16) {
        let result = self.master.lock().resize(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        });
        match result {
            Ok(()) => *self.size.lock() = (cols, rows),
            Err(e) => warn!(session = %self.id, error = %e, "pty resize failed"),
        }
    }

    /// Send a termination signal to the underlying process. Safe to call on
    /// a process that has already exited.
    pub fn terminate(&self) {
        if let Err(e) = self.killer.lock().kill() {
            debug!(session = %self.id, error = %e, "kill: child already gone");
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn size(&self) -> (u16, u16) {
        *self.size.lock()
    }

    pub fn mark_active(&self) {
        *self.state.lock() = SessionState::Active;
    }

    /// Claim the closing transition. Returns `true` exactly once per
    /// session, so teardown cannot run twice when both endpoints terminate
    /// near-simultaneously.
    pub fn begin_close(&self) -> bool {
        let mut state = self.state.lock();
        if matches!(*state, SessionState::Closing | SessionState::Closed) {
            false
        } else {
            *state = SessionState::Closing;
            true
        }
    }

    pub fn mark_closed(&self) {
        *self.state.lock() = SessionState::Closed;
    }
}

struct RegistryInner {
    sessions: HashMap<String, Arc<TerminalSession>>,
    draining: bool,
}

/// Shared lookup table of live terminal sessions.
///
/// All mutation goes through the session manager: insert on open, remove on
/// teardown, drain on shutdown. Once drained, further inserts are refused.
#[derive(Clone)]
pub struct TerminalRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl TerminalRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                sessions: HashMap::new(),
                draining: false,
            })),
        }
    }

    pub async fn insert(&self, session: Arc<TerminalSession>) -> Result<(), GatewayError> {
        let mut inner = self.inner.write().await;
        if inner.draining {
            return Err(GatewayError::ShuttingDown);
        }
        inner.sessions.insert(session.id.clone(), session);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<Arc<TerminalSession>> {
        self.inner.read().await.sessions.get(id).cloned()
    }

    pub async fn remove(&self, id: &str) -> Option<Arc<TerminalSession>> {
        self.inner.write().await.sessions.remove(id)
    }

    pub async fn list(&self) -> Vec<Arc<TerminalSession>> {
        self.inner.read().await.sessions.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    /// Signal the session with the given id to terminate. Teardown completes
    /// in the session's relay loop once the process exit is observed.
    pub async fn close(&self, id: &str) -> bool {
        match self.get(id).await {
            Some(session) => {
                session.terminate();
                true
            }
            None => false,
        }
    }

    /// Atomically snapshot and clear the registry, refuse future inserts,
    /// and send a termination signal to every drained session. Returns once
    /// all children have been signalled, without waiting for them to exit.
    pub async fn drain(&self) -> Vec<Arc<TerminalSession>> {
        let drained: Vec<Arc<TerminalSession>> = {
            let mut inner = self.inner.write().await;
            inner.draining = true;
            inner.sessions.drain().map(|(_, session)| session).collect()
        };
        for session in &drained {
            if session.begin_close() {
                session.terminate();
            }
        }
        drained
    }
}

impl Default for TerminalRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn spawn_test_session(root: &Path) -> (Arc<TerminalSession>, SessionIo) {
        TerminalSession::spawn("demo", root, "sh", DEFAULT_COLS, DEFAULT_ROWS)
            .expect("failed to spawn test session")
    }

    async fn read_until(io: &mut SessionIo, needle: &str) -> String {
        let mut collected = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while let Ok(Some(chunk)) = tokio::time::timeout_at(deadline, io.output_rx.recv()).await {
            collected.extend_from_slice(&chunk);
            if String::from_utf8_lossy(&collected).contains(needle) {
                break;
            }
        }
        String::from_utf8_lossy(&collected).into_owned()
    }

    #[tokio::test]
    async fn session_relays_input_and_output() {
        let dir = tempfile::tempdir().unwrap();
        let (session, mut io) = spawn_test_session(dir.path());
        session.mark_active();

        // The echoed command contains "mark%s", never "marker"; only real
        // execution produces the needle.
        assert!(session.write(Bytes::from_static(b"printf 'mark%s\\n' er\n")).await);
        let output = read_until(&mut io, "marker").await;
        assert!(output.contains("marker"), "got: {output}");

        session.terminate();
    }

    #[tokio::test]
    async fn session_runs_in_the_project_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("anchor.txt"), "anchored-here\n").unwrap();
        let (session, mut io) = spawn_test_session(dir.path());

        assert!(session.write(Bytes::from_static(b"cat anchor.txt\n")).await);
        let output = read_until(&mut io, "anchored-here").await;
        assert!(output.contains("anchored-here"), "got: {output}");

        session.terminate();
    }

    #[tokio::test]
    async fn terminate_resolves_the_exit_notification() {
        let dir = tempfile::tempdir().unwrap();
        let (session, io) = spawn_test_session(dir.path());

        session.terminate();
        timeout(Duration::from_secs(5), io.exit_rx)
            .await
            .expect("exit notification should fire after terminate")
            .expect("exit sender should not be dropped");
    }

    #[tokio::test]
    async fn shell_exit_resolves_the_exit_notification() {
        let dir = tempfile::tempdir().unwrap();
        let (session, io) = spawn_test_session(dir.path());

        assert!(session.write(Bytes::from_static(b"exit\n")).await);
        timeout(Duration::from_secs(5), io.exit_rx)
            .await
            .expect("exit notification should fire when the shell exits")
            .expect("exit sender should not be dropped");
        drop(session);
    }

    #[tokio::test]
    async fn resize_updates_the_tracked_size() {
        let dir = tempfile::tempdir().unwrap();
        let (session, _io) = spawn_test_session(dir.path());

        assert_eq!(session.size(), (DEFAULT_COLS, DEFAULT_ROWS));
        session.resize(120, 40);
        assert_eq!(session.size(), (120, 40));

        session.terminate();
    }

    #[tokio::test]
    async fn begin_close_claims_teardown_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let (session, _io) = spawn_test_session(dir.path());

        assert_eq!(session.state(), SessionState::Starting);
        session.mark_active();
        assert!(session.begin_close());
        assert!(!session.begin_close(), "second claim must be refused");
        session.mark_closed();
        assert!(!session.begin_close(), "closed sessions stay closed");

        session.terminate();
    }

    #[tokio::test]
    async fn registry_tracks_concurrent_sessions_with_distinct_ids() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TerminalRegistry::new();

        let mut sessions = Vec::new();
        for _ in 0..5 {
            let (session, _io) = spawn_test_session(dir.path());
            registry.insert(session.clone()).await.unwrap();
            sessions.push(session);
        }
        assert_eq!(registry.len().await, 5);

        let mut ids: Vec<String> = sessions.iter().map(|s| s.id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 5, "session ids must be unique");

        // Closing a subset removes exactly those entries.
        for session in &sessions[..2] {
            registry.remove(&session.id).await;
            session.terminate();
        }
        assert_eq!(registry.len().await, 3);
        assert!(registry.get(&sessions[0].id).await.is_none());
        assert!(registry.get(&sessions[4].id).await.is_some());

        for session in &sessions[2..] {
            session.terminate();
        }
    }

    #[tokio::test]
    async fn registry_close_signals_the_underlying_process() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TerminalRegistry::new();
        let (session, io) = spawn_test_session(dir.path());
        registry.insert(session.clone()).await.unwrap();

        assert!(registry.close(&session.id).await);
        timeout(Duration::from_secs(5), io.exit_rx)
            .await
            .expect("close should terminate the process")
            .expect("exit sender should not be dropped");
        assert!(!registry.close("no-such-session").await);
    }

    #[tokio::test]
    async fn drain_signals_everything_once_and_refuses_new_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TerminalRegistry::new();

        let (first, first_io) = spawn_test_session(dir.path());
        let (second, second_io) = spawn_test_session(dir.path());
        registry.insert(first.clone()).await.unwrap();
        registry.insert(second.clone()).await.unwrap();

        let drained = registry.drain().await;
        assert_eq!(drained.len(), 2);
        assert_eq!(registry.len().await, 0);
        for io in [first_io, second_io] {
            timeout(Duration::from_secs(5), io.exit_rx)
                .await
                .expect("drained session should be signalled")
                .expect("exit sender should not be dropped");
        }

        // A session already claimed for teardown is not signalled again.
        assert!(!first.begin_close());

        let (late, _io) = spawn_test_session(dir.path());
        let err = registry.insert(late.clone()).await.unwrap_err();
        assert!(matches!(err, GatewayError::ShuttingDown));
        late.terminate();
    }
}
