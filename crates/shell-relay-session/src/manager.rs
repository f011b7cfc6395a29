//! Session manager binding connections to spawned processes.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use serde::Serialize;
use shell_relay_core::{
    Backend, BackendSelector, ProcessEvent, ProcessHandle, ShellCommand, SpawnOptions,
    SpawnerTable, TermSize,
};
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

/// Connection identifier, stable for the connection's lifetime.
pub type ConnectionId = Uuid;

/// Capacity for a connection's outbound channel.
///
/// Output from a connection that falls this far behind is dropped instead of
/// buffered.
pub const OUTBOUND_CAPACITY: usize = 1024;

/// Something a session sends back to its connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Process output, untouched.
    Output(Bytes),
    /// Human-readable diagnostic from the relay itself.
    Notice(String),
}

/// Session manager error.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("No terminal backend could start the shell (tried {attempted:?}): {last_error}")]
    TerminalUnavailable {
        attempted: Vec<Backend>,
        last_error: String,
    },
    #[error("Connection already has a session: {0}")]
    AlreadyBound(ConnectionId),
}

struct Session {
    serial: u64,
    handle: Arc<dyn ProcessHandle>,
    backend: Backend,
    created_at: i64,
}

/// Public view of a live session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub connection_id: ConnectionId,
    pub backend: Backend,
    pub pid: Option<u32>,
    /// Creation timestamp (Unix epoch seconds).
    pub created_at: i64,
}

/// Liveness snapshot for operational monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub backend: Backend,
    pub sessions: usize,
}

type Registry = Arc<Mutex<HashMap<ConnectionId, Session>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<ConnectionId, Session>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Owns every connection's process handle.
///
/// At most one session exists per connection. Teardown is idempotent, so a
/// disconnect racing a process exit leaves the same cleaned-up state.
pub struct SessionManager {
    selector: Arc<BackendSelector>,
    spawners: SpawnerTable,
    sessions: Registry,
    next_serial: AtomicU64,
}

impl SessionManager {
    /// Create a session manager.
    #[must_use]
    pub fn new(selector: Arc<BackendSelector>, spawners: SpawnerTable) -> Self {
        Self {
            selector,
            spawners,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_serial: AtomicU64::new(0),
        }
    }

    /// The shared backend selector.
    #[must_use]
    pub fn selector(&self) -> &BackendSelector {
        &self.selector
    }

    /// Spawn `command` for `connection_id`, demoting through the backends.
    ///
    /// Process output and the final exit notice are sent on `outbound`.
    /// After the exit notice the session is already torn down. Output that
    /// finds `outbound` full is dropped.
    ///
    /// # Errors
    /// Returns [`SessionError::TerminalUnavailable`] when every backend failed
    /// and [`SessionError::AlreadyBound`] if the connection has a session.
    pub async fn spawn_with_fallback(
        &self,
        connection_id: ConnectionId,
        command: &ShellCommand,
        options: &SpawnOptions,
        outbound: mpsc::Sender<Outbound>,
    ) -> Result<Backend, SessionError> {
        if lock(&self.sessions).contains_key(&connection_id) {
            return Err(SessionError::AlreadyBound(connection_id));
        }

        let mut backend = self.selector.current();
        let mut attempted = Vec::with_capacity(Backend::ALL.len());
        let mut last_error = String::new();

        // Each failed attempt moves strictly down the chain.
        for _ in Backend::ALL {
            attempted.push(backend);
            match self.spawners.get(backend).spawn(command, options).await {
                Ok(handle) => {
                    self.register(connection_id, handle, backend, outbound)?;
                    return Ok(backend);
                }
                Err(error) => {
                    tracing::warn!(
                        %connection_id,
                        %backend,
                        %error,
                        program = %command.program,
                        "Spawn failed"
                    );
                    last_error = error.to_string();
                    match self.selector.demote_from(backend) {
                        Ok(next) => backend = next,
                        Err(_) => break,
                    }
                }
            }
        }

        tracing::error!(%connection_id, ?attempted, "All terminal backends exhausted");
        Err(SessionError::TerminalUnavailable {
            attempted,
            last_error,
        })
    }

    fn register(
        &self,
        connection_id: ConnectionId,
        handle: Arc<dyn ProcessHandle>,
        backend: Backend,
        outbound: mpsc::Sender<Outbound>,
    ) -> Result<(), SessionError> {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        {
            let mut sessions = lock(&self.sessions);
            if sessions.contains_key(&connection_id) {
                drop(sessions);
                handle.kill();
                return Err(SessionError::AlreadyBound(connection_id));
            }
            sessions.insert(
                connection_id,
                Session {
                    serial,
                    handle: Arc::clone(&handle),
                    backend,
                    created_at: now(),
                },
            );
        }

        tracing::info!(%connection_id, %backend, pid = ?handle.pid(), "Session started");

        // Subscribe outside the registry lock: the subscriber takes it on exit.
        let registry = Arc::clone(&self.sessions);
        let mut lagging = false;
        handle.subscribe(Box::new(move |event| match event {
            ProcessEvent::Output(chunk) => {
                tracing::trace!(%connection_id, bytes = chunk.len(), "Relaying output");
                match outbound.try_send(Outbound::Output(chunk)) {
                    Ok(()) => lagging = false,
                    Err(TrySendError::Full(_)) => {
                        if !lagging {
                            tracing::warn!(%connection_id, "Connection is behind; dropping output");
                        }
                        lagging = true;
                    }
                    Err(TrySendError::Closed(_)) => {}
                }
            }
            ProcessEvent::Exited(info) => {
                let removed = {
                    let mut sessions = lock(&registry);
                    match sessions.get(&connection_id) {
                        Some(session) if session.serial == serial => {
                            sessions.remove(&connection_id)
                        }
                        _ => None,
                    }
                };
                if let Some(session) = removed {
                    tracing::info!(%connection_id, backend = %session.backend, %info, "Process exited");
                    let notice = Outbound::Notice(format!("\r\n[{info}]\r\n"));
                    if outbound.try_send(notice).is_err() {
                        tracing::debug!(%connection_id, "Exit notice not delivered");
                    }
                    session.handle.kill();
                }
            }
        }));
        Ok(())
    }

    /// Forward input to the connection's process. No-op without a session.
    ///
    /// Returns whether a session received the bytes.
    pub fn input(&self, connection_id: ConnectionId, data: Bytes) -> bool {
        let Some(handle) = self.handle(connection_id) else {
            tracing::trace!(%connection_id, "Input without a session dropped");
            return false;
        };
        handle.write(data);
        true
    }

    /// Resize the connection's terminal. No-op without a session.
    pub fn resize(&self, connection_id: ConnectionId, size: TermSize) {
        if let Some(handle) = self.handle(connection_id) {
            handle.resize(size);
        }
    }

    /// Remove the connection's session and kill its process.
    ///
    /// Safe to call repeatedly or for unknown connections. Returns whether
    /// this call did the teardown.
    pub fn teardown(&self, connection_id: ConnectionId) -> bool {
        let removed = lock(&self.sessions).remove(&connection_id);
        match removed {
            Some(session) => {
                session.handle.kill();
                tracing::info!(%connection_id, backend = %session.backend, "Session torn down");
                true
            }
            None => false,
        }
    }

    /// Tear down every session.
    pub fn shutdown(&self) {
        let drained: Vec<(ConnectionId, Session)> = lock(&self.sessions).drain().collect();
        if !drained.is_empty() {
            tracing::info!(sessions = drained.len(), "Shutting down sessions");
        }
        for (_, session) in drained {
            session.handle.kill();
        }
    }

    /// Whether the connection has a live session.
    #[must_use]
    pub fn contains(&self, connection_id: ConnectionId) -> bool {
        lock(&self.sessions).contains_key(&connection_id)
    }

    /// List live sessions.
    #[must_use]
    pub fn sessions(&self) -> Vec<SessionInfo> {
        lock(&self.sessions)
            .iter()
            .map(|(id, s)| SessionInfo {
                connection_id: *id,
                backend: s.backend,
                pid: s.handle.pid(),
                created_at: s.created_at,
            })
            .collect()
    }

    /// Liveness and the active backend.
    #[must_use]
    pub fn health(&self) -> Health {
        Health {
            status: "ok",
            backend: self.selector.current(),
            sessions: lock(&self.sessions).len(),
        }
    }

    fn handle(&self, connection_id: ConnectionId) -> Option<Arc<dyn ProcessHandle>> {
        lock(&self.sessions)
            .get(&connection_id)
            .map(|s| Arc::clone(&s.handle))
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    use async_trait::async_trait;
    use shell_relay_core::{ExitInfo, OutputSlot, SpawnError, Spawner, Subscriber};

    use super::*;

    #[derive(Default)]
    struct FakeHandle {
        backend: Option<Backend>,
        slot: OutputSlot,
        written: Mutex<Vec<u8>>,
        kills: AtomicUsize,
        dead: AtomicBool,
    }

    impl FakeHandle {
        fn emit(&self, chunk: &'static [u8]) {
            self.slot.output(chunk);
        }

        fn exit(&self, code: i32) {
            self.dead.store(true, Ordering::SeqCst);
            self.slot.exited(Some(code));
        }
    }

    impl ProcessHandle for FakeHandle {
        fn backend(&self) -> Backend {
            self.backend.unwrap_or(Backend::DirectSpawn)
        }

        fn pid(&self) -> Option<u32> {
            Some(42)
        }

        fn subscribe(&self, subscriber: Subscriber) {
            self.slot.subscribe(subscriber);
        }

        fn write(&self, data: Bytes) {
            if !self.dead.load(Ordering::SeqCst) {
                self.written.lock().unwrap().extend_from_slice(&data);
            }
        }

        fn resize(&self, _size: TermSize) {}

        fn kill(&self) {
            self.kills.fetch_add(1, Ordering::SeqCst);
            if !self.dead.swap(true, Ordering::SeqCst) {
                self.slot.exited(None);
            }
        }

        fn is_alive(&self) -> bool {
            !self.dead.load(Ordering::SeqCst)
        }
    }

    struct FakeSpawner {
        backend: Backend,
        fails: bool,
        attempts: AtomicUsize,
        spawned: Mutex<Vec<Arc<FakeHandle>>>,
    }

    impl FakeSpawner {
        fn new(backend: Backend, fails: bool) -> Arc<Self> {
            Arc::new(Self {
                backend,
                fails,
                attempts: AtomicUsize::new(0),
                spawned: Mutex::new(Vec::new()),
            })
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }

        fn last(&self) -> Arc<FakeHandle> {
            Arc::clone(self.spawned.lock().unwrap().last().unwrap())
        }
    }

    #[async_trait]
    impl Spawner for FakeSpawner {
        fn backend(&self) -> Backend {
            self.backend
        }

        async fn spawn(
            &self,
            _command: &ShellCommand,
            _options: &SpawnOptions,
        ) -> Result<Arc<dyn ProcessHandle>, SpawnError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fails {
                return Err(SpawnError::Unavailable(format!("{} disabled", self.backend)));
            }
            let handle = Arc::new(FakeHandle {
                backend: Some(self.backend),
                ..FakeHandle::default()
            });
            self.spawned.lock().unwrap().push(Arc::clone(&handle));
            Ok(handle)
        }
    }

    struct Fixture {
        manager: SessionManager,
        native: Arc<FakeSpawner>,
        compat: Arc<FakeSpawner>,
        direct: Arc<FakeSpawner>,
    }

    fn fixture(selector: BackendSelector, fails: [bool; 3]) -> Fixture {
        let native = FakeSpawner::new(Backend::NativePty, fails[0]);
        let compat = FakeSpawner::new(Backend::CompatShell, fails[1]);
        let direct = FakeSpawner::new(Backend::DirectSpawn, fails[2]);
        let table = SpawnerTable::new(native.clone(), compat.clone(), direct.clone());
        Fixture {
            manager: SessionManager::new(Arc::new(selector), table),
            native,
            compat,
            direct,
        }
    }

    fn shell() -> (ShellCommand, SpawnOptions) {
        (
            ShellCommand::new("bash"),
            SpawnOptions::new(std::env::temp_dir()),
        )
    }

    #[tokio::test]
    async fn failed_probe_starts_on_compat_shell() {
        let selector = BackendSelector::new();
        selector.probe(|| Err("no pty device"));
        let f = fixture(selector, [false, false, false]);
        let (cmd, opts) = shell();
        let (tx, _rx) = mpsc::channel(OUTBOUND_CAPACITY);

        let backend = f
            .manager
            .spawn_with_fallback(Uuid::new_v4(), &cmd, &opts, tx)
            .await
            .unwrap();

        assert_eq!(backend, Backend::CompatShell);
        assert_eq!(f.native.attempts(), 0);
        assert_eq!(f.compat.attempts(), 1);
    }

    #[tokio::test]
    async fn native_failure_demotes_for_later_connections() {
        let f = fixture(BackendSelector::new(), [true, false, false]);
        let (cmd, opts) = shell();
        let (c1, c2) = (Uuid::new_v4(), Uuid::new_v4());

        let (tx, _rx1) = mpsc::channel(OUTBOUND_CAPACITY);
        let backend = f.manager.spawn_with_fallback(c1, &cmd, &opts, tx).await.unwrap();
        assert_eq!(backend, Backend::CompatShell);
        assert_eq!(f.manager.selector().current(), Backend::CompatShell);

        let (tx, _rx2) = mpsc::channel(OUTBOUND_CAPACITY);
        let backend = f.manager.spawn_with_fallback(c2, &cmd, &opts, tx).await.unwrap();
        assert_eq!(backend, Backend::CompatShell);
        assert_eq!(f.native.attempts(), 1);
        assert_eq!(f.manager.sessions().len(), 2);
    }

    #[tokio::test]
    async fn all_backends_failing_is_terminal_unavailable() {
        let f = fixture(BackendSelector::new(), [true, true, true]);
        let (cmd, opts) = shell();
        let c3 = Uuid::new_v4();
        let (tx, _rx) = mpsc::channel(OUTBOUND_CAPACITY);

        let err = tokio_test::assert_err!(f.manager.spawn_with_fallback(c3, &cmd, &opts, tx).await);
        match err {
            SessionError::TerminalUnavailable { attempted, .. } => {
                assert_eq!(attempted, Backend::ALL.to_vec());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!f.manager.contains(c3));
        assert_eq!(
            (f.native.attempts(), f.compat.attempts(), f.direct.attempts()),
            (1, 1, 1)
        );
    }

    #[tokio::test]
    async fn input_is_written_verbatim_and_in_order() {
        let f = fixture(BackendSelector::new(), [false, false, false]);
        let (cmd, opts) = shell();
        let c4 = Uuid::new_v4();
        let (tx, _rx) = mpsc::channel(OUTBOUND_CAPACITY);
        f.manager.spawn_with_fallback(c4, &cmd, &opts, tx).await.unwrap();

        assert!(f.manager.input(c4, Bytes::from_static(b"ls\n")));
        assert!(f.manager.input(c4, Bytes::from_static("é\r\x03".as_bytes())));

        let written = f.native.last().written.lock().unwrap().clone();
        assert_eq!(written, "ls\né\r\x03".as_bytes());
    }

    #[tokio::test]
    async fn spontaneous_exit_sends_one_notice_then_removes() {
        let f = fixture(BackendSelector::new(), [false, false, false]);
        let (cmd, opts) = shell();
        let c5 = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(OUTBOUND_CAPACITY);
        f.manager.spawn_with_fallback(c5, &cmd, &opts, tx).await.unwrap();

        let handle = f.native.last();
        handle.emit(b"bye\r\n");
        handle.exit(0);
        assert!(!f.manager.teardown(c5));

        assert_eq!(rx.recv().await, Some(Outbound::Output(Bytes::from_static(b"bye\r\n"))));
        assert_eq!(
            rx.recv().await,
            Some(Outbound::Notice(format!("\r\n[{}]\r\n", ExitInfo { code: Some(0) })))
        );
        assert!(rx.try_recv().is_err());
        assert!(!f.manager.contains(c5));
    }

    #[tokio::test]
    async fn output_before_subscription_is_not_lost() {
        let f = fixture(BackendSelector::new(), [false, false, false]);
        let (cmd, opts) = shell();
        let id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(OUTBOUND_CAPACITY);
        f.manager.spawn_with_fallback(id, &cmd, &opts, tx).await.unwrap();

        for chunk in [&b"a"[..], b"b", b"c"] {
            f.native.last().emit(chunk);
        }
        for expected in ["a", "b", "c"] {
            assert_eq!(rx.recv().await, Some(Outbound::Output(Bytes::from(expected))));
        }
    }

    #[tokio::test]
    async fn disconnect_and_exit_tear_down_once() {
        let f = fixture(BackendSelector::new(), [false, false, false]);
        let (cmd, opts) = shell();
        let id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(OUTBOUND_CAPACITY);
        f.manager.spawn_with_fallback(id, &cmd, &opts, tx).await.unwrap();
        let handle = f.native.last();

        assert!(f.manager.teardown(id));
        assert!(!f.manager.teardown(id));
        handle.exit(1);

        assert_eq!(handle.kills.load(Ordering::SeqCst), 1);
        // Torn down by disconnect: nobody is left to notify.
        assert!(rx.try_recv().is_err());
        assert!(!f.manager.input(id, Bytes::from_static(b"ls\n")));
        assert!(!f.manager.teardown(Uuid::new_v4()));
    }

    #[tokio::test]
    async fn second_spawn_for_same_connection_is_rejected() {
        let f = fixture(BackendSelector::new(), [false, false, false]);
        let (cmd, opts) = shell();
        let id = Uuid::new_v4();
        let (tx, _rx) = mpsc::channel(OUTBOUND_CAPACITY);
        f.manager.spawn_with_fallback(id, &cmd, &opts, tx.clone()).await.unwrap();

        let err = f.manager.spawn_with_fallback(id, &cmd, &opts, tx).await.unwrap_err();
        assert!(matches!(err, SessionError::AlreadyBound(c) if c == id));
        assert_eq!(f.native.attempts(), 1);
    }

    #[tokio::test]
    async fn full_outbound_drops_output_without_blocking() {
        let f = fixture(BackendSelector::new(), [false, false, false]);
        let (cmd, opts) = shell();
        let id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(2);
        f.manager.spawn_with_fallback(id, &cmd, &opts, tx).await.unwrap();

        let handle = f.native.last();
        for chunk in [&b"a"[..], b"b", b"c", b"d"] {
            handle.emit(chunk);
        }
        handle.exit(0);

        assert_eq!(rx.recv().await, Some(Outbound::Output(Bytes::from("a"))));
        assert_eq!(rx.recv().await, Some(Outbound::Output(Bytes::from("b"))));
        assert!(rx.try_recv().is_err());
        // Exit still tears the session down even though the notice was lost.
        assert!(!f.manager.contains(id));
    }

    #[tokio::test]
    async fn health_reports_backend_and_count() {
        let f = fixture(BackendSelector::starting_at(Backend::DirectSpawn), [false, false, false]);
        let (cmd, opts) = shell();
        let (tx, _rx) = mpsc::channel(OUTBOUND_CAPACITY);
        f.manager
            .spawn_with_fallback(Uuid::new_v4(), &cmd, &opts, tx)
            .await
            .unwrap();

        let json = serde_json::to_value(f.manager.health()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "status": "ok", "backend": "direct-spawn", "sessions": 1 })
        );

        f.manager.shutdown();
        assert_eq!(f.manager.health().sessions, 0);
        assert_eq!(f.direct.last().kills.load(Ordering::SeqCst), 1);
    }
}
