//! Pipe-based strategies: compatibility shell and direct spawn.
//!
//! Both run the process in its own process group with piped stdio. Stdout and
//! stderr are read by separate tasks that feed the same [`OutputSlot`], so
//! each stream keeps its own order but the interleaving between them is
//! whatever the runtime surfaces first.

use std::{
    ffi::OsStr,
    path::PathBuf,
    process::Stdio,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use command_group::AsyncCommandGroup;
use shell_relay_core::{
    Backend, OutputSlot, ProcessHandle, ShellCommand, SpawnError, SpawnOptions, Spawner,
    Subscriber, TermSize,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::Command,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use crate::shell::resolve_executable_path;

const READ_BUF_SIZE: usize = 4096;

/// How long to wait for buffered output after the process exits.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Spawns the command directly as a child process group.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectSpawner;

#[async_trait]
impl Spawner for DirectSpawner {
    fn backend(&self) -> Backend {
        Backend::DirectSpawn
    }

    async fn spawn(
        &self,
        command: &ShellCommand,
        options: &SpawnOptions,
    ) -> Result<Arc<dyn ProcessHandle>, SpawnError> {
        let handle = spawn_piped(
            Backend::DirectSpawn,
            OsStr::new(&command.program),
            &command.args,
            options,
        )?;
        Ok(Arc::new(handle))
    }
}

/// The secondary environment the compatibility shell runs inside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompatWrapper {
    /// `wsl.exe --cd <dir> -e <command…>`.
    Wsl,
    /// `sh -c 'exec <command…>'`.
    PosixSh,
}

impl CompatWrapper {
    /// The wrapper native to this platform.
    #[must_use]
    pub const fn for_host() -> Self {
        if cfg!(windows) { Self::Wsl } else { Self::PosixSh }
    }

    /// Executable that provides the environment.
    #[must_use]
    pub const fn program(&self) -> &'static str {
        match self {
            Self::Wsl => "wsl.exe",
            Self::PosixSh => "sh",
        }
    }

    /// Arguments that run `command` inside the environment.
    ///
    /// # Errors
    /// Returns [`SpawnError::Unavailable`] if the command cannot be quoted
    /// for the wrapper (for example, it contains a NUL byte).
    pub fn wrap_args(
        &self,
        command: &ShellCommand,
        options: &SpawnOptions,
    ) -> Result<Vec<String>, SpawnError> {
        match self {
            Self::Wsl => {
                let mut args = vec![
                    "--cd".to_string(),
                    options.working_dir.to_string_lossy().into_owned(),
                    "-e".to_string(),
                    command.program.clone(),
                ];
                args.extend(command.args.iter().cloned());
                Ok(args)
            }
            Self::PosixSh => {
                let words = std::iter::once(command.program.as_str())
                    .chain(command.args.iter().map(String::as_str));
                let joined = shlex::try_join(words)
                    .map_err(|e| SpawnError::Unavailable(format!("cannot quote command: {e}")))?;
                Ok(vec!["-c".to_string(), format!("exec {joined}")])
            }
        }
    }
}

/// Runs the command inside a secondary shell environment over plain pipes.
#[derive(Debug, Clone)]
pub struct CompatShellSpawner {
    wrapper: CompatWrapper,
}

impl CompatShellSpawner {
    /// Create a spawner for `wrapper`.
    #[must_use]
    pub const fn new(wrapper: CompatWrapper) -> Self {
        Self { wrapper }
    }

    /// Locate the wrapper executable on this host.
    pub async fn locate(&self) -> Option<PathBuf> {
        resolve_executable_path(self.wrapper.program()).await
    }
}

#[async_trait]
impl Spawner for CompatShellSpawner {
    fn backend(&self) -> Backend {
        Backend::CompatShell
    }

    async fn spawn(
        &self,
        command: &ShellCommand,
        options: &SpawnOptions,
    ) -> Result<Arc<dyn ProcessHandle>, SpawnError> {
        let wrapper = self.locate().await.ok_or_else(|| {
            SpawnError::Unavailable(format!("{} not found", self.wrapper.program()))
        })?;
        let args = self.wrapper.wrap_args(command, options)?;
        let handle = spawn_piped(Backend::CompatShell, wrapper.as_os_str(), &args, options)?;
        Ok(Arc::new(handle))
    }
}

fn spawn_piped(
    backend: Backend,
    program: &OsStr,
    args: &[String],
    options: &SpawnOptions,
) -> Result<PipeHandle, SpawnError> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(&options.working_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if !options.has_env("TERM") {
        cmd.env("TERM", "dumb");
    }
    cmd.envs(&options.env);

    let mut child = cmd
        .group_spawn()
        .map_err(|e| SpawnError::from_spawn_io(&program.to_string_lossy(), e))?;
    let pid = child.id();

    let (Some(mut stdin), Some(stdout), Some(stderr)) = (
        child.inner().stdin.take(),
        child.inner().stdout.take(),
        child.inner().stderr.take(),
    ) else {
        let _ = child.start_kill();
        return Err(SpawnError::Unavailable("child stdio was not piped".into()));
    };

    let slot = Arc::new(OutputSlot::new());
    let alive = Arc::new(AtomicBool::new(true));

    let (input_tx, mut input_rx) = mpsc::unbounded_channel::<Bytes>();
    tokio::spawn(async move {
        while let Some(chunk) = input_rx.recv().await {
            if let Err(err) = async {
                stdin.write_all(&chunk).await?;
                stdin.flush().await
            }
            .await
            {
                tracing::debug!(?err, "Process stdin closed");
                break;
            }
        }
    });

    let readers = [
        spawn_reader(stdout, Arc::clone(&slot)),
        spawn_reader(stderr, Arc::clone(&slot)),
    ];

    let (kill_tx, kill_rx) = oneshot::channel::<()>();
    let exit_slot = Arc::clone(&slot);
    let exit_alive = Arc::clone(&alive);
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            // Fires on an explicit kill and when the handle is dropped.
            _ = kill_rx => {
                if let Err(err) = child.start_kill() {
                    tracing::debug!(?err, ?pid, "Process group already gone");
                }
                child.wait().await
            }
        };
        let code = match status {
            Ok(status) => status.code(),
            Err(err) => {
                tracing::warn!(?err, ?pid, "Failed to reap child process");
                None
            }
        };

        for reader in readers {
            if tokio::time::timeout(DRAIN_TIMEOUT, reader).await.is_err() {
                tracing::debug!(?pid, "Output still open after exit; dropping it");
            }
        }

        exit_alive.store(false, Ordering::Release);
        exit_slot.exited(code);
    });

    tracing::debug!(%backend, ?pid, "Spawned piped process");
    Ok(PipeHandle {
        backend,
        pid,
        input: input_tx,
        kill: Mutex::new(Some(kill_tx)),
        slot,
        alive,
    })
}

fn spawn_reader<R>(mut stream: R, slot: Arc<OutputSlot>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    tracing::trace!(bytes = n, "Process output");
                    slot.output(Bytes::copy_from_slice(&buf[..n]));
                }
                Err(err) => {
                    tracing::debug!(?err, "Process output closed");
                    break;
                }
            }
        }
    })
}

/// Handle to a process wired through plain pipes.
pub struct PipeHandle {
    backend: Backend,
    pid: Option<u32>,
    input: mpsc::UnboundedSender<Bytes>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    slot: Arc<OutputSlot>,
    alive: Arc<AtomicBool>,
}

impl ProcessHandle for PipeHandle {
    fn backend(&self) -> Backend {
        self.backend
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn subscribe(&self, subscriber: Subscriber) {
        self.slot.subscribe(subscriber);
    }

    fn write(&self, data: Bytes) {
        let _ = self.input.send(data);
    }

    fn resize(&self, size: TermSize) {
        tracing::debug!(
            backend = %self.backend,
            cols = size.cols,
            rows = size.rows,
            "Resize ignored without a PTY"
        );
    }

    fn kill(&self) {
        let sender = self
            .kill
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}
