//! Native pseudo-terminal strategy backed by `portable-pty`.

use std::{
    io::{Read, Write},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use shell_relay_core::{
    Backend, OutputSlot, ProcessHandle, ShellCommand, SpawnError, SpawnOptions, Spawner,
    Subscriber, TermSize,
};
use tokio::sync::mpsc;

const READ_BUF_SIZE: usize = 4096;

/// How long a hung-up process gets to exit before its group is killed.
#[cfg(unix)]
const KILL_GRACE: std::time::Duration = std::time::Duration::from_millis(250);

const fn pty_size(size: TermSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn pty_error(err: impl std::fmt::Display) -> SpawnError {
    SpawnError::Pty(err.to_string())
}

/// Check that this host can allocate a pseudo-terminal.
///
/// Opens a 1x1 pair and closes it again.
///
/// # Errors
/// Returns [`SpawnError::Pty`] when allocation fails.
pub fn probe_native() -> Result<(), SpawnError> {
    let pair = native_pty_system()
        .openpty(pty_size(TermSize::new(1, 1)))
        .map_err(pty_error)?;
    drop(pair);
    Ok(())
}

/// Spawns processes attached to a real pseudo-terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativePtySpawner;

#[async_trait]
impl Spawner for NativePtySpawner {
    fn backend(&self) -> Backend {
        Backend::NativePty
    }

    async fn spawn(
        &self,
        command: &ShellCommand,
        options: &SpawnOptions,
    ) -> Result<Arc<dyn ProcessHandle>, SpawnError> {
        let command = command.clone();
        let options = options.clone();
        let handle = tokio::task::spawn_blocking(move || open_and_spawn(&command, &options))
            .await
            .map_err(pty_error)??;
        Ok(Arc::new(handle))
    }
}

fn open_and_spawn(
    command: &ShellCommand,
    options: &SpawnOptions,
) -> Result<NativePtyHandle, SpawnError> {
    let pair = native_pty_system()
        .openpty(pty_size(options.size))
        .map_err(pty_error)?;

    let path = options
        .env
        .get("PATH")
        .map(std::ffi::OsString::from)
        .or_else(|| std::env::var_os("PATH"));
    // portable-pty reports a missing program as an opaque error.
    if which::which_in(&command.program, path, &options.working_dir).is_err() {
        return Err(SpawnError::NotFound(command.program.clone()));
    }

    let mut cmd = CommandBuilder::new(&command.program);
    cmd.args(&command.args);
    cmd.cwd(&options.working_dir);
    if !options.has_env("TERM") {
        cmd.env("TERM", "xterm-256color");
    }
    for (key, value) in &options.env {
        cmd.env(key, value);
    }

    let mut child = pair.slave.spawn_command(cmd).map_err(|err| {
        match err.downcast_ref::<std::io::Error>() {
            Some(io) => SpawnError::from_spawn_io(
                &command.program,
                std::io::Error::new(io.kind(), io.to_string()),
            ),
            None => pty_error(err),
        }
    })?;

    // Only the master side is needed; holding the slave would keep reads from
    // ever seeing EOF.
    drop(pair.slave);

    let mut reader = pair.master.try_clone_reader().map_err(pty_error)?;
    let mut writer = pair.master.take_writer().map_err(pty_error)?;
    let killer = child.clone_killer();
    let pid = child.process_id();

    let slot = Arc::new(OutputSlot::new());
    let alive = Arc::new(AtomicBool::new(true));

    let (input_tx, mut input_rx) = mpsc::unbounded_channel::<Bytes>();
    std::thread::Builder::new()
        .name("pty-writer".into())
        .spawn(move || {
            while let Some(chunk) = input_rx.blocking_recv() {
                if let Err(err) = writer.write_all(&chunk).and_then(|()| writer.flush()) {
                    tracing::debug!(?err, "PTY input closed");
                    break;
                }
            }
        })?;

    let reader_slot = Arc::clone(&slot);
    let reader_alive = Arc::clone(&alive);
    std::thread::Builder::new()
        .name("pty-reader".into())
        .spawn(move || {
            let mut buf = [0u8; READ_BUF_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        tracing::trace!(bytes = n, "PTY output");
                        reader_slot.output(Bytes::copy_from_slice(&buf[..n]));
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                    // EIO once the child side closes on Linux.
                    Err(err) => {
                        tracing::debug!(?err, "PTY output closed");
                        break;
                    }
                }
            }
            let code = match child.wait() {
                Ok(status) => i32::try_from(status.exit_code()).ok(),
                Err(err) => {
                    tracing::warn!(?err, "Failed to reap PTY child");
                    None
                }
            };
            reader_alive.store(false, Ordering::Release);
            reader_slot.exited(code);
        })?;

    Ok(NativePtyHandle {
        master: Mutex::new(pair.master),
        killer: Mutex::new(killer),
        input: input_tx,
        slot,
        alive,
        kill_sent: AtomicBool::new(false),
        pid,
    })
}

/// Handle to a process running on a native PTY.
pub struct NativePtyHandle {
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    input: mpsc::UnboundedSender<Bytes>,
    slot: Arc<OutputSlot>,
    alive: Arc<AtomicBool>,
    kill_sent: AtomicBool,
    pid: Option<u32>,
}

impl ProcessHandle for NativePtyHandle {
    fn backend(&self) -> Backend {
        Backend::NativePty
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn subscribe(&self, subscriber: Subscriber) {
        self.slot.subscribe(subscriber);
    }

    fn write(&self, data: Bytes) {
        // The writer thread is gone after exit; dropping the chunk is fine.
        let _ = self.input.send(data);
    }

    fn resize(&self, size: TermSize) {
        let master = self.master.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = master.resize(pty_size(size)) {
            tracing::warn!(?err, cols = size.cols, rows = size.rows, "PTY resize failed");
        }
    }

    fn kill(&self) {
        if !self.is_alive() || self.kill_sent.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut killer = self.killer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = killer.kill() {
            tracing::debug!(?err, pid = ?self.pid, "PTY child already gone");
        }
        // The killer only hangs up on Unix; anything ignoring SIGHUP needs more.
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            escalate_kill(pid, Arc::clone(&self.alive));
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

/// Kill the child's whole process group unless it exits within [`KILL_GRACE`].
///
/// The PTY child leads its own session, so its pid is also its group id.
#[cfg(unix)]
fn escalate_kill(pid: u32, alive: Arc<AtomicBool>) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    let spawned = std::thread::Builder::new()
        .name("pty-kill".into())
        .spawn(move || {
            let step = std::time::Duration::from_millis(25);
            let mut waited = std::time::Duration::ZERO;
            while waited < KILL_GRACE {
                if !alive.load(Ordering::Acquire) {
                    return;
                }
                std::thread::sleep(step);
                waited += step;
            }
            if alive.load(Ordering::Acquire) {
                tracing::debug!(pid, "PTY child survived SIGHUP; sending SIGKILL");
                signal_group(pgid, libc::SIGKILL);
            }
        });
    if let Err(err) = spawned {
        tracing::warn!(?err, pid, "No thread for kill escalation; killing now");
        signal_group(pgid, libc::SIGKILL);
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn signal_group(pgid: libc::pid_t, signal: libc::c_int) {
    // SAFETY: kill(2) takes no pointers. A negative pid addresses the group.
    if unsafe { libc::kill(-pgid, signal) } != 0 {
        let err = std::io::Error::last_os_error();
        tracing::debug!(?err, pgid, signal, "Signal not delivered");
    }
}

impl Drop for NativePtyHandle {
    fn drop(&mut self) {
        self.kill();
    }
}
