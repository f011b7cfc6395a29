//! The spawn contract every backend strategy implements.

use std::{io, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;

use crate::{Backend, ProcessHandle, ShellCommand, SpawnOptions};

/// A strategy failed to produce a process handle.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("Executable not found: {0}")]
    NotFound(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Backend unavailable on this host: {0}")]
    Unavailable(String),
    #[error("PTY error: {0}")]
    Pty(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SpawnError {
    /// Classify an I/O error from spawning `program`.
    #[must_use]
    pub fn from_spawn_io(program: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(program.to_string()),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(program.to_string()),
            _ => Self::Io(err),
        }
    }
}

/// Produces process handles using one backend strategy.
#[async_trait]
pub trait Spawner: Send + Sync {
    /// Which strategy this is.
    fn backend(&self) -> Backend;

    /// Start `command` with `options`.
    async fn spawn(
        &self,
        command: &ShellCommand,
        options: &SpawnOptions,
    ) -> Result<Arc<dyn ProcessHandle>, SpawnError>;
}

/// One spawner per strategy, indexed by [`Backend`].
#[derive(Clone)]
pub struct SpawnerTable {
    spawners: [Arc<dyn Spawner>; 3],
}

impl SpawnerTable {
    /// Build the table from one spawner per strategy.
    #[must_use]
    pub fn new(
        native: Arc<dyn Spawner>,
        compat: Arc<dyn Spawner>,
        direct: Arc<dyn Spawner>,
    ) -> Self {
        Self {
            spawners: [native, compat, direct],
        }
    }

    /// The spawner for `backend`.
    #[must_use]
    pub fn get(&self, backend: Backend) -> &Arc<dyn Spawner> {
        &self.spawners[backend as usize]
    }
}

impl std::fmt::Debug for SpawnerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.spawners.iter().map(|s| s.backend()))
            .finish()
    }
}
