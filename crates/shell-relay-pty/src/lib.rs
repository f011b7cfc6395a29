//! Process-spawning strategies for the terminal relay.
//!
//! Provides:
//! - `NativePtySpawner` - Real pseudo-terminal via `portable-pty`
//! - `CompatShellSpawner` - Command wrapped in a secondary POSIX environment, plain pipes
//! - `DirectSpawner` - Plain child process group, plain pipes
//! - Shell detection and executable resolution for Unix and Windows

pub mod native;
pub mod pipe;
pub mod shell;

use std::sync::Arc;

use shell_relay_core::SpawnerTable;

pub use native::{NativePtySpawner, probe_native};
pub use pipe::{CompatShellSpawner, CompatWrapper, DirectSpawner};
pub use shell::{default_shell, resolve_executable_path};

/// The strategy table for this host.
#[must_use]
pub fn host_spawners() -> SpawnerTable {
    SpawnerTable::new(
        Arc::new(NativePtySpawner),
        Arc::new(CompatShellSpawner::new(CompatWrapper::for_host())),
        Arc::new(DirectSpawner),
    )
}
