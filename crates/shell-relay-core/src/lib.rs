//! Core abstractions for terminal session relaying.
//!
//! This crate provides the fundamental building blocks:
//! - `Backend` / `BackendSelector` - Which spawning strategy is authoritative
//! - `ProcessHandle` - A running interactive process, whatever produced it
//! - `OutputSlot` - Single replaceable subscriber for process events
//! - `Spawner` trait and the spawn inputs (`ShellCommand`, `SpawnOptions`)

pub mod backend;
pub mod context;
pub mod handle;
pub mod traits;

pub use backend::{Backend, BackendSelector, Exhausted};
pub use context::{ShellCommand, SpawnOptions, TermSize};
pub use handle::{ExitInfo, OutputSlot, ProcessEvent, ProcessHandle, Subscriber};
pub use traits::{SpawnError, Spawner, SpawnerTable};
