//! Spawn inputs: the command to run and the options to run it with.

use std::{collections::HashMap, path::PathBuf};

use serde::{Deserialize, Serialize};

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermSize {
    pub cols: u16,
    pub rows: u16,
}

impl TermSize {
    /// Create a size, clamping zero dimensions to one cell.
    #[must_use]
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            cols: cols.max(1),
            rows: rows.max(1),
        }
    }
}

impl Default for TermSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Program and arguments for an interactive process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ShellCommand {
    /// Create a command with no arguments.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append arguments.
    #[must_use]
    pub fn args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// Options record shared by every spawning strategy.
///
/// Values come from service configuration; the relay treats them as opaque.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnOptions {
    /// Working directory for the process.
    pub working_dir: PathBuf,

    /// Extra environment variables, layered over the inherited environment.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Initial dimensions. Only PTY-backed strategies honor them.
    #[serde(default)]
    pub size: TermSize,
}

impl SpawnOptions {
    /// Create options with just a working directory.
    #[must_use]
    pub fn new(working_dir: PathBuf) -> Self {
        Self {
            working_dir,
            env: HashMap::new(),
            size: TermSize::default(),
        }
    }

    /// Set the initial dimensions.
    #[must_use]
    pub const fn with_size(mut self, size: TermSize) -> Self {
        self.size = size;
        self
    }

    /// Set an environment variable.
    pub fn set_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env.insert(key.into(), value.into());
    }

    /// Whether the caller set `key` explicitly.
    #[must_use]
    pub fn has_env(&self, key: &str) -> bool {
        self.env.contains_key(key)
    }
}
