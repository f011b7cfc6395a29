//! Server configuration from environment variables.

use std::{net::SocketAddr, path::PathBuf};

use anyhow::{Context, Result, bail};
use shell_relay_core::{ShellCommand, SpawnOptions, TermSize};
use shell_relay_pty::default_shell;

const DEFAULT_BIND: &str = "127.0.0.1:3000";

/// Everything the relay needs that comes from outside the core.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (`RELAY_BIND`).
    pub bind: SocketAddr,
    /// Shell spawned per connection (`RELAY_SHELL`, `RELAY_SHELL_ARGS`).
    pub shell: ShellCommand,
    /// Working directory and initial size (`RELAY_CWD`, `RELAY_COLS`, `RELAY_ROWS`).
    pub options: SpawnOptions,
    /// Header carrying an upstream-validated identity (`RELAY_IDENTITY_HEADER`).
    pub identity_header: Option<String>,
}

impl RelayConfig {
    /// Load from the process environment.
    ///
    /// # Errors
    /// Returns error if any variable is set to an invalid value.
    pub async fn from_env() -> Result<Self> {
        Self::load(|key| std::env::var(key).ok().filter(|v| !v.trim().is_empty())).await
    }

    async fn load(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let bind = lookup("RELAY_BIND")
            .as_deref()
            .unwrap_or(DEFAULT_BIND)
            .parse::<SocketAddr>()
            .context("RELAY_BIND is not a socket address")?;

        let mut shell = match lookup("RELAY_SHELL") {
            Some(program) => ShellCommand::new(program),
            None => default_shell().await,
        };
        if let Some(args) = lookup("RELAY_SHELL_ARGS") {
            shell.args = shlex::split(&args).context("RELAY_SHELL_ARGS has unbalanced quotes")?;
        }

        let working_dir = match lookup("RELAY_CWD") {
            Some(dir) => PathBuf::from(dir),
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        };
        if !working_dir.is_dir() {
            bail!("RELAY_CWD is not a directory: {}", working_dir.display());
        }

        let size = TermSize::default();
        let cols = parse_dimension(&lookup, "RELAY_COLS", size.cols)?;
        let rows = parse_dimension(&lookup, "RELAY_ROWS", size.rows)?;

        Ok(Self {
            bind,
            shell,
            options: SpawnOptions::new(working_dir).with_size(TermSize::new(cols, rows)),
            identity_header: lookup("RELAY_IDENTITY_HEADER"),
        })
    }
}

fn parse_dimension(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u16) -> Result<u16> {
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    match raw.trim().parse::<u16>() {
        Ok(0) | Err(_) => bail!("{key} must be a positive integer, got {raw:?}"),
        Ok(value) => Ok(value),
    }
}
