//! Cross-platform shell detection and executable resolution.

use std::{
    collections::HashSet,
    env::{join_paths, split_paths},
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
};

use shell_relay_core::ShellCommand;

/// The interactive shell to relay when configuration does not name one.
///
/// On Windows, prefers PowerShell if available, falling back to cmd.exe.
/// On Unix, uses `$SHELL`, as a login shell when it supports that.
pub async fn default_shell() -> ShellCommand {
    if cfg!(windows) {
        if let Some(powershell) = resolve_executable_path("powershell.exe").await {
            ShellCommand::new(powershell.to_string_lossy()).args(["-NoLogo"])
        } else {
            ShellCommand::new("cmd.exe")
        }
    } else {
        let shell = UnixShell::current_shell();
        ShellCommand::new(shell.path().to_string_lossy()).args(shell.interactive_args())
    }
}

/// Resolve an executable by name, falling back to a refreshed PATH if needed.
///
/// The search order is:
/// 1. Explicit absolute paths.
/// 2. The current process PATH via `which`.
/// 3. The PATH a login shell would see (Unix only).
pub async fn resolve_executable_path(executable: &str) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }

    let path = Path::new(executable);
    if path.is_absolute() {
        return path.is_file().then(|| path.to_path_buf());
    }

    if let Some(found) = which_async(executable, None).await {
        return Some(found);
    }

    let refreshed = fresh_path().await?;
    let existing = std::env::var_os("PATH").unwrap_or_default();
    let merged = merge_paths(&existing, &refreshed);
    if merged == existing {
        return None;
    }
    tracing::debug!(executable, ?merged, "Retrying lookup with login shell PATH");
    which_async(executable, Some(merged)).await
}

/// Merge two PATH strings into a single, de-duplicated PATH.
#[must_use]
pub fn merge_paths(primary: impl AsRef<OsStr>, secondary: impl AsRef<OsStr>) -> OsString {
    let mut seen = HashSet::<PathBuf>::new();
    let merged: Vec<PathBuf> = split_paths(primary.as_ref())
        .chain(split_paths(secondary.as_ref()))
        .filter(|p| !p.as_os_str().is_empty() && seen.insert(p.clone()))
        .collect();

    join_paths(merged).unwrap_or_default()
}

async fn which_async(executable: &str, search_path: Option<OsString>) -> Option<PathBuf> {
    let executable = executable.to_string();
    tokio::task::spawn_blocking(move || match search_path {
        Some(paths) => {
            let cwd = std::env::current_dir().ok()?;
            which::which_in(executable, Some(paths), cwd).ok()
        }
        None => which::which(executable).ok(),
    })
    .await
    .ok()
    .flatten()
}

/// Unix shell types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnixShell {
    Zsh(PathBuf),
    Bash(PathBuf),
    Sh(PathBuf),
    Other(PathBuf),
}

impl UnixShell {
    /// Get the shell path.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Zsh(p) | Self::Bash(p) | Self::Sh(p) | Self::Other(p) => p,
        }
    }

    /// Whether this shell supports login mode.
    #[must_use]
    pub const fn login(&self) -> bool {
        matches!(self, Self::Zsh(_) | Self::Bash(_))
    }

    /// Arguments for an interactive session.
    #[must_use]
    pub fn interactive_args(&self) -> Vec<&'static str> {
        if self.login() { vec!["-l"] } else { Vec::new() }
    }

    /// Get the rc file for this shell, if it exists.
    #[must_use]
    pub fn config_file(&self) -> Option<PathBuf> {
        let home = dirs::home_dir()?;
        let config_file = match self {
            Self::Zsh(_) => home.join(".zshrc"),
            Self::Bash(_) => home.join(".bashrc"),
            Self::Sh(_) | Self::Other(_) => return None,
        };
        config_file.is_file().then_some(config_file)
    }

    /// Get the current shell from `$SHELL`.
    #[must_use]
    pub fn current_shell() -> Self {
        std::env::var("SHELL")
            .ok()
            .and_then(|shell| Self::from_path(Path::new(&shell)))
            .unwrap_or_else(|| Self::Sh(PathBuf::from("/bin/sh")))
    }

    /// Classify an absolute path to an existing shell binary.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        if !(path.is_absolute() && path.is_file()) {
            return None;
        }
        let path_buf = path.to_path_buf();
        Some(match path.file_name().and_then(OsStr::to_str) {
            Some("zsh") => Self::Zsh(path_buf),
            Some("bash") => Self::Bash(path_buf),
            Some("sh") => Self::Sh(path_buf),
            _ => Self::Other(path_buf),
        })
    }
}

#[cfg(not(windows))]
async fn fresh_path() -> Option<OsString> {
    use std::{process::Stdio, time::Duration};

    use tokio::process::Command;

    const PATH_REFRESH_TIMEOUT: Duration = Duration::from_secs(5);

    let shell = UnixShell::current_shell();
    let mut script = String::new();
    if let Some(rc) = shell.config_file() {
        if let Ok(escaped) = shlex::try_quote(rc.to_string_lossy().as_ref()) {
            script.push_str(&format!(". {escaped}; "));
        }
    }
    script.push_str("printf '%s' \"$PATH\"");

    let mut cmd = Command::new(shell.path());
    if shell.login() {
        cmd.arg("-l");
    }
    cmd.arg("-c")
        .arg(script)
        .env("TERM", "dumb")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let child = cmd.spawn().ok()?;
    let output = match tokio::time::timeout(PATH_REFRESH_TIMEOUT, child.wait_with_output()).await {
        Ok(Ok(output)) if output.status.success() => output,
        Ok(Ok(_)) => return None,
        Ok(Err(err)) => {
            tracing::debug!(shell = %shell.path().display(), ?err, "Failed to read login shell PATH");
            return None;
        }
        Err(_) => {
            tracing::warn!(shell = %shell.path().display(), "Timed out reading login shell PATH");
            return None;
        }
    };

    let path = String::from_utf8(output.stdout).ok()?;
    let path = path.trim();
    (!path.is_empty()).then(|| OsString::from(path))
}

#[cfg(windows)]
async fn fresh_path() -> Option<OsString> {
    None
}
