//! Backend strategy identifiers and the process-wide selector.

use std::{
    fmt,
    sync::atomic::{AtomicBool, AtomicU8, Ordering},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A process-spawning strategy, ordered from highest to lowest fidelity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Backend {
    /// Real pseudo-terminal: resizing, job control, line editing.
    #[serde(rename = "native-pty")]
    NativePty = 0,
    /// Command wrapped in a secondary POSIX environment, plain pipes.
    #[serde(rename = "compatibility-shell")]
    CompatShell = 1,
    /// Plain child process with pipes. Always available if the binary exists.
    #[serde(rename = "direct-spawn")]
    DirectSpawn = 2,
}

impl Backend {
    /// All strategies in demotion order.
    pub const ALL: [Self; 3] = [Self::NativePty, Self::CompatShell, Self::DirectSpawn];

    /// The strategy after this one, or `None` at the end of the chain.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::NativePty => Some(Self::CompatShell),
            Self::CompatShell => Some(Self::DirectSpawn),
            Self::DirectSpawn => None,
        }
    }

    /// Stable name used in logs and the health probe.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NativePty => "native-pty",
            Self::CompatShell => "compatibility-shell",
            Self::DirectSpawn => "direct-spawn",
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::NativePty,
            1 => Self::CompatShell,
            _ => Self::DirectSpawn,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// No strategy remains below the one that just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("all backend strategies exhausted")]
pub struct Exhausted;

/// Tracks which strategy is authoritative for new spawns.
///
/// The state only ever moves down the chain. Reads and demotions are
/// lock-free so the selector can be shared by every connection task.
#[derive(Debug)]
pub struct BackendSelector {
    current: AtomicU8,
    probed: AtomicBool,
}

impl Default for BackendSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendSelector {
    /// Start at the highest-fidelity strategy.
    #[must_use]
    pub const fn new() -> Self {
        Self::starting_at(Backend::NativePty)
    }

    /// Start at an arbitrary strategy.
    #[must_use]
    pub const fn starting_at(backend: Backend) -> Self {
        Self {
            current: AtomicU8::new(backend as u8),
            probed: AtomicBool::new(false),
        }
    }

    /// Run the native capability probe once.
    ///
    /// A failed probe demotes straight to the compatibility shell. Later
    /// calls do not re-run the probe and just return the current strategy.
    pub fn probe<E, F>(&self, probe: F) -> Backend
    where
        E: fmt::Display,
        F: FnOnce() -> Result<(), E>,
    {
        if self.probed.swap(true, Ordering::AcqRel) {
            return self.current();
        }

        match probe() {
            Ok(()) => {
                tracing::info!(backend = %self.current(), "Native PTY capability available");
            }
            Err(error) => {
                tracing::warn!(%error, "Native PTY capability unavailable");
                // Cannot be exhausted: NativePty always has a successor.
                let _ = self.demote_from(Backend::NativePty);
            }
        }
        self.current()
    }

    /// The active strategy.
    #[must_use]
    pub fn current(&self) -> Backend {
        Backend::from_u8(self.current.load(Ordering::Acquire))
    }

    /// Advance from whatever strategy is current.
    ///
    /// # Errors
    /// Returns [`Exhausted`] when already at the last strategy.
    pub fn demote(&self) -> Result<Backend, Exhausted> {
        self.demote_from(self.current())
    }

    /// Advance past `failed`.
    ///
    /// If another caller already moved below `failed`, nothing changes and
    /// the newer strategy is returned.
    ///
    /// # Errors
    /// Returns [`Exhausted`] when `failed` is the last strategy.
    pub fn demote_from(&self, failed: Backend) -> Result<Backend, Exhausted> {
        let next = failed.next().ok_or(Exhausted)?;
        match self.current.compare_exchange(
            failed as u8,
            next as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                tracing::warn!(from = %failed, to = %next, "Demoted backend strategy");
                Ok(next)
            }
            Err(observed) => Ok(Backend::from_u8(observed).max(next)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demote_visits_chain_in_order_then_exhausts_once() {
        let selector = BackendSelector::new();
        assert_eq!(selector.current(), Backend::NativePty);

        let mut visited = vec![selector.current()];
        let mut exhausted = 0;
        for _ in 0..3 {
            match selector.demote() {
                Ok(next) => visited.push(next),
                Err(Exhausted) => exhausted += 1,
            }
        }

        assert_eq!(visited, Backend::ALL.to_vec());
        assert_eq!(exhausted, 1);
        assert_eq!(selector.current(), Backend::DirectSpawn);
    }

    #[test]
    fn failed_probe_skips_native() {
        let selector = BackendSelector::new();
        let backend = selector.probe(|| Err("no pty"));
        assert_eq!(backend, Backend::CompatShell);
    }

    #[test]
    fn probe_runs_once() {
        let selector = BackendSelector::new();
        assert_eq!(selector.probe(|| Ok::<_, String>(())), Backend::NativePty);
        assert_eq!(selector.probe(|| Err("late failure")), Backend::NativePty);
    }

    #[test]
    fn stale_demotion_never_promotes() {
        let selector = BackendSelector::new();
        assert_eq!(selector.demote_from(Backend::NativePty), Ok(Backend::CompatShell));
        assert_eq!(selector.demote_from(Backend::CompatShell), Ok(Backend::DirectSpawn));

        // A second session that also saw native-pty fail reports the newer state.
        assert_eq!(selector.demote_from(Backend::NativePty), Ok(Backend::DirectSpawn));
        assert_eq!(selector.current(), Backend::DirectSpawn);
    }

    #[test]
    fn concurrent_demotions_stay_monotonic() {
        let selector = std::sync::Arc::new(BackendSelector::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let selector = std::sync::Arc::clone(&selector);
                std::thread::spawn(move || selector.demote_from(Backend::NativePty))
            })
            .collect();

        for t in threads {
            assert_eq!(t.join().unwrap(), Ok(Backend::CompatShell));
        }
        assert_eq!(selector.current(), Backend::CompatShell);
    }

    #[test]
    fn backend_names_match_display() {
        let json = serde_json::to_string(&Backend::CompatShell).unwrap();
        assert_eq!(json, "\"compatibility-shell\"");
        assert_eq!(Backend::CompatShell.to_string(), "compatibility-shell");
    }
}
