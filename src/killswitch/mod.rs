//! Kill switch: a filesystem-visible emergency stop (SPEC_FULL.md §4.7).

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::error::{ApexError, Result};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Sentinel {
    timestamp: chrono::DateTime<Utc>,
    reason: String,
}

/// Polls a sentinel file at `path`; its presence means the kill switch is active.
pub struct KillSwitch {
    path: PathBuf,
}

impl KillSwitch {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_active(&self) -> bool {
        self.path.exists()
    }

    /// Creates the sentinel file, activating the kill switch.
    #[instrument(skip(self))]
    pub fn activate(&self, reason: &str) -> Result<()> {
        let body = Sentinel {
            timestamp: Utc::now(),
            reason: reason.to_string(),
        };
        let json = serde_json::to_string_pretty(&body).map_err(|e| ApexError::KillSwitchIo {
            reason: e.to_string(),
        })?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ApexError::KillSwitchIo {
                reason: e.to_string(),
            })?;
        }
        std::fs::write(&self.path, json).map_err(|e| ApexError::KillSwitchIo {
            reason: e.to_string(),
        })?;
        warn!(reason, "kill switch activated");
        Ok(())
    }

    /// Removes the sentinel file. A no-op if it is already absent.
    #[instrument(skip(self))]
    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path).map_err(|e| ApexError::KillSwitchIo {
                reason: e.to_string(),
            })?;
            info!("kill switch cleared");
        }
        Ok(())
    }

    /// Returns a `CancellationToken` that fires once the sentinel file appears, polled
    /// roughly once a second, plus a background task handle driving the poll loop.
    pub fn watch(&self) -> (CancellationToken, tokio::task::JoinHandle<()>) {
        let token = CancellationToken::new();
        let watcher_token = token.clone();
        let path = self.path.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(POLL_INTERVAL);
            loop {
                tokio::select! {
                    _ = watcher_token.cancelled() => break,
                    _ = interval.tick() => {
                        if path.exists() {
                            warn!(path = %path.display(), "kill switch detected, cancelling run");
                            watcher_token.cancel();
                            break;
                        }
                    }
                }
            }
        });

        (token, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inactive_when_file_absent() {
        let dir = tempfile::tempdir().unwrap();
        let switch = KillSwitch::new(dir.path().join("KILL"));
        assert!(!switch.is_active());
    }

    #[test]
    fn activate_then_clear_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let switch = KillSwitch::new(dir.path().join("KILL"));
        switch.activate("emergency stop").unwrap();
        assert!(switch.is_active());
        switch.clear().unwrap();
        assert!(!switch.is_active());
    }

    #[test]
    fn clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let switch = KillSwitch::new(dir.path().join("KILL"));
        switch.clear().unwrap();
        switch.clear().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn watch_cancels_token_once_sentinel_appears() {
        let dir = tempfile::tempdir().unwrap();
        let switch = KillSwitch::new(dir.path().join("KILL"));
        let (token, handle) = switch.watch();

        assert!(!token.is_cancelled());
        switch.activate("stop").unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        token.cancelled().await;
        assert!(token.is_cancelled());
        handle.abort();
    }
}
