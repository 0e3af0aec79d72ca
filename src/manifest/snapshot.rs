//! Git-stash-based working tree snapshot/restore, invoked before runs whose risk is
//! Medium or above (SPEC_FULL.md §4.8). A no-op outside a git work tree.

use std::path::{Path, PathBuf};
use std::process::Command;

use sqlx::sqlite::SqlitePool;
use tracing::{info, instrument, warn};

use crate::error::{ApexError, Result};

const STATE_KEY_PREFIX: &str = "snapshot:";

/// Captures `git stash create` output (a commit-ish) keyed by run id, for later restore.
pub struct Snapshot {
    work_dir: PathBuf,
}

impl Snapshot {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }

    fn is_git_repo(&self) -> bool {
        Command::new("git")
            .args(["rev-parse", "--is-inside-work-tree"])
            .current_dir(&self.work_dir)
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// Captures the working tree via `git stash create`. Returns `None` outside a git
    /// work tree or when there is nothing to stash (a clean tree); logs, never fails.
    #[instrument(skip(self))]
    pub fn capture(&self, run_id: &str) -> Option<String> {
        if !self.is_git_repo() {
            info!(run_id, "snapshot skipped: not a git work tree");
            return None;
        }

        let output = Command::new("git")
            .args(["stash", "create"])
            .current_dir(&self.work_dir)
            .output();

        match output {
            Ok(out) if out.status.success() => {
                let commit = String::from_utf8_lossy(&out.stdout).trim().to_string();
                if commit.is_empty() {
                    info!(run_id, "snapshot skipped: clean working tree");
                    None
                } else {
                    info!(run_id, commit = %commit, "captured working tree snapshot");
                    Some(commit)
                }
            }
            Ok(out) => {
                warn!(run_id, stderr = %String::from_utf8_lossy(&out.stderr), "git stash create failed");
                None
            }
            Err(e) => {
                warn!(run_id, error = %e, "failed to invoke git for snapshot");
                None
            }
        }
    }

    /// Restores a previously captured commit-ish via `git stash apply`.
    #[instrument(skip(self))]
    pub fn restore(&self, commit: &str) -> Result<()> {
        if !self.is_git_repo() {
            return Err(ApexError::SnapshotFailed {
                reason: format!("{} is not a git work tree", self.work_dir.display()),
            });
        }

        let output = Command::new("git")
            .args(["stash", "apply", commit])
            .current_dir(&self.work_dir)
            .output()
            .map_err(|e| ApexError::SnapshotFailed {
                reason: e.to_string(),
            })?;

        if output.status.success() {
            info!(commit, "restored working tree from snapshot");
            Ok(())
        } else {
            Err(ApexError::SnapshotFailed {
                reason: String::from_utf8_lossy(&output.stderr).to_string(),
            })
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Captures the working tree and persists `run_id -> commit` in the `state` KV
    /// table so `restore_by_run_id` can look it up later (SPEC_FULL.md §4.8). Persistence
    /// failures are logged, not propagated — snapshotting stays best-effort.
    #[instrument(skip(self, pool))]
    pub async fn capture_and_record(&self, pool: &SqlitePool, run_id: &str) -> Option<String> {
        let commit = self.capture(run_id)?;
        if let Err(e) = crate::outbox::set_state(pool, &state_key(run_id), &commit).await {
            warn!(run_id, error = %e, "failed to persist snapshot commit");
        }
        Some(commit)
    }

    /// Looks up the commit captured for `run_id` and restores it.
    #[instrument(skip(self, pool))]
    pub async fn restore_by_run_id(&self, pool: &SqlitePool, run_id: &str) -> Result<()> {
        let commit = crate::outbox::get_state(pool, &state_key(run_id))
            .await?
            .ok_or_else(|| ApexError::SnapshotFailed {
                reason: format!("no snapshot recorded for run {run_id}"),
            })?;
        self.restore(&commit)
    }
}

fn state_key(run_id: &str) -> String {
    format!("{STATE_KEY_PREFIX}{run_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_is_a_logged_no_op_outside_a_git_repo() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = Snapshot::new(dir.path());
        assert_eq!(snapshot.capture("run-1"), None);
    }

    #[test]
    fn restore_fails_outside_a_git_repo() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = Snapshot::new(dir.path());
        let err = snapshot.restore("deadbeef").unwrap_err();
        assert!(matches!(err, ApexError::SnapshotFailed { .. }));
    }

    #[tokio::test]
    async fn capture_and_record_is_a_no_op_outside_a_git_repo_but_still_persists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::outbox::open_pool(&dir.path().join("runtime.db")).await.unwrap();
        crate::outbox::run_migrations(&pool, &dir.path().join("runtime.db")).await.unwrap();

        let snapshot = Snapshot::new(dir.path());
        assert_eq!(snapshot.capture_and_record(&pool, "run-1").await, None);
        assert_eq!(
            crate::outbox::get_state(&pool, &state_key("run-1")).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn restore_by_run_id_fails_when_nothing_was_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::outbox::open_pool(&dir.path().join("runtime.db")).await.unwrap();
        crate::outbox::run_migrations(&pool, &dir.path().join("runtime.db")).await.unwrap();

        let snapshot = Snapshot::new(dir.path());
        let err = snapshot.restore_by_run_id(&pool, "missing-run").await.unwrap_err();
        assert!(matches!(err, ApexError::SnapshotFailed { .. }));
    }

    #[tokio::test]
    async fn restore_by_run_id_looks_up_the_recorded_commit() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::outbox::open_pool(&dir.path().join("runtime.db")).await.unwrap();
        crate::outbox::run_migrations(&pool, &dir.path().join("runtime.db")).await.unwrap();

        // Record a commit directly, as `capture_and_record` would for a real git repo.
        crate::outbox::set_state(&pool, &state_key("run-2"), "deadbeef").await.unwrap();

        // Outside a git work tree `restore` itself fails, but only after the lookup
        // succeeded — proving `restore_by_run_id` resolved "run-2" to "deadbeef".
        let snapshot = Snapshot::new(dir.path());
        let err = snapshot.restore_by_run_id(&pool, "run-2").await.unwrap_err();
        assert!(matches!(err, ApexError::SnapshotFailed { ref reason } if !reason.contains("no snapshot recorded")));
    }
}
