//! Two-level file-lock manager: global (order 0) and workspace (order 1) advisory
//! flocks, preventing the classic A→B / B→A deadlock between concurrent workspace
//! operations (SPEC_FULL.md §4.4).

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::Utc;
use dashmap::DashMap;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::error::{ApexError, Result};

/// Lock hierarchy position; only order 0 (global) may coexist with order 1 (workspace).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockOrder {
    Global = 0,
    Workspace = 1,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockMeta {
    pid: u32,
    acquired_at: chrono::DateTime<Utc>,
    order: LockOrder,
    version: u32,
}

/// An acquired lock; dropping it releases the OS-level flock and removes the held-set
/// entry. The `.meta` sidecar is removed best-effort.
pub struct LockGuard<'a> {
    manager: &'a LockManager,
    path: PathBuf,
    _file: File,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        // `_file`'s drop releases the OS flock; we just clean up bookkeeping here.
        let _ = std::fs::remove_file(meta_path(&self.path));
        self.manager.held.remove(&self.path);
    }
}

fn meta_path(lock_path: &Path) -> PathBuf {
    let mut meta = lock_path.to_path_buf();
    let name = format!(
        "{}.meta",
        meta.file_name().and_then(|n| n.to_str()).unwrap_or("lock")
    );
    meta.set_file_name(name);
    meta
}

/// Tracks every lock this process currently holds and enforces the ordering rule.
pub struct LockManager {
    held: DashMap<PathBuf, LockOrder>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self { held: DashMap::new() }
    }

    /// Acquire `path` at the given order, failing fast (non-blocking) on contention.
    #[instrument(skip(self), fields(path = %path.as_ref().display(), ?order))]
    pub fn acquire(&self, path: impl AsRef<Path>, order: LockOrder) -> Result<LockGuard<'_>> {
        let path = path.as_ref().to_path_buf();

        if order == LockOrder::Workspace
            && self.held.iter().any(|entry| *entry.value() == LockOrder::Workspace)
        {
            return Err(ApexError::LockOrderViolation);
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ApexError::LockIo {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .map_err(|e| ApexError::LockIo {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        if file.try_lock_exclusive().is_err() {
            let holder_pid = read_meta(&path).map(|m| m.pid as i32).unwrap_or(-1);
            return Err(ApexError::LockHeld {
                path: path.display().to_string(),
                holder_pid,
            });
        }

        let meta = LockMeta {
            pid: std::process::id(),
            acquired_at: Utc::now(),
            order,
            version: 1,
        };
        let json = serde_json::to_string(&meta).map_err(|e| ApexError::LockIo {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        std::fs::write(meta_path(&path), json).map_err(|e| ApexError::LockIo {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        self.held.insert(path.clone(), order);
        info!(path = %path.display(), "lock acquired");

        Ok(LockGuard {
            manager: self,
            path,
            _file: file,
        })
    }

    /// Whether the process recorded in `path`'s `.meta` sidecar is still alive.
    ///
    /// Returns `true` (stale) if the meta file is missing or malformed, or the PID no
    /// longer exists per `kill -0`. Callers may remove a lock found stale.
    pub fn is_stale(&self, path: impl AsRef<Path>) -> bool {
        match read_meta(path.as_ref()) {
            Some(meta) => unsafe { libc::kill(meta.pid as libc::pid_t, 0) != 0 },
            None => true,
        }
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }
}

fn read_meta(lock_path: &Path) -> Option<LockMeta> {
    let contents = std::fs::read_to_string(meta_path(lock_path)).ok()?;
    serde_json::from_str(&contents).ok()
}
