//! Append-only WAL file for the action outbox's "Started / Completed / Failed" trail.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::error::{ApexError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum WalStatus {
    Started,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    pub action_id: String,
    pub trace_id: String,
    pub task: String,
    pub status: WalStatus,
    pub timestamp: chrono::DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WalEntry {
    pub fn started(action_id: impl Into<String>, trace_id: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            action_id: action_id.into(),
            trace_id: trace_id.into(),
            task: task.into(),
            status: WalStatus::Started,
            timestamp: Utc::now(),
            result_ref: None,
            error: None,
        }
    }

    pub fn terminal(&self, status: WalStatus, result_ref: Option<String>, error: Option<String>) -> Self {
        Self {
            action_id: self.action_id.clone(),
            trace_id: self.trace_id.clone(),
            task: self.task.clone(),
            status,
            timestamp: Utc::now(),
            result_ref,
            error,
        }
    }
}

/// Append-only WAL file; every append is immediately flushed and fsynced.
pub struct Wal {
    path: PathBuf,
    writer: Mutex<File>,
}

impl Wal {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ApexError::WalIo {
                reason: e.to_string(),
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| ApexError::WalIo {
                reason: e.to_string(),
            })?;
        Ok(Self {
            path,
            writer: Mutex::new(file),
        })
    }

    #[instrument(skip(self, entry), fields(action_id = %entry.action_id, status = ?entry.status))]
    pub fn append(&self, entry: &WalEntry) -> Result<()> {
        let line = serde_json::to_string(entry).map_err(|e| ApexError::WalIo {
            reason: e.to_string(),
        })?;
        let mut file = self.writer.lock();
        writeln!(file, "{line}").map_err(|e| ApexError::WalIo {
            reason: e.to_string(),
        })?;
        file.flush().map_err(|e| ApexError::WalIo {
            reason: e.to_string(),
        })?;
        file.sync_data().map_err(|e| ApexError::WalIo {
            reason: e.to_string(),
        })?;
        Ok(())
    }

    pub fn read_all(&self) -> Result<Vec<WalEntry>> {
        Self::read_from(&self.path)
    }

    pub fn read_from(path: &Path) -> Result<Vec<WalEntry>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(path).map_err(|e| ApexError::WalIo {
            reason: e.to_string(),
        })?;
        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| ApexError::WalIo {
                reason: e.to_string(),
            })?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line).map_err(|e| ApexError::AuditSerialize {
                reason: e.to_string(),
            })?);
        }
        Ok(entries)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
