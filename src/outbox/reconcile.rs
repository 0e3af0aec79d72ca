//! Reconciliation: classify every `Started` WAL entry as completed, failed, or orphaned.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::error::Result;

use super::wal::{Wal, WalEntry, WalStatus};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Orphan {
    pub action_id: String,
    pub trace_id: String,
    pub task: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// Reads the WAL, groups entries by `action_id`, and returns every action whose only
/// record is `Started` (SPEC_FULL.md §4.3).
#[instrument(skip(wal))]
pub fn reconcile(wal: &Wal) -> Result<Vec<Orphan>> {
    let entries = wal.read_all()?;
    reconcile_entries(entries)
}

fn reconcile_entries(entries: Vec<WalEntry>) -> Result<Vec<Orphan>> {
    let mut by_action: HashMap<String, Vec<WalEntry>> = HashMap::new();
    for entry in entries {
        by_action.entry(entry.action_id.clone()).or_default().push(entry);
    }

    let mut orphans = Vec::new();
    for (action_id, mut group) in by_action {
        group.sort_by_key(|e| e.timestamp);
        let has_terminal = group
            .iter()
            .any(|e| matches!(e.status, WalStatus::Completed | WalStatus::Failed));
        if !has_terminal {
            if let Some(started) = group.iter().find(|e| e.status == WalStatus::Started) {
                orphans.push(Orphan {
                    action_id: action_id.clone(),
                    trace_id: started.trace_id.clone(),
                    task: started.task.clone(),
                    started_at: started.timestamp,
                });
            }
        }
    }

    orphans.sort_by_key(|o| o.started_at);
    info!(count = orphans.len(), "reconciliation found orphaned actions");
    Ok(orphans)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn started_with_no_terminal_is_an_orphan() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Wal::open(dir.path().join("actions_wal.jsonl")).unwrap();
        wal.append(&WalEntry::started("a1", "t1", "do it")).unwrap();

        let orphans = reconcile(&wal).unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].action_id, "a1");
    }

    #[test]
    fn started_then_completed_is_not_an_orphan() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Wal::open(dir.path().join("actions_wal.jsonl")).unwrap();
        let started = WalEntry::started("a1", "t1", "do it");
        wal.append(&started).unwrap();
        wal.append(&started.terminal(WalStatus::Completed, Some("r".to_string()), None))
            .unwrap();

        let orphans = reconcile(&wal).unwrap();
        assert!(orphans.is_empty());
    }

    #[test]
    fn multiple_actions_classified_independently() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Wal::open(dir.path().join("actions_wal.jsonl")).unwrap();

        let done = WalEntry::started("done", "t", "x");
        wal.append(&done).unwrap();
        wal.append(&done.terminal(WalStatus::Completed, None, None)).unwrap();

        let failed = WalEntry::started("failed", "t", "y");
        wal.append(&failed).unwrap();
        wal.append(&failed.terminal(WalStatus::Failed, None, Some("boom".to_string())))
            .unwrap();

        wal.append(&WalEntry::started("orphan", "t", "z")).unwrap();

        let orphans = reconcile(&wal).unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].action_id, "orphan");
    }
}
