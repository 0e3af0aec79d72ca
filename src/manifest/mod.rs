//! Run manifest writer and git-stash-based snapshot/restore (SPEC_FULL.md §4.8)

mod snapshot;

pub use snapshot::Snapshot;

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use crate::dag::{Dag, NodeStatus};
use crate::error::{ApexError, Result};
use crate::risk::RiskLevel;
use crate::scheduler::Outcome;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestNode {
    pub id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: Uuid,
    pub task: String,
    pub timestamp: chrono::DateTime<Utc>,
    pub model: String,
    pub effort: String,
    pub risk_level: RiskLevel,
    pub node_count: usize,
    pub duration_ms: u64,
    pub outcome: String,
    pub nodes: Vec<ManifestNode>,
}

fn outcome_str(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::Success => "success",
        Outcome::PartialFailure => "partial_failure",
        Outcome::Failure => "failure",
        Outcome::Killed => "killed",
    }
}

fn status_str(status: NodeStatus) -> &'static str {
    match status {
        NodeStatus::Pending => "pending",
        NodeStatus::Running => "running",
        NodeStatus::Completed => "completed",
        NodeStatus::Failed => "failed",
        NodeStatus::Skipped => "skipped",
    }
}

impl RunManifest {
    pub fn from_run(
        run_id: Uuid,
        task: &str,
        model: &str,
        effort: &str,
        risk_level: RiskLevel,
        dag: &Dag,
        outcome: Outcome,
        duration_ms: u64,
    ) -> Self {
        let nodes = dag
            .nodes()
            .map(|n| ManifestNode {
                id: n.id.to_string(),
                status: status_str(n.status).to_string(),
                error: n.error.clone(),
            })
            .collect();

        Self {
            run_id,
            task: task.to_string(),
            timestamp: Utc::now(),
            model: model.to_string(),
            effort: effort.to_string(),
            risk_level,
            node_count: dag.len(),
            duration_ms,
            outcome: outcome_str(outcome).to_string(),
            nodes,
        }
    }

    /// Writes `{base_dir}/runs/{run_id}/manifest.json`.
    #[instrument(skip(self, base_dir))]
    pub fn write(&self, base_dir: impl AsRef<Path>) -> Result<PathBuf> {
        let run_dir = base_dir.as_ref().join("runs").join(self.run_id.to_string());
        std::fs::create_dir_all(&run_dir).map_err(|e| ApexError::ManifestWrite {
            reason: e.to_string(),
        })?;
        let path = run_dir.join("manifest.json");
        let json = serde_json::to_string_pretty(self).map_err(|e| ApexError::ManifestWrite {
            reason: e.to_string(),
        })?;
        std::fs::write(&path, json).map_err(|e| ApexError::ManifestWrite {
            reason: e.to_string(),
        })?;
        Ok(path)
    }
}
