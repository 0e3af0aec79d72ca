//! Deterministic textual risk classification over a task description.

use serde::{Deserialize, Serialize};

/// Risk level assigned to a task; ordering matters (`Critical` is the most severe).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// What the default policy does for a given level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskAction {
    AutoApprove,
    Confirm,
    RequireApproval,
    Reject,
}

impl RiskLevel {
    pub fn default_action(self) -> RiskAction {
        match self {
            Self::Low => RiskAction::AutoApprove,
            Self::Medium => RiskAction::Confirm,
            Self::High => RiskAction::RequireApproval,
            Self::Critical => RiskAction::Reject,
        }
    }
}

/// Rule set mapping task text to a level, plus a level->action override table.
///
/// Rules are evaluated Critical first, then High, then Medium; unmatched text is Low.
/// This order is a correctness property, not an implementation detail: a task matching
/// both a High and a Critical rule must classify Critical.
pub struct Policy {
    critical: Vec<String>,
    high: Vec<String>,
    medium: Vec<String>,
    overrides: Vec<(RiskLevel, RiskAction)>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            critical: vec![
                "rm -rf".to_string(),
                "drop database".to_string(),
                "drop table".to_string(),
                "force push".to_string(),
                ":(){ :|:& };:".to_string(),
            ],
            high: vec![
                "delete".to_string(),
                "sudo".to_string(),
                "chmod 777".to_string(),
                "curl | sh".to_string(),
                "format disk".to_string(),
            ],
            medium: vec![
                "migrate".to_string(),
                "deploy".to_string(),
                "publish".to_string(),
                "git push".to_string(),
            ],
            overrides: Vec::new(),
        }
    }
}

impl Policy {
    pub fn with_override(mut self, level: RiskLevel, action: RiskAction) -> Self {
        self.overrides.retain(|(l, _)| *l != level);
        self.overrides.push((level, action));
        self
    }

    pub fn action_for(&self, level: RiskLevel) -> RiskAction {
        self.overrides
            .iter()
            .find(|(l, _)| *l == level)
            .map(|(_, a)| *a)
            .unwrap_or_else(|| level.default_action())
    }

    fn matches_any(haystack: &str, needles: &[String]) -> bool {
        needles.iter().any(|n| haystack.contains(n.as_str()))
    }

    pub fn classify(&self, task: &str) -> RiskLevel {
        let lower = task.to_ascii_lowercase();
        if Self::matches_any(&lower, &self.critical) {
            RiskLevel::Critical
        } else if Self::matches_any(&lower, &self.high) {
            RiskLevel::High
        } else if Self::matches_any(&lower, &self.medium) {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

/// Classify `task` under the default policy.
pub fn classify(task: &str) -> RiskLevel {
    Policy::default().classify(task)
}
