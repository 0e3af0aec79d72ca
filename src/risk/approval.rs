//! Approval seam consulted before executing a Confirm/RequireApproval task
//! (SPEC_FULL.md §4.5). The concrete y/N prompt is CLI-external; this trait is the
//! gating decision point the core owns, so a Medium/High task never reaches the
//! scheduler without an explicit affirmative.

use super::{RiskAction, RiskLevel};

/// Decides whether a task whose risk action is `Confirm` or `RequireApproval` may
/// proceed. Never consulted for `AutoApprove`/`Reject` levels.
pub trait Approver: Send + Sync {
    fn approve(&self, task: &str, level: RiskLevel, action: RiskAction) -> bool;
}

/// Default-deny: denies every Confirm/RequireApproval request. The safe default for
/// any wiring that hasn't plugged in a real interactive or automated approver, so the
/// "MEDIUM/HIGH require an explicit affirmative" property holds even if nothing else
/// is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DenyingApprover;

impl Approver for DenyingApprover {
    fn approve(&self, _task: &str, _level: RiskLevel, _action: RiskAction) -> bool {
        false
    }
}

/// Always-approve, for tests and for batch/non-interactive wiring that wants
/// Medium/High tasks to proceed without a human in the loop.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoApprover;

impl Approver for AutoApprover {
    fn approve(&self, _task: &str, _level: RiskLevel, _action: RiskAction) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denying_approver_always_denies() {
        let approver = DenyingApprover;
        assert!(!approver.approve("deploy it", RiskLevel::Medium, RiskAction::Confirm));
        assert!(!approver.approve("sudo rm", RiskLevel::High, RiskAction::RequireApproval));
    }

    #[test]
    fn auto_approver_always_approves() {
        let approver = AutoApprover;
        assert!(approver.approve("deploy it", RiskLevel::Medium, RiskAction::Confirm));
    }
}
