//! Apex error types with stable error codes
//!
//! Error code ranges:
//! - APEX-000-009: DAG/validation errors
//! - APEX-010-019: Scheduler/execution errors
//! - APEX-020-029: Audit log errors
//! - APEX-030-039: Outbox/writer-queue errors
//! - APEX-040-049: Lock manager errors
//! - APEX-050-059: Risk/gate errors
//! - APEX-060-069: Sandbox errors
//! - APEX-070-079: Kill-switch errors
//! - APEX-080-089: Manifest/snapshot errors
//! - APEX-090-099: Config/IO errors

use miette::Diagnostic;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ApexError>;

/// Trait for errors that provide operator-facing fix suggestions.
pub trait FixSuggestion {
    fn fix_suggestion(&self) -> Option<&str>;
}

/// All error variants are part of the public API.
#[derive(Error, Debug, Diagnostic)]
#[diagnostic(url(docsrs))]
pub enum ApexError {
    // ═══════════════════════════════════════════
    // DAG / VALIDATION (000-009)
    // ═══════════════════════════════════════════
    #[error("[APEX-000] cycle detected in DAG: {cycle}")]
    #[diagnostic(code(apex::cycle_detected), help("break the cycle named in the path"))]
    CycleDetected { cycle: String },

    #[error("[APEX-001] node '{node_id}' depends on unknown node '{dep_id}'")]
    #[diagnostic(code(apex::unknown_dependency))]
    UnknownDependency { node_id: String, dep_id: String },

    #[error("[APEX-002] duplicate node id '{node_id}'")]
    #[diagnostic(code(apex::duplicate_node_id))]
    DuplicateNodeId { node_id: String },

    #[error("[APEX-003] empty DAG: a run requires at least one node")]
    #[diagnostic(code(apex::empty_dag))]
    EmptyDag,

    // ═══════════════════════════════════════════
    // SCHEDULER / EXECUTION (010-019)
    // ═══════════════════════════════════════════
    #[error("[APEX-010] node '{node_id}' failed: {reason}")]
    #[diagnostic(code(apex::node_failed))]
    NodeFailed { node_id: String, reason: String },

    #[error("[APEX-011] run cancelled: {reason}")]
    #[diagnostic(code(apex::cancelled))]
    Cancelled { reason: String },

    #[error("[APEX-012] scheduler panicked: {reason}")]
    #[diagnostic(code(apex::scheduler_panic))]
    SchedulerPanic { reason: String },

    #[error("[APEX-013] planner returned an invalid plan: {reason}")]
    #[diagnostic(code(apex::invalid_plan))]
    InvalidPlan { reason: String },

    // ═══════════════════════════════════════════
    // AUDIT LOG (020-029)
    // ═══════════════════════════════════════════
    #[error("[APEX-020] audit chain integrity violated at record {index}")]
    #[diagnostic(code(apex::chain_broken), help("run `apex verify-audit` for details"))]
    ChainBroken { index: usize },

    #[error("[APEX-021] audit log I/O failure: {reason}")]
    #[diagnostic(code(apex::audit_io))]
    AuditIo { reason: String },

    #[error("[APEX-022] failed to serialise audit record: {reason}")]
    #[diagnostic(code(apex::audit_serialize))]
    AuditSerialize { reason: String },

    // ═══════════════════════════════════════════
    // OUTBOX / WRITER QUEUE (030-039)
    // ═══════════════════════════════════════════
    #[error("[APEX-030] writer queue is closed")]
    #[diagnostic(code(apex::writer_closed))]
    WriterClosed,

    #[error("[APEX-031] writer queue crashed {restarts} times, exceeding the limit")]
    #[diagnostic(
        code(apex::writer_fatal),
        help("check runtime.db integrity and the kill-switch marker")
    )]
    WriterFatal { restarts: u32 },

    #[error("[APEX-032] database error: {reason}")]
    #[diagnostic(code(apex::db_error))]
    Database { reason: String },

    #[error("[APEX-033] WAL I/O failure: {reason}")]
    #[diagnostic(code(apex::wal_io))]
    WalIo { reason: String },

    // ═══════════════════════════════════════════
    // LOCK MANAGER (040-049)
    // ═══════════════════════════════════════════
    #[error("[APEX-040] lock '{path}' is held by pid {holder_pid}")]
    #[diagnostic(code(apex::lock_held), help("wait for the holder to exit, or check staleness"))]
    LockHeld { path: String, holder_pid: i32 },

    #[error("[APEX-041] lock ordering violation: cannot hold two workspace locks at once")]
    #[diagnostic(code(apex::lock_order_violation))]
    LockOrderViolation,

    #[error("[APEX-042] lock I/O failure on '{path}': {reason}")]
    #[diagnostic(code(apex::lock_io))]
    LockIo { path: String, reason: String },

    // ═══════════════════════════════════════════
    // RISK / GATE (050-059)
    // ═══════════════════════════════════════════
    #[error("[APEX-050] task rejected: risk level is Critical")]
    #[diagnostic(code(apex::risk_rejected))]
    RiskRejected,

    #[error("[APEX-051] run denied by fail-closed gate: {reason}")]
    #[diagnostic(code(apex::gate_denied), help("resolve the listed condition and retry"))]
    GateDenied { reason: String },

    #[error("[APEX-052] invalid risk policy: {reason}")]
    #[diagnostic(code(apex::invalid_risk_policy))]
    InvalidRiskPolicy { reason: String },

    #[error("[APEX-053] run denied: {reason}")]
    #[diagnostic(code(apex::approval_denied), help("obtain an explicit approval and retry"))]
    ApprovalDenied { reason: String },

    // ═══════════════════════════════════════════
    // SANDBOX (060-069)
    // ═══════════════════════════════════════════
    #[error("[APEX-060] sandbox detection failed: {reason}")]
    #[diagnostic(code(apex::sandbox_detect))]
    SandboxDetect { reason: String },

    #[error("[APEX-061] subprocess spawn failed: {reason}")]
    #[diagnostic(code(apex::spawn_failed))]
    SpawnFailed { reason: String },

    // ═══════════════════════════════════════════
    // KILL SWITCH (070-079)
    // ═══════════════════════════════════════════
    #[error("[APEX-070] kill switch I/O failure: {reason}")]
    #[diagnostic(code(apex::kill_switch_io))]
    KillSwitchIo { reason: String },

    // ═══════════════════════════════════════════
    // MANIFEST / SNAPSHOT (080-089)
    // ═══════════════════════════════════════════
    #[error("[APEX-080] failed to write run manifest: {reason}")]
    #[diagnostic(code(apex::manifest_write))]
    ManifestWrite { reason: String },

    #[error("[APEX-081] snapshot operation failed: {reason}")]
    #[diagnostic(code(apex::snapshot_failed))]
    SnapshotFailed { reason: String },

    // ═══════════════════════════════════════════
    // CONFIG / IO (090-099)
    // ═══════════════════════════════════════════
    #[error("[APEX-090] configuration error: {reason}")]
    #[diagnostic(code(apex::config_error), help("check config.toml for syntax errors"))]
    ConfigError { reason: String },

    #[error("[APEX-091] I/O error: {0}")]
    #[diagnostic(code(apex::io_error))]
    Io(#[from] std::io::Error),

    #[error("[APEX-092] JSON error: {0}")]
    #[diagnostic(code(apex::json_error))]
    Json(#[from] serde_json::Error),
}

impl ApexError {
    /// Stable error code, e.g. "APEX-040".
    pub fn code(&self) -> &'static str {
        match self {
            Self::CycleDetected { .. } => "APEX-000",
            Self::UnknownDependency { .. } => "APEX-001",
            Self::DuplicateNodeId { .. } => "APEX-002",
            Self::EmptyDag => "APEX-003",
            Self::NodeFailed { .. } => "APEX-010",
            Self::Cancelled { .. } => "APEX-011",
            Self::SchedulerPanic { .. } => "APEX-012",
            Self::InvalidPlan { .. } => "APEX-013",
            Self::ChainBroken { .. } => "APEX-020",
            Self::AuditIo { .. } => "APEX-021",
            Self::AuditSerialize { .. } => "APEX-022",
            Self::WriterClosed => "APEX-030",
            Self::WriterFatal { .. } => "APEX-031",
            Self::Database { .. } => "APEX-032",
            Self::WalIo { .. } => "APEX-033",
            Self::LockHeld { .. } => "APEX-040",
            Self::LockOrderViolation => "APEX-041",
            Self::LockIo { .. } => "APEX-042",
            Self::RiskRejected => "APEX-050",
            Self::GateDenied { .. } => "APEX-051",
            Self::InvalidRiskPolicy { .. } => "APEX-052",
            Self::ApprovalDenied { .. } => "APEX-053",
            Self::SandboxDetect { .. } => "APEX-060",
            Self::SpawnFailed { .. } => "APEX-061",
            Self::KillSwitchIo { .. } => "APEX-070",
            Self::ManifestWrite { .. } => "APEX-080",
            Self::SnapshotFailed { .. } => "APEX-081",
            Self::ConfigError { .. } => "APEX-090",
            Self::Io(_) => "APEX-091",
            Self::Json(_) => "APEX-092",
        }
    }

    /// Whether retrying the same operation might succeed without operator intervention.
    ///
    /// Node-level and contention errors are locally recoverable; chain/lock corruption
    /// and fatal scheduler errors are not (see SPEC_FULL.md §7).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NodeFailed { .. } | Self::LockHeld { .. } | Self::Cancelled { .. } | Self::ApprovalDenied { .. }
        )
    }
}

impl FixSuggestion for ApexError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            Self::CycleDetected { .. } => Some("remove the dependency edge that closes the cycle"),
            Self::UnknownDependency { .. } => {
                Some("fix the `depends` list to reference an existing node id")
            }
            Self::DuplicateNodeId { .. } => Some("give each node a unique id"),
            Self::EmptyDag => Some("the planner must return at least one node"),
            Self::NodeFailed { .. } => Some("inspect the node's Runner output and audit record"),
            Self::Cancelled { .. } => Some("re-run once the kill switch is cleared"),
            Self::SchedulerPanic { .. } => {
                Some("this is a scheduler bug; file a report with the panic message")
            }
            Self::InvalidPlan { .. } => {
                Some("check the planner output matches {id, task, depends}")
            }
            Self::ChainBroken { .. } => Some(
                "the audit chain cannot be trusted past this index; investigate before re-anchoring",
            ),
            Self::AuditIo { .. } => Some("check audit/ directory permissions and disk space"),
            Self::AuditSerialize { .. } => Some("this is a bug: audit records must be serialisable"),
            Self::WriterClosed => Some("the writer queue already shut down; restart the process"),
            Self::WriterFatal { .. } => Some("check runtime.db, clear the kill switch, then restart"),
            Self::Database { .. } => Some("check runtime.db integrity and migrations"),
            Self::WalIo { .. } => Some("check actions_wal.jsonl permissions and disk space"),
            Self::LockHeld { .. } => {
                Some("wait for the holder to exit, or verify it is stale and remove the lock")
            }
            Self::LockOrderViolation => {
                Some("release the first workspace lock before acquiring another")
            }
            Self::LockIo { .. } => Some("check lock file permissions"),
            Self::RiskRejected => Some("split the task or request an explicit override"),
            Self::GateDenied { .. } => Some("resolve the condition named in the reason and retry"),
            Self::InvalidRiskPolicy { .. } => Some("check the risk policy configuration"),
            Self::ApprovalDenied { .. } => Some("re-run once an explicit approval is given"),
            Self::SandboxDetect { .. } => {
                Some("install docker, or configure a weaker sandbox level explicitly")
            }
            Self::SpawnFailed { .. } => Some("check the binary path and sandbox arguments"),
            Self::KillSwitchIo { .. } => Some("check the kill-switch path permissions"),
            Self::ManifestWrite { .. } => Some("check runs/ directory permissions"),
            Self::SnapshotFailed { .. } => Some("check that the working tree is a git repository"),
            Self::ConfigError { .. } => Some("check ~/.config/apex/config.toml for syntax errors"),
            Self::Io(_) => Some("check file paths and permissions"),
            Self::Json(_) => Some("check JSON syntax"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_extraction() {
        let err = ApexError::LockOrderViolation;
        assert_eq!(err.code(), "APEX-041");
    }

    #[test]
    fn error_display_includes_code() {
        let err = ApexError::NodeFailed {
            node_id: "a".into(),
            reason: "boom".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("[APEX-010]"));
        assert!(msg.contains("boom"));
    }

    #[test]
    fn recoverable_classification() {
        assert!(ApexError::NodeFailed {
            node_id: "a".into(),
            reason: "x".into()
        }
        .is_recoverable());
        assert!(!ApexError::ChainBroken { index: 3 }.is_recoverable());
        assert!(!ApexError::LockOrderViolation.is_recoverable());
    }

    #[test]
    fn representative_variants_have_fix_suggestions() {
        assert!(ApexError::LockHeld {
            path: "x".into(),
            holder_pid: 1
        }
        .fix_suggestion()
        .is_some());
    }
}
