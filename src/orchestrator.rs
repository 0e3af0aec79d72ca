//! Ties the execution plane together end to end: risk classification, the fail-closed
//! gate, planning, DAG validation, scheduled execution, and audit logging / manifest
//! writing (SPEC_FULL.md §2 System Overview).
//!
//! This is the integration point the CLI's `run` subcommand drives; it is also the
//! natural seam for integration tests exercising the numbered scenarios in
//! SPEC_FULL.md §8 without going through the binary.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::audit::{AuditLogger, AuditRecord};
use crate::config::ApexConfig;
use crate::dag::Dag;
use crate::error::{ApexError, Result};
use crate::killswitch::KillSwitch;
use crate::locks::{LockManager, LockOrder};
use crate::manifest::{RunManifest, Snapshot};
use crate::outbox::{self, Outbox};
use crate::planner::Planner;
use crate::risk::{Approver, Policy, RiskAction, RiskLevel};
use crate::scheduler::{Outcome, OutboxRunner, Runner, Scheduler};
use sqlx::sqlite::SqlitePool;

/// Everything the orchestrator needs that outlives a single run.
pub struct Orchestrator {
    pub config: ApexConfig,
    pub audit: Arc<AuditLogger>,
    pub gate: Arc<crate::risk::FailClosedGate>,
    pub risk_policy: Policy,
    pub approver: Arc<dyn Approver>,
    pub outbox: Arc<Outbox>,
    pub db: SqlitePool,
    pub kill_switch: Arc<KillSwitch>,
    pub locks: Arc<LockManager>,
    pub planner: Arc<dyn Planner>,
    pub runner: Arc<dyn Runner>,
    pub workers: usize,
}

/// Outcome of one end-to-end run, enough for the CLI to report and for tests to assert on.
pub struct RunResult {
    pub run_id: Uuid,
    pub outcome: Outcome,
    pub manifest_path: std::path::PathBuf,
}

impl Orchestrator {
    /// Classifies `task`, evaluates the fail-closed gate, and — if admitted — plans,
    /// validates, and executes the resulting DAG, logging the outcome to the audit
    /// chain and writing a run manifest.
    ///
    /// Returns `ApexError::RiskRejected` for tasks whose policy action is `Reject` and
    /// `ApexError::GateDenied` for any denied gate condition, without touching the
    /// scheduler.
    #[instrument(skip(self), fields(task = %task))]
    pub async fn run(&self, task: &str) -> Result<RunResult> {
        let run_id = Uuid::new_v4();
        let started = Instant::now();

        let level = self.risk_policy.classify(task);
        info!(?level, "task classified");

        let action = self.risk_policy.action_for(level);
        if action == RiskAction::Reject {
            self.log_terminal(&run_id, task, level, "failure", Some("risk rejected"), 0)?;
            return Err(ApexError::RiskRejected);
        }

        if matches!(action, RiskAction::Confirm | RiskAction::RequireApproval)
            && !self.approver.approve(task, level, action)
        {
            self.log_terminal(&run_id, task, level, "failure", Some("approval denied"), 0)?;
            return Err(ApexError::ApprovalDenied {
                reason: format!("{level:?} risk task requires an explicit affirmative ({action:?})"),
            });
        }

        if let Err(e) = self.gate.admit() {
            self.log_terminal(&run_id, task, level, "failure", Some(&e.to_string()), 0)?;
            return Err(e);
        }

        let _global = self
            .locks
            .acquire(self.config.global_lock_path(), LockOrder::Global)?;

        outbox::insert_run(&self.db, &run_id.to_string(), task, level_str(level), chrono::Utc::now())
            .await?;

        if level >= RiskLevel::Medium {
            let snapshot = Snapshot::new(self.config.base_dir.clone());
            snapshot.capture_and_record(&self.db, &run_id.to_string()).await;
        }

        let planned = self.planner.plan(task).await?;
        let mut dag = match Dag::new(planned) {
            Ok(dag) => dag,
            Err(e) => {
                self.log_terminal(&run_id, task, level, "failure", Some(&e.to_string()), 0)?;
                outbox::finish_run(&self.db, &run_id.to_string(), "failure", chrono::Utc::now()).await?;
                return Err(e);
            }
        };

        let (kill_token, watch_handle) = self.kill_switch.watch();
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        let watched = kill_token.clone();
        let bridge = tokio::spawn(async move {
            tokio::select! {
                _ = child.cancelled() => {}
                _ = watched.cancelled() => child.cancel(),
            }
        });

        // Each node's execution is tracked as one crash-safe action under the outbox's
        // WAL+DB protocol, keyed to this run's trace id (SPEC_FULL.md §4.3).
        let action_runner: Arc<dyn Runner> = Arc::new(OutboxRunner::new(
            Arc::clone(&self.runner),
            Arc::clone(&self.outbox),
            run_id.to_string(),
        ));

        let scheduler = Scheduler::new(self.workers);
        let outcome = scheduler.execute(&mut dag, action_runner, cancel).await;
        watch_handle.abort();
        bridge.abort();

        let duration_ms = started.elapsed().as_millis() as u64;
        let outcome_str = match outcome {
            Outcome::Success => "success",
            Outcome::PartialFailure => "partial_failure",
            Outcome::Failure => "failure",
            Outcome::Killed => "killed",
        };
        self.log_terminal(&run_id, task, level, outcome_str, None, duration_ms)?;
        outbox::finish_run(&self.db, &run_id.to_string(), outcome_str, chrono::Utc::now()).await?;

        // Keep today's anchor current after every run terminates (SPEC_FULL.md §4.2);
        // a no-op when the chain tip hasn't moved since the last anchor write.
        let _ = crate::audit::maybe_create_anchor(
            &self.audit,
            chrono::Utc::now().date_naive(),
            self.config.risk.git_tag_prefix.as_deref(),
        );

        let manifest = RunManifest::from_run(
            run_id,
            task,
            "mock",
            "medium",
            level,
            &dag,
            outcome,
            duration_ms,
        );
        let manifest_path = manifest.write(&self.config.base_dir)?;

        Ok(RunResult {
            run_id,
            outcome,
            manifest_path,
        })
    }

    fn log_terminal(
        &self,
        run_id: &Uuid,
        task: &str,
        level: RiskLevel,
        outcome: &str,
        error: Option<&str>,
        duration_ms: u64,
    ) -> Result<()> {
        self.audit.log(AuditRecord {
            timestamp: chrono::Utc::now(),
            action_id: run_id.to_string(),
            task: task.to_string(),
            risk_level: level,
            outcome: outcome.to_string(),
            duration_ms,
            model: "mock".to_string(),
            error: error.map(|e| e.to_string()),
            sandbox_level: None,
            prev_hash: String::new(),
            hash: String::new(),
        })?;
        Ok(())
    }
}

fn level_str(level: RiskLevel) -> &'static str {
    match level {
        RiskLevel::Low => "Low",
        RiskLevel::Medium => "Medium",
        RiskLevel::High => "High",
        RiskLevel::Critical => "Critical",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::{Wal, WriterQueue};
    use crate::planner::MockPlanner;
    use crate::risk::{AutoApprover, DenyingApprover, FailClosedGate};
    use crate::scheduler::MockRunner;

    async fn test_orchestrator(dir: &std::path::Path) -> Orchestrator {
        let mut config = ApexConfig::default();
        config.base_dir = dir.to_path_buf();
        config.kill_switch_path = dir.join("KILL");

        let audit = Arc::new(AuditLogger::new(config.audit_dir()).unwrap());
        let kill_switch = Arc::new(KillSwitch::new(config.kill_switch_path.clone()));

        let pool = outbox::open_pool(&config.db_path()).await.unwrap();
        outbox::run_migrations(&pool, &config.db_path()).await.unwrap();
        let queue = WriterQueue::spawn_with_config(
            pool.clone(),
            config.writer_queue.queue_size,
            Arc::clone(&kill_switch),
            crate::outbox::WriterConfig {
                flush: std::time::Duration::from_millis(config.writer_queue.flush_ms),
                max_batch: config.writer_queue.max_batch,
                max_crash_restarts: config.writer_queue.max_crash_restarts,
            },
        );
        let wal = Wal::open(config.wal_path()).unwrap();
        let outbox = Arc::new(Outbox::new(wal, queue));

        let gate = Arc::new(FailClosedGate::new(Vec::new()));

        Orchestrator {
            config,
            audit,
            gate,
            risk_policy: Policy::default(),
            approver: Arc::new(AutoApprover),
            outbox,
            db: pool,
            kill_switch,
            locks: Arc::new(LockManager::new()),
            planner: Arc::new(MockPlanner),
            runner: Arc::new(MockRunner),
            workers: 2,
        }
    }

    #[tokio::test]
    async fn happy_path_run_succeeds_and_writes_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path()).await;

        let result = orchestrator.run("build the login page").await.unwrap();
        assert_eq!(result.outcome, Outcome::Success);
        assert!(result.manifest_path.exists());

        let report = orchestrator.audit.verify().unwrap();
        assert!(report.valid);
    }

    #[tokio::test]
    async fn critical_task_is_rejected_before_planning() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path()).await;

        let err = orchestrator.run("please rm -rf the production database").await.unwrap_err();
        assert!(matches!(err, ApexError::RiskRejected));
    }

    #[tokio::test]
    async fn gate_denial_aborts_before_planning() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path()).await;
        orchestrator.kill_switch.activate("test stop").unwrap();
        orchestrator.gate.set_conditions(vec![Box::new(
            crate::risk::KillSwitchCondition::new(orchestrator.kill_switch.path().to_path_buf()),
        )]);

        let err = orchestrator.run("build the login page").await.unwrap_err();
        assert!(matches!(err, ApexError::GateDenied { .. }));
    }

    #[tokio::test]
    async fn medium_risk_task_is_denied_without_approval() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator {
            approver: Arc::new(DenyingApprover),
            ..test_orchestrator(dir.path()).await
        };

        let err = orchestrator.run("deploy the new service").await.unwrap_err();
        assert!(matches!(err, ApexError::ApprovalDenied { .. }));
    }

    #[tokio::test]
    async fn high_risk_task_proceeds_once_approved() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator {
            approver: Arc::new(AutoApprover),
            ..test_orchestrator(dir.path()).await
        };

        let result = orchestrator.run("run with sudo apt install").await.unwrap();
        assert_eq!(result.outcome, Outcome::Success);
    }
}
